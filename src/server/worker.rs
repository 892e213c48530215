//! Execution context shared by every listener of a server instance.
//!
//! A [`Worker`] owns two tokio runtimes. The I/O runtime, sized by the I/O
//! thread count, drives accept loops and connections. Handler executions run
//! on the handler runtime, sized by the worker thread count, and pass the
//! task gate first so no more than that many are in flight. The connection
//! gate enforces the high/low water marks on open connections.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use futures_util::future::BoxFuture;
use log::{error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::{Handle, Runtime},
    sync::{watch, Semaphore},
    task::JoinHandle,
};

use crate::{
    errors::{LifecycleError, PorticoError, StartError},
    server::virtual_host::Handler,
    Request,
};

/// Open connection limit at which accepting pauses.
pub const CONNECTION_HIGH_WATER: usize = 1_000_000;
/// Open connection count at which accepting resumes after a pause.
pub const CONNECTION_LOW_WATER: usize = 1_000_000;

const DEFAULT_BACKLOG: i32 = 1024;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(50);

/// Settings of the worker runtime.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerOptions {
    pub io_threads: usize,
    pub worker_threads: usize,
    pub connection_high_water: usize,
    pub connection_low_water: usize,
    pub tcp_nodelay: bool,
    pub cork: bool,
}

impl WorkerOptions {
    pub fn new(io_threads: usize, worker_threads: usize) -> Self {
        Self {
            io_threads,
            worker_threads,
            connection_high_water: CONNECTION_HIGH_WATER,
            connection_low_water: CONNECTION_LOW_WATER,
            tcp_nodelay: true,
            cork: true,
        }
    }
}

/// Settings of one listening socket.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SocketOptions {
    /// Number of concurrent accept loops on the socket.
    pub accept_threads: usize,
    pub tcp_nodelay: bool,
    pub reuse_address: bool,
    pub backlog: i32,
}

impl SocketOptions {
    pub fn new(accept_threads: usize) -> Self {
        Self { accept_threads, tcp_nodelay: true, reuse_address: true, backlog: DEFAULT_BACKLOG }
    }
}

/// Counts open connections against the water marks.
///
/// Once the count reaches the high mark, new connections are refused until
/// it drops to the low mark.
#[derive(Clone, Debug)]
pub struct ConnectionGate {
    inner: Arc<GateInner>,
}

#[derive(Debug)]
struct GateInner {
    active: AtomicUsize,
    paused: AtomicBool,
    high_water: usize,
    low_water: usize,
}

impl ConnectionGate {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                active: AtomicUsize::new(0),
                paused: AtomicBool::new(false),
                high_water,
                low_water: low_water.min(high_water),
            }),
        }
    }

    /// Registers a new connection, or refuses it when over the limit.
    pub fn try_acquire(&self) -> Option<ConnectionPermit> {
        let inner = &self.inner;

        if inner
            .paused
            .load(Ordering::Acquire)
        {
            if inner
                .active
                .load(Ordering::Acquire)
                > inner.low_water
            {
                return None;
            }
            inner
                .paused
                .store(false, Ordering::Release);
        }

        let previous = inner
            .active
            .fetch_add(1, Ordering::AcqRel);
        if previous >= inner.high_water {
            inner
                .active
                .fetch_sub(1, Ordering::AcqRel);
            inner
                .paused
                .store(true, Ordering::Release);
            return None;
        }

        Some(ConnectionPermit { inner: inner.clone() })
    }

    pub fn active(&self) -> usize {
        self.inner
            .active
            .load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.inner
            .paused
            .load(Ordering::Acquire)
    }
}

/// An open connection slot; released on drop.
#[derive(Debug)]
pub struct ConnectionPermit {
    inner: Arc<GateInner>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.inner
            .active
            .fetch_sub(1, Ordering::AcqRel);
    }
}

/// Runs handler executions on the handler runtime, at most one per worker
/// thread at a time.
#[derive(Clone, Debug)]
pub struct TaskGate {
    permits: Arc<Semaphore>,
    handle: Handle,
}

impl TaskGate {
    pub fn new(worker_threads: usize, handle: Handle) -> Self {
        Self { permits: Arc::new(Semaphore::new(worker_threads.max(1))), handle }
    }

    pub fn available(&self) -> usize {
        self.permits
            .available_permits()
    }

    /// Wraps `handler` so each execution holds one task permit and runs on
    /// the handler runtime.
    pub fn wrap(&self, handler: Handler) -> Handler {
        let permits = self
            .permits
            .clone();
        let handle = self
            .handle
            .clone();
        Arc::new(move |request: Request| {
            let permits = permits.clone();
            let handle = handle.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| PorticoError::Lifecycle(LifecycleError::WorkerShutdown))?;

                let execution = handle.spawn(async move {
                    let _permit = permit;
                    handler(request).await
                });

                match execution.await {
                    Ok(result) => result,
                    Err(e) if e.is_cancelled() => {
                        Err(PorticoError::Lifecycle(LifecycleError::WorkerShutdown))
                    }
                    Err(e) => Err(PorticoError::Handler(format!("handler panicked: {}", e))),
                }
            })
        })
    }

    fn close(&self) {
        self.permits
            .close();
    }
}

/// Called for every accepted connection; the returned future serves it.
pub type AcceptListener = Arc<dyn Fn(TcpStream, SocketAddr) -> BoxFuture<'static, ()> + Send + Sync>;

/// Runtimes and gates shared by the listeners of one server instance.
pub struct Worker {
    runtime: Option<Runtime>,
    handlers: Option<Runtime>,
    options: WorkerOptions,
    connections: ConnectionGate,
    tasks: TaskGate,
}

impl Worker {
    pub fn create(options: WorkerOptions) -> Result<Self, PorticoError> {
        if options.io_threads == 0 || options.worker_threads == 0 {
            return Err(StartError::Worker("thread counts must be positive".to_string()).into());
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(options.io_threads)
            .thread_name("portico-io")
            .enable_all()
            .build()
            .map_err(|e| StartError::Worker(e.to_string()))?;
        let handlers = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(options.worker_threads)
            .max_blocking_threads(options.worker_threads)
            .thread_name("portico-worker")
            .enable_all()
            .build()
        {
            Ok(handlers) => handlers,
            Err(e) => {
                runtime.shutdown_background();
                return Err(StartError::Worker(e.to_string()).into());
            }
        };

        let connections =
            ConnectionGate::new(options.connection_high_water, options.connection_low_water);
        let tasks = TaskGate::new(
            options.worker_threads,
            handlers
                .handle()
                .clone(),
        );

        Ok(Self { runtime: Some(runtime), handlers: Some(handlers), options, connections, tasks })
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn task_gate(&self) -> &TaskGate {
        &self.tasks
    }

    pub fn connection_gate(&self) -> &ConnectionGate {
        &self.connections
    }

    pub fn handle(&self) -> Result<Handle, PorticoError> {
        self.runtime
            .as_ref()
            .map(|runtime| {
                runtime
                    .handle()
                    .clone()
            })
            .ok_or(PorticoError::Lifecycle(LifecycleError::WorkerShutdown))
    }

    /// Binds a listening socket on `addr`. Accepting starts with
    /// [`AcceptingChannel::resume_accepting`].
    pub fn create_listening_socket(
        &self,
        addr: SocketAddr,
        accept: AcceptListener,
        options: &SocketOptions,
    ) -> Result<AcceptingChannel, PorticoError> {
        let handle = self.handle()?;
        let bind_error = |e: std::io::Error| PorticoError::Bind(format!("{}: {}", addr, e));

        let socket =
            Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_error)?;
        socket
            .set_reuse_address(options.reuse_address)
            .map_err(bind_error)?;
        socket
            .set_nonblocking(true)
            .map_err(bind_error)?;
        socket
            .bind(&addr.into())
            .map_err(bind_error)?;
        socket
            .listen(options.backlog)
            .map_err(bind_error)?;

        let listener = {
            let _guard = handle.enter();
            TcpListener::from_std(socket.into()).map_err(bind_error)?
        };
        let local_addr = listener
            .local_addr()
            .map_err(bind_error)?;

        Ok(AcceptingChannel {
            listener: Some(Arc::new(listener)),
            local_addr,
            accept,
            options: options.clone(),
            handle,
            connections: self
                .connections
                .clone(),
            shutdown: None,
            stopped: Vec::new(),
            tasks: Vec::new(),
        })
    }

    /// Stops both runtimes without waiting for in-flight work.
    ///
    /// Pending handler executions fail with
    /// [`LifecycleError::WorkerShutdown`].
    pub fn shutdown(mut self) {
        self.shutdown_runtime();
    }

    fn shutdown_runtime(&mut self) {
        self.tasks
            .close();
        if let Some(runtime) = self
            .runtime
            .take()
        {
            runtime.shutdown_background();
        }
        if let Some(handlers) = self
            .handlers
            .take()
        {
            handlers.shutdown_background();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown_runtime();
    }
}

/// A bound listening socket.
pub struct AcceptingChannel {
    listener: Option<Arc<TcpListener>>,
    local_addr: SocketAddr,
    accept: AcceptListener,
    options: SocketOptions,
    handle: Handle,
    connections: ConnectionGate,
    shutdown: Option<watch::Sender<bool>>,
    stopped: Vec<mpsc::Receiver<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl AcceptingChannel {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_open(&self) -> bool {
        self.listener
            .is_some()
    }

    pub fn is_accepting(&self) -> bool {
        !self
            .tasks
            .is_empty()
    }

    /// Starts the accept loops. Does nothing when already accepting or
    /// closed.
    pub fn resume_accepting(&mut self) {
        let Some(listener) = self.listener.clone() else {
            return;
        };
        if self.is_accepting() {
            return;
        }

        let (shutdown, signal) = watch::channel(false);

        for _ in 0..self
            .options
            .accept_threads
            .max(1)
        {
            let (stopped_tx, stopped_rx) = mpsc::channel();
            let accept_loop = AcceptLoop {
                listener: listener.clone(),
                accept: self
                    .accept
                    .clone(),
                connections: self
                    .connections
                    .clone(),
                handle: self
                    .handle
                    .clone(),
                tcp_nodelay: self
                    .options
                    .tcp_nodelay,
            };

            let task = self
                .handle
                .spawn(accept_loop.run(signal.clone(), stopped_tx));
            self.tasks
                .push(task);
            self.stopped
                .push(stopped_rx);
        }

        self.shutdown = Some(shutdown);
    }

    /// Stops accepting and releases the socket. Closing twice is a no-op.
    ///
    /// Returns once every accept loop let go of the socket, so the address
    /// can be bound again right away.
    pub fn close(&mut self) -> Result<(), PorticoError> {
        let Some(listener) = self
            .listener
            .take()
        else {
            return Ok(());
        };
        drop(listener);

        if let Some(shutdown) = self
            .shutdown
            .take()
        {
            let _ = shutdown.send(true);
        }

        let mut timed_out = false;
        for stopped in self
            .stopped
            .drain(..)
        {
            if let Err(mpsc::RecvTimeoutError::Timeout) = stopped.recv_timeout(CLOSE_TIMEOUT) {
                timed_out = true;
            }
        }
        for task in self
            .tasks
            .drain(..)
        {
            task.abort();
        }

        info!("Closed listener on {}", self.local_addr);

        if timed_out {
            return Err(PorticoError::Stop(format!(
                "accept loop on {} did not stop in time",
                self.local_addr
            )));
        }

        Ok(())
    }
}

impl Drop for AcceptingChannel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("{}", e);
        }
    }
}

struct AcceptLoop {
    listener: Arc<TcpListener>,
    accept: AcceptListener,
    connections: ConnectionGate,
    handle: Handle,
    tcp_nodelay: bool,
}

impl AcceptLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>, stopped: mpsc::Sender<()>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = self.listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            accept_failed(&e).await;
                            continue;
                        }
                    };

                    let Some(permit) = self
                        .connections
                        .try_acquire()
                    else {
                        warn!("Connection limit reached, refusing {}", peer_addr);
                        continue;
                    };

                    if let Err(e) = stream.set_nodelay(self.tcp_nodelay) {
                        error!("Cannot set TCP_NODELAY: {}", e);
                    }

                    let connection = (self.accept)(stream, peer_addr);
                    self.handle
                        .spawn(async move {
                            connection.await;
                            drop(permit);
                        });
                }
            }
        }

        drop(self);
        let _ = stopped.send(());
    }
}

/// Logs an accept failure and holds the loop back briefly, so a full file
/// descriptor table does not turn the loop into a busy spin.
pub(crate) async fn accept_failed(e: &std::io::Error) {
    error!("Cannot accept connection: {}", e);
    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
}
