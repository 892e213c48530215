use std::{net::SocketAddr, sync::Arc};

use log::{debug, error, info, warn};

use crate::{
    config::{ListenerConfig, ListenerProtocol, ServerConfig},
    errors::{ConfigError, LifecycleError, PorticoError},
    server::{
        buffer_pool::BufferPool,
        chain::build_handler_chain,
        conn::{http::HttpCodecFactory, CodecFactory, Connection, Io, OpenListener},
        handlers::transfer_encoding_handler,
        virtual_host::Handler,
        worker::{AcceptListener, AcceptingChannel, SocketOptions, Worker, WorkerOptions},
        Server,
    },
};

#[cfg(feature = "tokio-rust-tls")]
use crate::server::tls::{self, TlsFactory};

#[cfg(not(feature = "tokio-rust-tls"))]
use crate::errors::StartError;

/// Opens the configured listeners and owns them while the server runs.
#[derive(Default)]
pub struct ListenerManager {
    worker: Option<Worker>,
    channels: Vec<AcceptingChannel>,
}

impl ListenerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .is_some()
    }

    fn open_listener(
        worker: &Worker,
        pool: &BufferPool,
        config: &ServerConfig,
        listener: &ListenerConfig,
        root: Handler,
    ) -> Result<AcceptingChannel, PorticoError> {
        let protocol = listener.protocol();
        let factory: Arc<dyn CodecFactory> = match (config.codec(protocol), protocol) {
            (Some(factory), _) => factory,
            (None, ListenerProtocol::Http | ListenerProtocol::Https) => Arc::new(
                HttpCodecFactory::new().with_cork(
                    worker
                        .options()
                        .cork,
                ),
            ),
            (None, ListenerProtocol::Ajp) => {
                return Err(ConfigError::Listener(
                    "no codec registered for AJP listeners".to_string(),
                )
                .into());
            }
        };

        let handler = match protocol {
            ListenerProtocol::Http | ListenerProtocol::Https => transfer_encoding_handler(root),
            ListenerProtocol::Ajp => root,
        };
        let handler = worker
            .task_gate()
            .wrap(handler);

        let mut codec = factory.create(pool.clone(), config.buffer_size());
        codec.set_root_handler(handler);
        let codec: Arc<dyn OpenListener> = Arc::from(codec);

        let accept = match protocol {
            ListenerProtocol::Https => secure_accept(listener, codec)?,
            ListenerProtocol::Http | ListenerProtocol::Ajp => plain_accept(codec),
        };

        let addr = listener.socket_addr()?;
        let mut channel =
            worker.create_listening_socket(addr, accept, &SocketOptions::new(config.io_threads()))?;
        channel.resume_accepting();

        info!("{} listener started on {}", protocol, channel.local_addr());

        Ok(channel)
    }

    fn rollback(channels: Vec<AcceptingChannel>, worker: Worker) {
        for mut channel in channels {
            if let Err(e) = channel.close() {
                warn!("Rollback: {}", e);
            }
        }
        worker.shutdown();
    }
}

impl Server for ListenerManager {
    fn start(&mut self, config: &ServerConfig) -> Result<(), PorticoError> {
        if self.is_running() {
            return Err(LifecycleError::AlreadyRunning.into());
        }

        let root = build_handler_chain(config.hosts())?;
        let pool =
            BufferPool::new(config.buffer_size(), config.buffers_per_region(), config.direct_buffers());
        let worker = Worker::create(WorkerOptions::new(config.io_threads(), config.worker_threads()))?;

        let mut channels = Vec::with_capacity(
            config
                .listeners()
                .len(),
        );
        for listener in config.listeners() {
            match Self::open_listener(&worker, &pool, config, listener, root.clone()) {
                Ok(channel) => channels.push(channel),
                Err(e) => {
                    error!(
                        "Cannot start {} listener on {}:{}: {}",
                        listener.protocol(),
                        listener.host(),
                        listener.port(),
                        e
                    );
                    Self::rollback(channels, worker);
                    return Err(e);
                }
            }
        }

        self.worker = Some(worker);
        self.channels = channels;

        Ok(())
    }

    fn stop(&mut self) -> Result<(), PorticoError> {
        let Some(worker) = self
            .worker
            .take()
        else {
            return Ok(());
        };

        let mut failures = Vec::new();
        for mut channel in self
            .channels
            .drain(..)
        {
            if let Err(e) = channel.close() {
                error!("{}", e);
                failures.push(e.to_string());
            }
        }
        worker.shutdown();

        if !failures.is_empty() {
            return Err(PorticoError::Stop(failures.join("; ")));
        }

        info!("All listeners stopped");
        Ok(())
    }

    fn listening_addresses(&self) -> Vec<SocketAddr> {
        self.channels
            .iter()
            .map(AcceptingChannel::local_addr)
            .collect()
    }
}

impl Drop for ListenerManager {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("{}", e);
        }
    }
}

fn plain_accept(codec: Arc<dyn OpenListener>) -> AcceptListener {
    Arc::new(move |stream, peer_addr| {
        let served = codec.handle_connection(Connection::new(Io::Plain(stream), peer_addr));
        Box::pin(async move {
            if let Err(e) = served.await {
                debug!("Connection from {} ended: {}", peer_addr, e);
            }
        })
    })
}

#[cfg(feature = "tokio-rust-tls")]
fn secure_accept(
    listener: &ListenerConfig,
    codec: Arc<dyn OpenListener>,
) -> Result<AcceptListener, PorticoError> {
    let security = listener
        .security()
        .ok_or_else(|| {
            ConfigError::Listener("HTTPS listeners require a security config".to_string())
        })?;
    let acceptor = TlsFactory::create_acceptor(security)?;

    Ok(Arc::new(move |stream, peer_addr| {
        let acceptor = acceptor.clone();
        let codec = codec.clone();
        Box::pin(async move {
            let stream = match acceptor
                .accept(stream)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("TLS handshake with {} failed: {}", peer_addr, e);
                    return;
                }
            };

            let session = match tls::session_info(&stream) {
                Ok(session) => session,
                Err(e) => {
                    error!("Cannot read TLS session of {}: {}", peer_addr, e);
                    return;
                }
            };

            let connection =
                Connection::new(Io::Tls(Box::new(stream)), peer_addr).with_ssl_session(session);
            if let Err(e) = codec
                .handle_connection(connection)
                .await
            {
                debug!("Connection from {} ended: {}", peer_addr, e);
            }
        })
    }))
}

#[cfg(not(feature = "tokio-rust-tls"))]
fn secure_accept(
    _listener: &ListenerConfig,
    _codec: Arc<dyn OpenListener>,
) -> Result<AcceptListener, PorticoError> {
    Err(StartError::Tls("HTTPS listeners require the tokio-rust-tls feature".to_string()).into())
}
