//! # Portico
//!
//! **Bootstrap and dispatch core of a multi-protocol server**
//!
//! Portico turns a declarative description (listeners, buffer and thread
//! sizing, virtual hosts with path handlers and wrappers) into running
//! HTTP, HTTPS and AJP listeners that share one worker runtime and one
//! handler chain.
//!
//! ## Features
//!
//! - **Memory-aware defaults**: buffer size and region size follow the
//!   memory available to the process
//! - **Name based virtual hosts**: each host has its own path table,
//!   default handler and handler wrappers
//! - **Atomic startup**: a listener that fails to bind closes every listener
//!   opened before it
//! - **TLS session model**: session id, cipher suite and the verified client
//!   certificate are available to handlers
//! - **Pluggable codecs**: HTTP/1.1 is built in, AJP framing plugs in
//!   through [`server::conn::CodecFactory`]
//!
//! ## Basic Usage
//!
//! ```rust,ignore
//! use portico::{server::virtual_host::handler_fn, Portico, Response};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut builder = Portico::builder();
//!     builder
//!         .add_listener(8080, "0.0.0.0")
//!         .add_path_handler("/", handler_fn(|_request| async move {
//!             Ok(Response::builder().text("Hello, World!"))
//!         }));
//!
//!     let server = builder.build()?;
//!     server.start()?;
//!     // ...
//!     server.stop()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Server, listener and security configuration builders
//! - [`errors`]: Error types
//! - [`server`]: Listeners, worker runtime, codecs and request routing
//! - [`ssl`]: TLS session and peer certificate model

use std::{
    convert::Infallible,
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, TryLockError},
};

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Either, Empty, Full};
use hyper::body::Incoming;
use log::{error, info};

use crate::{
    config::{ServerConfig, ServerConfigBuilder},
    errors::{LifecycleError, PorticoError},
    server::{
        conn::ConnectionInfo,
        handlers::{Cookie, FormData, RequestCookies, ResponseCookies},
        manager::ListenerManager,
        path::ResolvedPath,
        Server,
    },
    ssl::SslSessionInfo,
};

pub mod config;
pub mod errors;
pub mod server;
pub mod ssl;
#[cfg(test)]
mod tests;

/// Body of requests and responses: the connection's incoming stream, or a
/// body built by a handler.
pub type PorticoBody = Either<Incoming, BoxBody<Bytes, std::io::Error>>;

pub trait PorticoBodyExt {
    fn body_from_text(text: &str) -> PorticoBody;
    fn body_from_bytes(bytes: Bytes) -> PorticoBody;
    fn empty() -> PorticoBody;
}

impl PorticoBodyExt for PorticoBody {
    fn body_from_text(text: &str) -> PorticoBody {
        Self::body_from_bytes(Bytes::copy_from_slice(text.as_bytes()))
    }

    fn body_from_bytes(bytes: Bytes) -> PorticoBody {
        Either::Right(
            Full::new(bytes)
                .map_err(|never: Infallible| -> std::io::Error { match never {} })
                .boxed(),
        )
    }

    fn empty() -> PorticoBody {
        Either::Right(
            Empty::<Bytes>::new()
                .map_err(|never: Infallible| -> std::io::Error { match never {} })
                .boxed(),
        )
    }
}

/// An HTTP request as seen by handlers.
///
/// Besides the request itself, the extensions carry what the stages before
/// a handler learned: connection facts, parsed cookies and form data, and
/// the path prefix the request was routed on.
pub struct Request {
    inner: http::Request<PorticoBody>,
}

impl Request {
    pub fn from_http(req: http::Request<Incoming>) -> Self {
        Self { inner: req.map(Either::Left) }
    }

    pub fn from_parts(parts: http::request::Parts, body: PorticoBody) -> Self {
        Self { inner: http::Request::from_parts(parts, body) }
    }

    pub fn uri(&self) -> &http::Uri {
        self.inner
            .uri()
    }

    pub fn method(&self) -> &http::Method {
        self.inner
            .method()
    }

    pub fn version(&self) -> http::Version {
        self.inner
            .version()
    }

    pub fn headers(&self) -> &http::HeaderMap {
        self.inner
            .headers()
    }

    pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
        self.inner
            .headers_mut()
    }

    pub fn extensions(&self) -> &http::Extensions {
        self.inner
            .extensions()
    }

    pub fn extensions_mut(&mut self) -> &mut http::Extensions {
        self.inner
            .extensions_mut()
    }

    /// Host the request is addressed to, lowercased and without port: the
    /// `Host` header, else the authority of the request target.
    pub fn host(&self) -> Option<String> {
        let host = self
            .headers()
            .get(http::header::HOST)
            .and_then(|value| {
                value
                    .to_str()
                    .ok()
            })
            .or_else(|| {
                self.uri()
                    .authority()
                    .map(|authority| authority.as_str())
            })?;

        let host = strip_port(host.trim());
        if host.is_empty() {
            return None;
        }
        Some(host.to_ascii_lowercase())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.extensions()
            .get::<ConnectionInfo>()
            .map(ConnectionInfo::peer_addr)
    }

    /// TLS session of the connection, `None` on plain listeners.
    pub fn ssl_session(&self) -> Option<Arc<SslSessionInfo>> {
        self.extensions()
            .get::<ConnectionInfo>()
            .and_then(ConnectionInfo::ssl_session)
            .map(|holder| holder.current())
    }

    pub fn cookies(&self) -> Option<&RequestCookies> {
        self.extensions()
            .get::<RequestCookies>()
    }

    /// Decoded `application/x-www-form-urlencoded` body.
    pub fn form_data(&self) -> Option<&FormData> {
        self.extensions()
            .get::<FormData>()
    }

    pub fn resolved_path(&self) -> Option<&ResolvedPath> {
        self.extensions()
            .get::<ResolvedPath>()
    }

    pub fn body(&self) -> &PorticoBody {
        self.inner
            .body()
    }

    pub fn into_parts(self) -> (http::request::Parts, PorticoBody) {
        self.inner
            .into_parts()
    }

    pub fn into_inner(self) -> http::Request<PorticoBody> {
        self.inner
    }
}

impl From<http::Request<PorticoBody>> for Request {
    fn from(inner: http::Request<PorticoBody>) -> Self {
        Self { inner }
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host
            .find(']')
            .map_or(host, |end| &host[..=end]);
    }

    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':')
                && port
                    .bytes()
                    .all(|byte| byte.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}

pub struct ResponseBuilder {
    status: http::StatusCode,
    version: http::Version,
    headers: http::HeaderMap,
}

impl ResponseBuilder {
    pub fn status(mut self, status: http::StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn version(mut self, version: http::Version) -> Self {
        self.version = version;
        self
    }

    pub fn header<K>(mut self, key: K, value: http::header::HeaderValue) -> Self
    where
        K: http::header::IntoHeaderName,
    {
        self.headers
            .append(key, value);
        self
    }

    pub fn headers(mut self, headers: http::HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn text(self, text: &str) -> Response {
        self.body(PorticoBody::body_from_text(text))
    }

    pub fn bytes(self, bytes: Bytes) -> Response {
        self.body(PorticoBody::body_from_bytes(bytes))
    }

    pub fn empty(self) -> Response {
        self.body(PorticoBody::empty())
    }

    pub fn body(self, body: PorticoBody) -> Response {
        let (mut parts, body) = http::Response::new(body).into_parts();
        parts.status = self.status;
        parts.version = self.version;
        parts.headers = self.headers;

        Response { inner: http::Response::from_parts(parts, body) }
    }
}

pub struct Response {
    inner: http::Response<PorticoBody>,
}

impl Response {
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder {
            status: http::StatusCode::OK,
            version: http::Version::HTTP_11,
            headers: http::HeaderMap::new(),
        }
    }

    pub fn status(&self) -> http::StatusCode {
        self.inner
            .status()
    }

    pub fn headers(&self) -> &http::HeaderMap {
        self.inner
            .headers()
    }

    pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
        self.inner
            .headers_mut()
    }

    pub fn extensions(&self) -> &http::Extensions {
        self.inner
            .extensions()
    }

    pub fn extensions_mut(&mut self) -> &mut http::Extensions {
        self.inner
            .extensions_mut()
    }

    pub fn body(&self) -> &PorticoBody {
        self.inner
            .body()
    }

    pub fn body_mut(&mut self) -> &mut PorticoBody {
        self.inner
            .body_mut()
    }

    /// Queues a `Set-Cookie` header, written by the cookie stage.
    pub fn add_cookie(&mut self, cookie: Cookie) {
        let extensions = self.extensions_mut();
        match extensions.get_mut::<ResponseCookies>() {
            Some(cookies) => cookies.add(cookie),
            None => {
                let mut cookies = ResponseCookies::default();
                cookies.add(cookie);
                extensions.insert(cookies);
            }
        }
    }

    pub fn into_inner(self) -> http::Response<PorticoBody> {
        self.inner
    }

    pub fn from_inner(inner: http::Response<PorticoBody>) -> Self {
        Self { inner }
    }
}

/// Lifecycle state of a [`Portico`] server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerState {
    NotStarted,
    Running,
    Stopped,
}

enum Lifecycle {
    NotStarted,
    Running(ListenerManager),
    Stopped,
}

impl Lifecycle {
    fn state(&self) -> ServerState {
        match self {
            Lifecycle::NotStarted => ServerState::NotStarted,
            Lifecycle::Running(_) => ServerState::Running,
            Lifecycle::Stopped => ServerState::Stopped,
        }
    }
}

/// A server instance built from a validated [`ServerConfig`].
///
/// The instance moves from not started to running to stopped, once. A
/// stopped server cannot be restarted; build a new one instead.
///
/// # Examples
///
/// ```rust,ignore
/// use portico::Portico;
///
/// let mut builder = Portico::builder();
/// builder.add_listener(8080, "127.0.0.1");
/// let server = builder.build()?;
///
/// server.start()?;
/// println!("listening on {:?}", server.listening_addresses());
/// server.stop()?;
/// ```
pub struct Portico {
    config: ServerConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl Portico {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn new(config: ServerConfig) -> Self {
        Self { config, lifecycle: Mutex::new(Lifecycle::NotStarted) }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        self.lock()
            .state()
    }

    /// Starts every listener.
    ///
    /// # Errors
    ///
    /// Fails when the server is running or stopped, when another start or
    /// stop is in progress, or when a listener cannot be opened. In the last
    /// case every listener opened so far is closed and the server stays not
    /// started.
    pub fn start(&self) -> Result<(), PorticoError> {
        let mut lifecycle = self.transition()?;

        match lifecycle.state() {
            ServerState::Running => Err(LifecycleError::AlreadyRunning.into()),
            ServerState::Stopped => Err(LifecycleError::AlreadyStopped.into()),
            ServerState::NotStarted => {
                let mut manager = ListenerManager::new();
                manager.start(&self.config)?;

                info!(
                    "Server started with {} listener(s)",
                    manager
                        .listening_addresses()
                        .len()
                );
                *lifecycle = Lifecycle::Running(manager);
                Ok(())
            }
        }
    }

    /// Stops every listener. Does nothing unless the server is running.
    pub fn stop(&self) -> Result<(), PorticoError> {
        let mut lifecycle = self.transition()?;

        if !matches!(*lifecycle, Lifecycle::Running(_)) {
            return Ok(());
        }

        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(mut manager) => manager.stop(),
            _ => Ok(()),
        }
    }

    /// Bound addresses of the listeners, empty unless running.
    pub fn listening_addresses(&self) -> Vec<SocketAddr> {
        match &*self.lock() {
            Lifecycle::Running(manager) => manager.listening_addresses(),
            _ => Vec::new(),
        }
    }

    /// Starts the server and runs until Ctrl+C.
    pub async fn run(&self) -> Result<(), PorticoError> {
        self.start()?;

        for addr in self.listening_addresses() {
            info!("Listening on {}", addr);
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot wait for Ctrl+C: {}", e);
        }

        info!("Stopping server...");

        self.stop()
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self) -> Result<MutexGuard<'_, Lifecycle>, PorticoError> {
        match self
            .lifecycle
            .try_lock()
        {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(LifecycleError::ConcurrentTransition.into()),
        }
    }
}

impl fmt::Debug for Portico {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Portico")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Portico {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("{}", e);
        }
    }
}
