//! Virtual hosts and the registry they live in.
//!
//! A [`VirtualHost`] groups the host names it answers to, a table of path
//! handlers, an ordered list of handler wrappers and a default handler used
//! when no path matches. Mutations never validate; the chain builder checks
//! the registry as a whole when the server starts.
//!
//! # Examples
//!
//! ```rust,ignore
//! use portico::{
//!     server::virtual_host::{handler_fn, HostRegistry},
//!     Response,
//! };
//!
//! let mut registry = HostRegistry::new();
//! registry
//!     .add_virtual_host("example.com")
//!     .add_host_name("www.example.com")
//!     .add_path_handler(
//!         "/api",
//!         handler_fn(|_request| async move { Ok(Response::builder().text("api")) }),
//!     );
//! ```

use std::{fmt, future::Future, sync::Arc};

use futures_util::future::BoxFuture;
use http::StatusCode;

use crate::{errors::PorticoError, server::path::normalize_prefix, Request, Response};

/// A request handler.
///
/// Handlers are cheap to clone and can be shared between hosts, paths and
/// listeners.
pub type Handler =
    Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Response, PorticoError>> + Send + Sync>;

/// A handler transform, applied once when the handler chain is built.
pub type HandlerWrapper = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Creates a [`Handler`] from an async function.
///
/// # Examples
///
/// ```rust,ignore
/// use portico::{server::virtual_host::handler_fn, Request, Response, errors::PorticoError};
///
/// async fn hello(_request: Request) -> Result<Response, PorticoError> {
///     Ok(Response::builder().text("Hello!"))
/// }
///
/// let handler = handler_fn(hello);
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, PorticoError>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

/// Creates a [`HandlerWrapper`] from a closure.
pub fn wrapper_fn<F>(f: F) -> HandlerWrapper
where
    F: Fn(Handler) -> Handler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handler answering every request with an empty `404 Not Found`.
pub fn not_found_handler() -> Handler {
    handler_fn(|_request| async move {
        Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .empty())
    })
}

/// Path table, wrappers and default handler served under a set of host names.
#[derive(Clone)]
pub struct VirtualHost {
    host_names: Vec<String>,
    paths: Vec<(String, Handler)>,
    wrappers: Vec<HandlerWrapper>,
    default_host: bool,
    default_handler: Handler,
}

impl VirtualHost {
    /// Creates a host that is only reachable through its host names.
    pub fn new() -> Self {
        Self::with_default_flag(false)
    }

    /// Creates the host used when no other host matches a request.
    pub fn new_default() -> Self {
        Self::with_default_flag(true)
    }

    fn with_default_flag(default_host: bool) -> Self {
        Self {
            host_names: Vec::new(),
            paths: Vec::new(),
            wrappers: Vec::new(),
            default_host,
            default_handler: not_found_handler(),
        }
    }

    pub fn add_host_name(&mut self, host_name: impl Into<String>) -> &mut Self {
        self.host_names
            .push(host_name.into());
        self
    }

    /// Registers `handler` for every request path starting with `path`.
    ///
    /// Paths are keyed by their normalized prefix, so `/api`, `/api/` and
    /// `api` name the same route and the last registration keeps it.
    pub fn add_path_handler(&mut self, path: impl Into<String>, handler: Handler) -> &mut Self {
        let key = path_key(path.into());
        match self
            .paths
            .iter_mut()
            .find(|(existing, _)| *existing == key)
        {
            Some(entry) => entry.1 = handler,
            None => self
                .paths
                .push((key, handler)),
        }
        self
    }

    /// Replaces the handler used when no path matches.
    pub fn set_default_handler(&mut self, handler: Handler) -> &mut Self {
        self.default_handler = handler;
        self
    }

    /// Appends a wrapper. The first wrapper added ends up outermost.
    pub fn add_handler_wrapper(&mut self, wrapper: HandlerWrapper) -> &mut Self {
        self.wrappers
            .push(wrapper);
        self
    }

    pub fn host_names(&self) -> &[String] {
        &self.host_names
    }

    pub fn path_handlers(&self) -> impl Iterator<Item = (&str, &Handler)> {
        self.paths
            .iter()
            .map(|(path, handler)| (path.as_str(), handler))
    }

    pub fn path_handler(&self, path: &str) -> Option<&Handler> {
        let key = path_key(path.to_string());
        self.paths
            .iter()
            .find(|(existing, _)| *existing == key)
            .map(|(_, handler)| handler)
    }

    pub fn wrappers(&self) -> &[HandlerWrapper] {
        &self.wrappers
    }

    pub fn is_default(&self) -> bool {
        self.default_host
    }

    pub fn default_handler(&self) -> &Handler {
        &self.default_handler
    }
}

/// Empty paths stay empty so the chain builder can reject them.
fn path_key(path: String) -> String {
    if path.is_empty() {
        path
    } else {
        normalize_prefix(&path)
    }
}

impl Default for VirtualHost {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VirtualHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<&String> = self
            .paths
            .iter()
            .map(|(path, _)| path)
            .collect();
        paths.sort();

        f.debug_struct("VirtualHost")
            .field("host_names", &self.host_names)
            .field("paths", &paths)
            .field("wrappers", &self.wrappers.len())
            .field("default_host", &self.default_host)
            .finish()
    }
}

/// Ordered set of virtual hosts.
///
/// The registry always starts with the default host at index 0.
#[derive(Clone, Debug)]
pub struct HostRegistry {
    hosts: Vec<VirtualHost>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self { hosts: vec![VirtualHost::new_default()] }
    }

    /// The host created with the registry.
    pub fn default_host(&self) -> &VirtualHost {
        &self.hosts[0]
    }

    pub fn default_host_mut(&mut self) -> &mut VirtualHost {
        &mut self.hosts[0]
    }

    /// Appends a non-default host answering to `host_name`.
    pub fn add_virtual_host(&mut self, host_name: impl Into<String>) -> &mut VirtualHost {
        let mut host = VirtualHost::new();
        host.add_host_name(host_name);
        self.push(host)
    }

    /// Appends a host as is.
    pub fn push(&mut self, host: VirtualHost) -> &mut VirtualHost {
        let index = self
            .hosts
            .len();
        self.hosts
            .push(host);
        &mut self.hosts[index]
    }

    pub fn hosts(&self) -> &[VirtualHost] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts
            .is_empty()
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}
