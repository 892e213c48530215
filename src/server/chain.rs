//! Composition of the root request handler.
//!
//! Every virtual host becomes a path router wrapped in the host's wrappers;
//! a name-based router picks the host per request. The root handler runs,
//! outer to inner: cookies, form decoding, error pages, host router.

use std::{collections::HashMap, sync::Arc};

use log::debug;

use crate::{
    errors::{ConfigError, PorticoError},
    server::{
        handlers::{cookie_handler, error_page_handler, form_handler},
        path::PathRouter,
        virtual_host::{not_found_handler, Handler, HostRegistry, VirtualHost},
    },
    Request,
};

/// Dispatches on the request host, falling back to the default host.
pub struct NameVirtualHostRouter {
    hosts: HashMap<String, Handler>,
    default_handler: Handler,
}

impl NameVirtualHostRouter {
    pub fn new() -> Self {
        Self { hosts: HashMap::new(), default_handler: not_found_handler() }
    }

    /// Registers `handler` for `host_name`. Host names compare
    /// case-insensitively; the last registration of a name wins.
    pub fn add_host(&mut self, host_name: &str, handler: Handler) {
        self.hosts
            .insert(host_name.to_ascii_lowercase(), handler);
    }

    pub fn set_default_handler(&mut self, handler: Handler) {
        self.default_handler = handler;
    }

    /// Handler for `host`, or the default handler when `host` is absent or
    /// unknown.
    pub fn resolve(&self, host: Option<&str>) -> &Handler {
        host.and_then(|host| {
            self.hosts
                .get(&host.to_ascii_lowercase())
        })
        .unwrap_or(&self.default_handler)
    }

    pub fn into_handler(self) -> Handler {
        let router = Arc::new(self);
        Arc::new(move |request: Request| {
            let host = request.host();
            debug!("Dispatching request for host {:?}", host);
            let handler = router
                .resolve(host.as_deref())
                .clone();
            handler(request)
        })
    }
}

impl Default for NameVirtualHostRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks the registry before it is turned into a handler chain.
///
/// Exactly one host must be the default, every other host needs at least one
/// host name, and neither host names nor paths may be empty.
pub fn validate_registry(registry: &HostRegistry) -> Result<(), PorticoError> {
    let defaults = registry
        .hosts()
        .iter()
        .filter(|host| host.is_default())
        .count();
    if defaults != 1 {
        return Err(ConfigError::VirtualHost(format!(
            "expected exactly one default host, found {}",
            defaults
        ))
        .into());
    }

    for host in registry.hosts() {
        if !host.is_default()
            && host
                .host_names()
                .is_empty()
        {
            return Err(ConfigError::VirtualHost("virtual host without host names".to_string())
                .into());
        }

        if host
            .host_names()
            .iter()
            .any(|name| {
                name.trim()
                    .is_empty()
            })
        {
            return Err(ConfigError::VirtualHost("host name is empty".to_string()).into());
        }

        if host
            .path_handlers()
            .any(|(path, _)| path.is_empty())
        {
            return Err(ConfigError::VirtualHost(format!(
                "empty path registered on {:?}",
                host.host_names()
            ))
            .into());
        }
    }

    Ok(())
}

/// The routed handler of one host: path router wrapped so the first
/// registered wrapper is outermost.
fn host_handler(host: &VirtualHost) -> Handler {
    let mut paths = PathRouter::new(
        host.default_handler()
            .clone(),
    );
    for (path, handler) in host.path_handlers() {
        paths.add_path(path, handler.clone());
    }

    host.wrappers()
        .iter()
        .rev()
        .fold(paths.into_handler(), |inner, wrapper| wrapper(inner))
}

/// Builds the root handler shared by every listener.
pub fn build_handler_chain(registry: &HostRegistry) -> Result<Handler, PorticoError> {
    validate_registry(registry)?;

    let mut router = NameVirtualHostRouter::new();
    for host in registry.hosts() {
        let handler = host_handler(host);
        if host.is_default() {
            router.set_default_handler(handler.clone());
        }
        for host_name in host.host_names() {
            router.add_host(host_name, handler.clone());
        }
    }

    let root = router.into_handler();
    let root = error_page_handler(root);
    let root = form_handler(root);
    let root = cookie_handler(root);

    Ok(root)
}
