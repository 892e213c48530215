use std::sync::Arc;

use log::debug;
use radix_trie::Trie;

use crate::{server::virtual_host::Handler, Request};

/// Prefix a request was routed on, stored in the request extensions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedPath {
    prefix: String,
    relative: String,
}

impl ResolvedPath {
    /// The registered prefix that matched.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The remainder of the request path after the prefix, always starting
    /// with `/`.
    pub fn relative(&self) -> &str {
        &self.relative
    }
}

struct Route {
    prefix: String,
    handler: Handler,
}

/// Routes requests to the handler registered under the longest matching
/// path prefix.
///
/// Prefixes match on segment boundaries: `/api` matches `/api` and
/// `/api/users` but not `/apis`. Requests matching no prefix go to the
/// default handler.
pub struct PathRouter {
    routes: Trie<String, Route>,
    default_handler: Handler,
}

impl PathRouter {
    pub fn new(default_handler: Handler) -> Self {
        Self { routes: Trie::new(), default_handler }
    }

    /// Registers `handler` under `path`, replacing any previous handler for
    /// the same normalized prefix.
    pub fn add_path(&mut self, path: &str, handler: Handler) {
        let prefix = normalize_prefix(path);
        self.routes
            .insert(prefix.clone(), Route { prefix, handler });
    }

    /// Returns the handler and matched prefix for `path`, or `None` when the
    /// default handler applies.
    pub fn resolve(&self, path: &str) -> Option<(&str, &Handler)> {
        let mut probe = path.to_string();

        while !probe.is_empty() {
            let route = self
                .routes
                .get_ancestor_value(&probe)?;
            let prefix = route
                .prefix
                .as_str();

            let boundary = prefix == "/"
                || path.len() == prefix.len()
                || path.as_bytes()[prefix.len()] == b'/';
            if boundary {
                return Some((prefix, &route.handler));
            }

            let mut cut = prefix.len() - 1;
            while !probe.is_char_boundary(cut) {
                cut -= 1;
            }
            probe.truncate(cut);
        }

        None
    }

    pub fn default_handler(&self) -> &Handler {
        &self.default_handler
    }

    /// Turns the router into a handler.
    pub fn into_handler(self) -> Handler {
        let router = Arc::new(self);
        Arc::new(move |mut request: Request| {
            let path = request
                .uri()
                .path()
                .to_string();

            let handler = match router.resolve(&path) {
                Some((prefix, handler)) => {
                    debug!("Routing {} through prefix {}", path, prefix);
                    let relative = match &path[prefix.len()..] {
                        rest if rest.starts_with('/') => rest.to_string(),
                        rest => format!("/{}", rest),
                    };
                    request
                        .extensions_mut()
                        .insert(ResolvedPath { prefix: prefix.to_string(), relative });
                    handler.clone()
                }
                None => router
                    .default_handler
                    .clone(),
            };

            handler(request)
        })
    }
}

/// `api/` and `/api` both become `/api`; an empty path becomes `/`.
pub(crate) fn normalize_prefix(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
