//! Server internals: buffers, worker runtime, codecs, routing and the
//! listener manager tying them together.

use std::net::SocketAddr;

use crate::{config::ServerConfig, errors::PorticoError};

pub mod buffer_pool;
pub mod chain;
pub mod conn;
pub mod handlers;
pub mod manager;
pub mod path;
#[cfg(feature = "tokio-rust-tls")]
pub mod tls;
pub mod virtual_host;
pub mod worker;

/// A running set of listeners.
pub trait Server {
    /// Opens every listener of `config`. On failure, listeners opened so far
    /// are closed before the error is returned.
    fn start(&mut self, config: &ServerConfig) -> Result<(), PorticoError>;

    /// Closes every listener. Stopping an idle server does nothing.
    fn stop(&mut self) -> Result<(), PorticoError>;

    /// Bound addresses of the open listeners, in configuration order.
    fn listening_addresses(&self) -> Vec<SocketAddr>;
}
