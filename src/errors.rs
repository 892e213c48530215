//! Error handling types for portico.
//!
//! Every fallible operation in the crate returns [`PorticoError`]. The nested
//! enums narrow down which stage failed: building the configuration, binding
//! a listener, moving through the lifecycle, or decoding TLS session data.
//!
//! # Examples
//!
//! ```rust,ignore
//! use portico::errors::{LifecycleError, PorticoError};
//!
//! match server.start() {
//!     Ok(()) => println!("running"),
//!     Err(PorticoError::Bind(reason)) => eprintln!("cannot bind: {}", reason),
//!     Err(PorticoError::Lifecycle(LifecycleError::AlreadyStopped)) => {
//!         eprintln!("build a new server to restart");
//!     }
//!     Err(other) => eprintln!("error: {}", other),
//! }
//! ```

use thiserror::Error;

/// Main error type for portico operations.
#[derive(Debug, Error, PartialEq)]
pub enum PorticoError {
    /// Configuration-related errors, raised by `build()`
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Failed to bind or set up a listening socket
    #[error("Failed to bind to address: {0}")]
    Bind(String),

    /// Server startup errors other than binding
    #[error("Failed to start server: {0}")]
    Start(#[from] StartError),

    /// Server shutdown errors
    #[error("Failed to stop server: {0}")]
    Stop(String),

    /// Request handler errors
    #[error("Handler error: {0}")]
    Handler(String),

    /// Invalid lifecycle transitions
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// TLS session and certificate errors
    #[error("Ssl error: {0}")]
    Ssl(#[from] SslError),

    /// Protocol codec failures while serving a connection
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Configuration-related errors.
///
/// These are reported by the builders, never deferred to `start()`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// A sizing or thread setting is out of range
    #[error("Invalid server config: {0}")]
    Validation(String),

    /// Invalid listener configuration
    #[error("Invalid listener config: {0}")]
    Listener(String),

    /// Invalid virtual host configuration
    #[error("Invalid virtual host config: {0}")]
    VirtualHost(String),

    /// Invalid security configuration
    #[error("Invalid security config: {0}")]
    Security(String),

    /// Unreadable or malformed settings document
    #[error("Invalid settings: {0}")]
    Settings(String),
}

/// Server startup errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StartError {
    /// TLS/SSL initialization errors
    #[error("Tls initialization: {0}")]
    Tls(String),

    /// The worker runtime could not be created
    #[error("Worker initialization: {0}")]
    Worker(String),
}

/// Lifecycle state machine violations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LifecycleError {
    /// `start()` on a running server
    #[error("Server is already running")]
    AlreadyRunning,

    /// `start()` on a stopped server; stopped is terminal
    #[error("Server has been stopped and cannot be restarted")]
    AlreadyStopped,

    /// Another thread is performing a transition on the same instance
    #[error("Another lifecycle transition is in progress")]
    ConcurrentTransition,

    /// The worker backing the server is gone
    #[error("Worker has been shut down")]
    WorkerShutdown,
}

/// TLS session errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SslError {
    /// No peer certificate was presented for this session
    #[error("Peer unverified")]
    PeerUnverified,

    /// The peer certificate could not be decoded
    #[error("Certificate decoding: {0}")]
    Certificate(#[from] CertificateError),

    /// The encoded session id could not be decoded
    #[error("Invalid session id: {0}")]
    SessionId(String),
}

/// Certificate decoding errors.
///
/// `Encoding` covers the textual layer (PEM armour, base64), `X509` covers
/// DER content that is not a valid X.509 certificate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CertificateError {
    #[error("Invalid certificate encoding: {0}")]
    Encoding(String),

    #[error("Invalid X.509 certificate: {0}")]
    X509(String),
}
