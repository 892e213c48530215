//! Configuration types for portico.
//!
//! A server is described by a [`ServerConfig`], assembled through the
//! [`ServerConfigBuilder`] returned by [`Portico::builder`]. The builder
//! accumulates a draft; nothing is checked until `build()`, which validates
//! the whole draft at once and fails fast.
//!
//! # Examples
//!
//! ```rust,ignore
//! use portico::{
//!     config::SecurityConfig,
//!     server::virtual_host::handler_fn,
//!     Portico, Response,
//! };
//!
//! let security = SecurityConfig::builder()
//!     .cert_from_file("server.pem")
//!     .key_from_file("server.key")
//!     .build()?;
//!
//! let mut builder = Portico::builder();
//! builder
//!     .add_listener(8080, "0.0.0.0")
//!     .add_https_listener(8443, "0.0.0.0", security)
//!     .set_io_threads(4)
//!     .add_path_handler("/", handler_fn(|_request| async move {
//!         Ok(Response::builder().text("Hello"))
//!     }));
//!
//! builder
//!     .add_virtual_host("api.example.com")
//!     .add_path_handler("/v1", handler_fn(|_request| async move {
//!         Ok(Response::builder().text("v1"))
//!     }));
//!
//! let server = builder.build()?;
//! ```

use std::{
    collections::HashMap,
    fmt, fs,
    net::{SocketAddr, ToSocketAddrs},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Deserialize;

use crate::{
    errors::{ConfigError, PorticoError},
    server::{
        buffer_pool::{detect_max_memory, select_buffer_profile},
        chain::validate_registry,
        conn::CodecFactory,
        virtual_host::{Handler, HandlerWrapper, HostRegistry, VirtualHost},
    },
    Portico,
};

/// Wire protocol spoken by a listener.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ListenerProtocol {
    Http,
    Https,
    Ajp,
}

impl fmt::Display for ListenerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerProtocol::Http => f.write_str("HTTP"),
            ListenerProtocol::Https => f.write_str("HTTPS"),
            ListenerProtocol::Ajp => f.write_str("AJP"),
        }
    }
}

/// Whether HTTPS listeners ask clients for a certificate.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuth {
    #[default]
    NotRequested,
    /// Ask for a certificate, accept clients without one.
    Requested,
    /// Refuse clients without a valid certificate.
    Required,
}

#[derive(Clone, Debug)]
enum Source {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl Source {
    fn load(self, what: &str) -> Result<Vec<u8>, PorticoError> {
        match self {
            Source::Bytes(bytes) => Ok(bytes),
            Source::File(path) => fs::read(&path).map_err(|e| {
                ConfigError::Security(format!("Cannot read {} {}: {}", what, path.display(), e))
                    .into()
            }),
        }
    }
}

/// Builder for [`SecurityConfig`].
///
/// Certificates and keys are accepted in DER or PEM form. Files are read by
/// `build()`.
#[derive(Clone, Debug)]
pub struct SecurityConfigBuilder {
    cert: Source,
    key: Source,
    ca_cert: Option<Source>,
    client_auth: ClientAuth,
}

impl SecurityConfigBuilder {
    pub fn cert_from_bytes(mut self, cert: Vec<u8>) -> Self {
        self.cert = Source::Bytes(cert);
        self
    }

    pub fn cert_from_file(mut self, path: impl AsRef<Path>) -> Self {
        self.cert = Source::File(
            path.as_ref()
                .to_path_buf(),
        );
        self
    }

    pub fn key_from_bytes(mut self, key: Vec<u8>) -> Self {
        self.key = Source::Bytes(key);
        self
    }

    pub fn key_from_file(mut self, path: impl AsRef<Path>) -> Self {
        self.key = Source::File(
            path.as_ref()
                .to_path_buf(),
        );
        self
    }

    /// CA used to verify client certificates.
    pub fn ca_cert_from_bytes(mut self, ca_cert: Vec<u8>) -> Self {
        self.ca_cert = Some(Source::Bytes(ca_cert));
        self
    }

    pub fn ca_cert_from_file(mut self, path: impl AsRef<Path>) -> Self {
        self.ca_cert = Some(Source::File(
            path.as_ref()
                .to_path_buf(),
        ));
        self
    }

    pub fn client_auth(mut self, client_auth: ClientAuth) -> Self {
        self.client_auth = client_auth;
        self
    }

    /// # Errors
    ///
    /// Fails when a file cannot be read, the certificate or key is empty, or
    /// client authentication is enabled without a CA certificate.
    pub fn build(self) -> Result<SecurityConfig, PorticoError> {
        let cert = self
            .cert
            .load("certificate")?;
        let key = self
            .key
            .load("private key")?;
        let ca_cert = self
            .ca_cert
            .map(|ca_cert| ca_cert.load("CA certificate"))
            .transpose()?;

        if cert.is_empty() {
            return Err(ConfigError::Security("Certificate is empty".to_string()).into());
        }
        if key.is_empty() {
            return Err(ConfigError::Security("Private key is empty".to_string()).into());
        }
        if self.client_auth != ClientAuth::NotRequested && ca_cert.is_none() {
            return Err(ConfigError::Security(
                "Client authentication requires a CA certificate".to_string(),
            )
            .into());
        }

        Ok(SecurityConfig { cert, key, ca_cert, client_auth: self.client_auth })
    }
}

/// TLS material of an HTTPS listener.
#[derive(Clone, PartialEq)]
pub struct SecurityConfig {
    cert: Vec<u8>,
    key: Vec<u8>,
    ca_cert: Option<Vec<u8>>,
    client_auth: ClientAuth,
}

impl SecurityConfig {
    pub fn builder() -> SecurityConfigBuilder {
        SecurityConfigBuilder {
            cert: Source::Bytes(Vec::new()),
            key: Source::Bytes(Vec::new()),
            ca_cert: None,
            client_auth: ClientAuth::NotRequested,
        }
    }

    pub fn cert(&self) -> &[u8] {
        &self.cert
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn ca_cert(&self) -> Option<&[u8]> {
        self.ca_cert
            .as_deref()
    }

    pub fn client_auth(&self) -> ClientAuth {
        self.client_auth
    }
}

impl fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("cert", &format_args!("{} bytes", self.cert.len()))
            .field("key", &"<redacted>")
            .field("ca_cert", &self.ca_cert.is_some())
            .field("client_auth", &self.client_auth)
            .finish()
    }
}

/// Builder for [`ListenerConfig`].
#[derive(Clone, Debug)]
pub struct ListenerConfigBuilder {
    protocol: ListenerProtocol,
    host: String,
    port: u16,
    security: Option<SecurityConfig>,
}

impl ListenerConfigBuilder {
    pub fn protocol(mut self, protocol: ListenerProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.security = Some(security);
        self
    }

    /// # Errors
    ///
    /// Fails when the host is empty, an HTTPS listener has no security
    /// config, or a plain listener has one.
    pub fn build(self) -> Result<ListenerConfig, PorticoError> {
        if self
            .host
            .trim()
            .is_empty()
        {
            return Err(ConfigError::Listener("host is empty".to_string()).into());
        }

        match (self.protocol, &self.security) {
            (ListenerProtocol::Https, None) => {
                return Err(ConfigError::Listener(
                    "HTTPS listeners require a security config".to_string(),
                )
                .into());
            }
            (ListenerProtocol::Http | ListenerProtocol::Ajp, Some(_)) => {
                return Err(ConfigError::Listener(format!(
                    "{} listeners do not take a security config",
                    self.protocol
                ))
                .into());
            }
            _ => {}
        }

        Ok(ListenerConfig {
            protocol: self.protocol,
            host: self.host,
            port: self.port,
            security: self.security,
        })
    }
}

/// One listening socket: protocol, bind host and port.
#[derive(Clone, Debug, PartialEq)]
pub struct ListenerConfig {
    protocol: ListenerProtocol,
    host: String,
    port: u16,
    security: Option<SecurityConfig>,
}

impl ListenerConfig {
    pub fn builder() -> ListenerConfigBuilder {
        ListenerConfigBuilder {
            protocol: ListenerProtocol::Http,
            host: "0.0.0.0".to_string(),
            port: 8080,
            security: None,
        }
    }

    pub fn protocol(&self) -> ListenerProtocol {
        self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn security(&self) -> Option<&SecurityConfig> {
        self.security
            .as_ref()
    }

    /// Resolves the bind address, preferring IPv4 like the host lookup of
    /// most front ends.
    pub fn socket_addr(&self) -> Result<SocketAddr, PorticoError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| PorticoError::Bind(format!("{}:{}: {}", self.host, self.port, e)))?
            .collect();

        addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| {
                PorticoError::Bind(format!("{}:{}: no address found", self.host, self.port))
            })
    }
}

/// Validated, immutable server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    buffer_size: usize,
    buffers_per_region: usize,
    io_threads: usize,
    worker_threads: usize,
    direct_buffers: bool,
    listeners: Vec<ListenerConfig>,
    hosts: HostRegistry,
    codecs: HashMap<ListenerProtocol, Arc<dyn CodecFactory>>,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn buffers_per_region(&self) -> usize {
        self.buffers_per_region
    }

    pub fn io_threads(&self) -> usize {
        self.io_threads
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn direct_buffers(&self) -> bool {
        self.direct_buffers
    }

    pub fn listeners(&self) -> &[ListenerConfig] {
        &self.listeners
    }

    pub fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }

    /// Codec registered for `protocol`, if any.
    pub fn codec(&self, protocol: ListenerProtocol) -> Option<Arc<dyn CodecFactory>> {
        self.codecs
            .get(&protocol)
            .cloned()
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("buffer_size", &self.buffer_size)
            .field("buffers_per_region", &self.buffers_per_region)
            .field("io_threads", &self.io_threads)
            .field("worker_threads", &self.worker_threads)
            .field("direct_buffers", &self.direct_buffers)
            .field("listeners", &self.listeners)
            .field("hosts", &self.hosts)
            .field(
                "codecs",
                &self
                    .codecs
                    .keys()
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Draft of a [`ServerConfig`].
///
/// Sizing defaults come from the machine: buffers follow the memory budget
/// (see [`select_buffer_profile`]), I/O threads match the available
/// parallelism and worker threads are eight per I/O thread. Path handlers,
/// default handler and wrappers set on the builder go to the default host.
#[derive(Clone)]
pub struct ServerConfigBuilder {
    buffer_size: usize,
    buffers_per_region: usize,
    io_threads: usize,
    worker_threads: usize,
    direct_buffers: bool,
    listeners: Vec<ListenerConfig>,
    hosts: HostRegistry,
    codecs: HashMap<ListenerProtocol, Arc<dyn CodecFactory>>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        let io_threads = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);

        let mut builder = Self {
            buffer_size: 0,
            buffers_per_region: 0,
            io_threads,
            worker_threads: io_threads * 8,
            direct_buffers: false,
            listeners: Vec::new(),
            hosts: HostRegistry::new(),
            codecs: HashMap::new(),
        };
        builder.with_max_memory(detect_max_memory());
        builder
    }

    /// Applies the buffer sizing policy for a memory budget of `bytes`.
    pub fn with_max_memory(&mut self, bytes: u64) -> &mut Self {
        let profile = select_buffer_profile(bytes);
        self.buffer_size = profile.buffer_size;
        self.buffers_per_region = profile.buffers_per_region;
        self.direct_buffers = profile.direct;
        self
    }

    /// Adds an HTTP listener.
    pub fn add_listener(&mut self, port: u16, host: impl Into<String>) -> &mut Self {
        self.push_listener(ListenerProtocol::Http, port, host.into(), None)
    }

    pub fn add_https_listener(
        &mut self,
        port: u16,
        host: impl Into<String>,
        security: SecurityConfig,
    ) -> &mut Self {
        self.push_listener(ListenerProtocol::Https, port, host.into(), Some(security))
    }

    /// Adds an AJP listener. An AJP codec must be registered with
    /// [`register_codec`](Self::register_codec).
    pub fn add_ajp_listener(&mut self, port: u16, host: impl Into<String>) -> &mut Self {
        self.push_listener(ListenerProtocol::Ajp, port, host.into(), None)
    }

    pub fn add_listener_config(&mut self, listener: ListenerConfig) -> &mut Self {
        self.listeners
            .push(listener);
        self
    }

    fn push_listener(
        &mut self,
        protocol: ListenerProtocol,
        port: u16,
        host: String,
        security: Option<SecurityConfig>,
    ) -> &mut Self {
        self.listeners
            .push(ListenerConfig { protocol, host, port, security });
        self
    }

    pub fn set_buffer_size(&mut self, buffer_size: usize) -> &mut Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn set_buffers_per_region(&mut self, buffers_per_region: usize) -> &mut Self {
        self.buffers_per_region = buffers_per_region;
        self
    }

    pub fn set_io_threads(&mut self, io_threads: usize) -> &mut Self {
        self.io_threads = io_threads;
        self
    }

    pub fn set_worker_threads(&mut self, worker_threads: usize) -> &mut Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn set_direct_buffers(&mut self, direct_buffers: bool) -> &mut Self {
        self.direct_buffers = direct_buffers;
        self
    }

    /// Adds a virtual host answering to `host_name` and returns it for
    /// further setup.
    pub fn add_virtual_host(&mut self, host_name: impl Into<String>) -> &mut VirtualHost {
        self.hosts
            .add_virtual_host(host_name)
    }

    pub fn add_path_handler(&mut self, path: impl Into<String>, handler: Handler) -> &mut Self {
        self.hosts
            .default_host_mut()
            .add_path_handler(path, handler);
        self
    }

    pub fn set_default_handler(&mut self, handler: Handler) -> &mut Self {
        self.hosts
            .default_host_mut()
            .set_default_handler(handler);
        self
    }

    pub fn add_handler_wrapper(&mut self, wrapper: HandlerWrapper) -> &mut Self {
        self.hosts
            .default_host_mut()
            .add_handler_wrapper(wrapper);
        self
    }

    /// Registers the codec serving listeners of `protocol`, replacing the
    /// built-in one for HTTP and HTTPS.
    pub fn register_codec<F>(&mut self, protocol: ListenerProtocol, factory: F) -> &mut Self
    where
        F: CodecFactory + 'static,
    {
        self.codecs
            .insert(protocol, Arc::new(factory));
        self
    }

    /// Validates the draft into a [`ServerConfig`].
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] for non-positive sizes or thread counts
    /// and a missing listener, [`ConfigError::Listener`] for listeners that
    /// cannot be served, [`ConfigError::VirtualHost`] for an invalid host
    /// registry.
    pub fn build_config(&self) -> Result<ServerConfig, PorticoError> {
        let positive = [
            ("buffer size", self.buffer_size),
            ("buffers per region", self.buffers_per_region),
            ("io threads", self.io_threads),
            ("worker threads", self.worker_threads),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{} must be positive", name)).into());
            }
        }

        if self
            .listeners
            .is_empty()
        {
            return Err(
                ConfigError::Validation("at least one listener is required".to_string()).into()
            );
        }

        for listener in &self.listeners {
            if listener
                .host
                .trim()
                .is_empty()
            {
                return Err(ConfigError::Listener("host is empty".to_string()).into());
            }

            match listener.protocol {
                ListenerProtocol::Ajp if !self.codecs.contains_key(&ListenerProtocol::Ajp) => {
                    return Err(ConfigError::Listener(
                        "no codec registered for AJP listeners".to_string(),
                    )
                    .into());
                }
                #[cfg(not(feature = "tokio-rust-tls"))]
                ListenerProtocol::Https => {
                    return Err(ConfigError::Listener(
                        "HTTPS listeners require the tokio-rust-tls feature".to_string(),
                    )
                    .into());
                }
                _ => {}
            }
        }

        validate_registry(&self.hosts)?;

        Ok(ServerConfig {
            buffer_size: self.buffer_size,
            buffers_per_region: self.buffers_per_region,
            io_threads: self.io_threads,
            worker_threads: self.worker_threads,
            direct_buffers: self.direct_buffers,
            listeners: self
                .listeners
                .clone(),
            hosts: self
                .hosts
                .clone(),
            codecs: self
                .codecs
                .clone(),
        })
    }

    /// Validates the draft and creates a server in the not-started state.
    pub fn build(&self) -> Result<Portico, PorticoError> {
        Ok(Portico::new(self.build_config()?))
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_protocol() -> ListenerProtocol {
    ListenerProtocol::Http
}

/// TLS files of a listener in a settings document.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SecuritySettings {
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_auth: ClientAuth,
}

/// A listener in a settings document.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ListenerSettings {
    #[serde(default = "default_protocol")]
    pub protocol: ListenerProtocol,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub security: Option<SecuritySettings>,
}

/// Server settings loaded from a YAML document.
///
/// ```yaml
/// max_memory: 268435456
/// io_threads: 4
/// listeners:
///   - protocol: http
///     port: 8080
///   - protocol: https
///     port: 8443
///     security:
///       cert: server.pem
///       key: server.key
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    pub max_memory: Option<u64>,
    pub buffer_size: Option<usize>,
    pub buffers_per_region: Option<usize>,
    pub io_threads: Option<usize>,
    pub worker_threads: Option<usize>,
    pub direct_buffers: Option<bool>,
    pub listeners: Vec<ListenerSettings>,
}

impl ServerSettings {
    pub fn from_yaml(text: &str) -> Result<Self, PorticoError> {
        serde_yaml_ng::from_str(text).map_err(|e| ConfigError::Settings(e.to_string()).into())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PorticoError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            ConfigError::Settings(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Copies the settings onto `builder`. An explicit buffer setting wins
    /// over the profile chosen for `max_memory`.
    pub fn apply(&self, builder: &mut ServerConfigBuilder) -> Result<(), PorticoError> {
        if let Some(max_memory) = self.max_memory {
            builder.with_max_memory(max_memory);
        }
        if let Some(buffer_size) = self.buffer_size {
            builder.set_buffer_size(buffer_size);
        }
        if let Some(buffers_per_region) = self.buffers_per_region {
            builder.set_buffers_per_region(buffers_per_region);
        }
        if let Some(io_threads) = self.io_threads {
            builder.set_io_threads(io_threads);
        }
        if let Some(worker_threads) = self.worker_threads {
            builder.set_worker_threads(worker_threads);
        }
        if let Some(direct_buffers) = self.direct_buffers {
            builder.set_direct_buffers(direct_buffers);
        }

        for listener in &self.listeners {
            let mut config = ListenerConfig::builder()
                .protocol(listener.protocol)
                .host(listener.host.as_str())
                .port(listener.port);

            if let Some(security) = &listener.security {
                let mut security_builder = SecurityConfig::builder()
                    .cert_from_file(&security.cert)
                    .key_from_file(&security.key)
                    .client_auth(security.client_auth);
                if let Some(ca_cert) = &security.ca_cert {
                    security_builder = security_builder.ca_cert_from_file(ca_cert);
                }
                config = config.security(security_builder.build()?);
            }

            builder.add_listener_config(config.build()?);
        }

        Ok(())
    }
}
