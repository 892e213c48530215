use std::sync::Arc;

use log::debug;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    RootCertStore, ServerConfig,
};
use tokio::net::TcpStream;
use tokio_rustls::{server::TlsStream, TlsAcceptor};

use crate::{
    config::{ClientAuth, SecurityConfig},
    errors::{PorticoError, SslError, StartError::Tls},
    ssl::SslSessionInfo,
};

const SESSION_ID_LEN: usize = 32;

pub struct TlsFactory {}

impl TlsFactory {
    /// Builds the rustls configuration of an HTTPS listener.
    pub fn create_tls_config(security: &SecurityConfig) -> Result<ServerConfig, PorticoError> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let chain = load_certificates(security.cert())?;
        let key = load_private_key(security.key())?;

        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Tls(e.to_string()))?;

        let builder = match (security.client_auth(), security.ca_cert()) {
            (ClientAuth::NotRequested, _) => builder.with_no_client_auth(),
            (_, None) => {
                return Err(Tls("client authentication requires a CA certificate".to_string()).into());
            }
            (client_auth, Some(ca_cert)) => {
                let mut roots = RootCertStore::empty();
                for certificate in load_certificates(ca_cert)? {
                    roots
                        .add(certificate)
                        .map_err(|e| Tls(format!("Invalid CA certificate: {}", e)))?;
                }

                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
                let verifier = if client_auth == ClientAuth::Requested {
                    verifier.allow_unauthenticated()
                } else {
                    verifier
                };
                let verifier = verifier
                    .build()
                    .map_err(|e| Tls(e.to_string()))?;

                builder.with_client_cert_verifier(verifier)
            }
        };

        let mut tls_config = builder
            .with_single_cert(chain, key)
            .map_err(|e| Tls(e.to_string()))?;
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(tls_config)
    }

    pub fn create_acceptor(security: &SecurityConfig) -> Result<TlsAcceptor, PorticoError> {
        let tls_config = Self::create_tls_config(security)?;
        Ok(TlsAcceptor::from(Arc::new(tls_config)))
    }
}

/// Describes the session negotiated on `stream`.
///
/// rustls does not expose a session id, so each handshake gets a random one.
pub fn session_info(stream: &TlsStream<TcpStream>) -> Result<SslSessionInfo, SslError> {
    let (_, connection) = stream.get_ref();

    let cipher_suite = connection
        .negotiated_cipher_suite()
        .map(|suite| format!("{:?}", suite.suite()))
        .unwrap_or_default();
    let peer_certificate = connection
        .peer_certificates()
        .and_then(|chain| chain.first())
        .map(|certificate| certificate.to_vec());

    debug!(
        "TLS session established with {} (client certificate: {})",
        cipher_suite,
        peer_certificate.is_some()
    );

    let session_id: [u8; SESSION_ID_LEN] = rand::random();
    SslSessionInfo::from_der(session_id.to_vec(), cipher_suite, peer_certificate)
}

fn is_pem(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .is_some_and(|start| bytes[start..].starts_with(b"-----BEGIN"))
}

fn load_certificates(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>, PorticoError> {
    if !is_pem(bytes) {
        return Ok(vec![CertificateDer::from(bytes.to_vec())]);
    }

    let certificates = rustls_pemfile::certs(&mut &bytes[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Tls(format!("Failed to parse certificate: {}", e)))?;
    if certificates.is_empty() {
        return Err(Tls("No certificate found in PEM input".to_string()).into());
    }

    Ok(certificates)
}

fn load_private_key(bytes: &[u8]) -> Result<PrivateKeyDer<'static>, PorticoError> {
    if !is_pem(bytes) {
        return PrivateKeyDer::try_from(bytes.to_vec())
            .map_err(|e| Tls(format!("Failed to parse private key: {}", e)).into());
    }

    rustls_pemfile::private_key(&mut &bytes[..])
        .map_err(|e| Tls(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| Tls("No private key found in PEM input".to_string()).into())
}
