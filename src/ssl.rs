//! TLS session and peer certificate model.
//!
//! An [`SslSessionInfo`] describes one negotiated TLS session: its id, the
//! cipher suite and, for mutually authenticated sessions, the certificate the
//! client presented. The value is immutable and can be shared freely between
//! threads. A session without a certificate stays that way; when a client
//! presents a certificate later on (renegotiation), the connection replaces
//! its session through an [`SslSessionHolder`] and callers holding the old
//! instance keep seeing the old data.
//!
//! Session data comes from two places: the HTTPS listener, which reads it off
//! the rustls connection, and front-end proxies (AJP), which forward a base64
//! session id, the cipher name and the client certificate as text.
//!
//! # Examples
//!
//! ```rust,ignore
//! use portico::ssl::SslSessionInfo;
//!
//! let anonymous = SslSessionInfo::from_encoded("AQIDBA==", "TLS_AES_128_GCM_SHA256", None)?;
//! assert!(anonymous.peer_certificate_chain().is_err());
//! ```

use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use time::OffsetDateTime;
use x509_parser::pem::Pem;

use crate::errors::{CertificateError, SslError};

const PEM_ARMOR: &str = "-----BEGIN";
const PEM_CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// Generic view of a peer certificate.
pub trait Certificate: fmt::Debug + Send + Sync {
    /// Certificate type, e.g. `X.509`.
    fn certificate_type(&self) -> &str;

    /// The encoded (DER) certificate.
    fn encoded(&self) -> &[u8];
}

/// A parsed X.509 certificate.
///
/// The DER bytes are kept verbatim; the fields below are extracted once at
/// construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct X509Certificate {
    der: Arc<[u8]>,
    subject: String,
    issuer: String,
    serial: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl X509Certificate {
    /// Parses a DER encoded certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self, CertificateError> {
        let (_, parsed) = x509_parser::parse_x509_certificate(&der)
            .map_err(|e| CertificateError::X509(e.to_string()))?;

        let subject = parsed
            .subject()
            .to_string();
        let issuer = parsed
            .issuer()
            .to_string();
        let serial = parsed.raw_serial_as_string();
        let validity = parsed.validity();
        let not_before = validity
            .not_before
            .to_datetime();
        let not_after = validity
            .not_after
            .to_datetime();

        Ok(Self { der: Arc::from(der), subject, issuer, serial, not_before, not_after })
    }

    /// Parses a textual certificate: PEM, or bare base64 DER as forwarded by
    /// front-end proxies. Only the first certificate of a PEM bundle is read.
    pub fn from_text(text: &str) -> Result<Self, CertificateError> {
        Self::from_der(decode_certificate_text(text)?)
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Serial number as colon separated hex.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }
}

impl Certificate for X509Certificate {
    fn certificate_type(&self) -> &str {
        "X.509"
    }

    fn encoded(&self) -> &[u8] {
        &self.der
    }
}

/// Immutable description of a negotiated TLS session.
#[derive(Debug)]
pub struct SslSessionInfo {
    session_id: Box<[u8]>,
    cipher_suite: String,
    peer_certificate: Option<Arc<X509Certificate>>,
}

impl SslSessionInfo {
    /// Creates session info from a raw session id and an optional textual
    /// client certificate.
    ///
    /// # Errors
    ///
    /// Fails with [`SslError::Certificate`] when the certificate cannot be
    /// decoded; no instance is created in that case.
    pub fn new(
        session_id: Vec<u8>,
        cipher_suite: impl Into<String>,
        certificate: Option<&str>,
    ) -> Result<Self, SslError> {
        let peer_certificate = certificate
            .map(X509Certificate::from_text)
            .transpose()?
            .map(Arc::new);

        Ok(Self {
            session_id: session_id.into_boxed_slice(),
            cipher_suite: cipher_suite.into(),
            peer_certificate,
        })
    }

    /// Creates session info from a base64 encoded session id.
    pub fn from_encoded(
        session_id: &str,
        cipher_suite: impl Into<String>,
        certificate: Option<&str>,
    ) -> Result<Self, SslError> {
        let session_id = decode_base64(session_id).map_err(SslError::SessionId)?;
        Self::new(session_id, cipher_suite, certificate)
    }

    /// Creates session info from a DER certificate, as read from a TLS
    /// handshake.
    pub fn from_der(
        session_id: Vec<u8>,
        cipher_suite: impl Into<String>,
        certificate: Option<Vec<u8>>,
    ) -> Result<Self, SslError> {
        let peer_certificate = certificate
            .map(X509Certificate::from_der)
            .transpose()?
            .map(Arc::new);

        Ok(Self {
            session_id: session_id.into_boxed_slice(),
            cipher_suite: cipher_suite.into(),
            peer_certificate,
        })
    }

    /// Returns a copy of the session id.
    pub fn session_id(&self) -> Vec<u8> {
        self.session_id.to_vec()
    }

    pub fn cipher_suite(&self) -> &str {
        &self.cipher_suite
    }

    /// Whether the peer presented a certificate.
    pub fn has_peer_certificate(&self) -> bool {
        self.peer_certificate
            .is_some()
    }

    /// Peer certificates through the generic view.
    ///
    /// Only the peer's own certificate is available, so the result has
    /// exactly one element.
    ///
    /// # Errors
    ///
    /// [`SslError::PeerUnverified`] when the peer presented no certificate.
    pub fn peer_certificates(&self) -> Result<Vec<Arc<dyn Certificate>>, SslError> {
        let certificate = self.peer_certificate()?;
        Ok(vec![certificate as Arc<dyn Certificate>])
    }

    /// Peer certificates through the X.509 view.
    ///
    /// # Errors
    ///
    /// [`SslError::PeerUnverified`] when the peer presented no certificate.
    pub fn peer_certificate_chain(&self) -> Result<Vec<Arc<X509Certificate>>, SslError> {
        Ok(vec![self.peer_certificate()?])
    }

    fn peer_certificate(&self) -> Result<Arc<X509Certificate>, SslError> {
        self.peer_certificate
            .clone()
            .ok_or(SslError::PeerUnverified)
    }
}

/// Per-connection slot for the current TLS session.
///
/// Renegotiation swaps in a new [`SslSessionInfo`]; readers never block and
/// whoever loaded the previous session keeps a valid, unchanged instance.
pub struct SslSessionHolder {
    current: ArcSwap<SslSessionInfo>,
}

impl SslSessionHolder {
    pub fn new(session: SslSessionInfo) -> Self {
        Self { current: ArcSwap::from_pointee(session) }
    }

    pub fn current(&self) -> Arc<SslSessionInfo> {
        self.current
            .load_full()
    }

    /// Replaces the session and returns the one it replaced.
    pub fn renegotiate(&self, session: SslSessionInfo) -> Arc<SslSessionInfo> {
        self.current
            .swap(Arc::new(session))
    }
}

impl fmt::Debug for SslSessionHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslSessionHolder")
            .field("current", &self.current())
            .finish()
    }
}

fn decode_certificate_text(text: &str) -> Result<Vec<u8>, CertificateError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(CertificateError::Encoding("empty certificate".to_string()));
    }

    if !text.contains(PEM_ARMOR) {
        return decode_base64(text).map_err(CertificateError::Encoding);
    }

    for pem in Pem::iter_from_buffer(text.as_bytes()) {
        let pem = pem.map_err(|e| CertificateError::Encoding(e.to_string()))?;
        if pem.label == PEM_CERTIFICATE_LABEL {
            return Ok(pem.contents);
        }
    }

    Err(CertificateError::Encoding("no certificate in PEM input".to_string()))
}

/// Lenient base64: whitespace (including line breaks) is ignored and padding
/// is optional.
fn decode_base64(encoded: &str) -> Result<Vec<u8>, String> {
    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    STANDARD_NO_PAD
        .decode(compact.trim_end_matches('='))
        .map_err(|e| e.to_string())
}
