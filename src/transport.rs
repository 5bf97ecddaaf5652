//! Validated encrypted connections to the backend.
//!
//! Every connection is TLS with SNI and certificate validation against the configured
//! hostname. Connect attempts are refused up front when the device clock has not been
//! synchronised, since certificate validity windows are meaningless without it.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::clock::Clock;

/// Failures within this window never reached the TLS layer (DNS, refused, unreachable).
const EARLY_FAILURE_WINDOW: Duration = Duration::from_secs(1);

/// Byte stream returned by a [`Connector`]
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type Connection = Box<dyn AsyncStream>;

/// Diagnostic hint for operators; callers treat every class as the same failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    EarlyNetwork,
    Handshake,
    LateTimeout,
}

impl FailureClass {
    /// Classify a failed attempt purely by how long it took.
    pub fn from_elapsed(elapsed: Duration, budget: Duration) -> Self {
        if elapsed < EARLY_FAILURE_WINDOW {
            FailureClass::EarlyNetwork
        } else if elapsed.as_millis() * 10 >= budget.as_millis() * 9 {
            FailureClass::LateTimeout
        } else {
            FailureClass::Handshake
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::EarlyNetwork => "early-network-failure",
            FailureClass::Handshake => "handshake-failure",
            FailureClass::LateTimeout => "late-timeout",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("system clock is not synchronized; refusing to connect")]
    ClockNotSynchronized,
    #[error("invalid host {0:?}: a DNS hostname is required")]
    InvalidHost(String),
    #[error("non-validating TLS mode is refused in production builds")]
    InsecureModeRefused,
    #[error("TLS setup failed: {0}")]
    Setup(String),
    #[error("connection failed ({class}) after {elapsed:?}: {reason}")]
    Failed {
        class: FailureClass,
        elapsed: Duration,
        reason: String,
    },
}

impl TransportError {
    pub fn failed(class: FailureClass, elapsed: Duration, reason: impl Into<String>) -> Self {
        TransportError::Failed {
            class,
            elapsed,
            reason: reason.into(),
        }
    }

    /// Short tag for event logs and alert evidence
    pub fn reason_tag(&self) -> &'static str {
        match self {
            TransportError::ClockNotSynchronized => "clock-not-synchronized",
            TransportError::InvalidHost(_) => "invalid-host",
            TransportError::InsecureModeRefused => "insecure-mode-refused",
            TransportError::Setup(_) => "tls-setup",
            TransportError::Failed { class, .. } => class.as_str(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Skip certificate validation. Honoured only in debug builds.
    pub allow_insecure: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            request_timeout_ms: 10_000,
            allow_insecure: false,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Opens a connection to `host:port`. The production implementation is [`SecureTransport`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Connection, TransportError>;

    /// Bound for a single request/response exchange over a fresh connection.
    fn request_timeout(&self) -> Duration {
        Duration::from_millis(TransportConfig::default().request_timeout_ms)
    }
}

/// Reject empty names and IP literals; validation must run against a hostname.
pub fn validate_hostname(host: &str) -> Result<ServerName<'static>, TransportError> {
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    if trimmed.is_empty() || trimmed.parse::<IpAddr>().is_ok() {
        return Err(TransportError::InvalidHost(host.to_string()));
    }
    let name = ServerName::try_from(trimmed.to_string())
        .map_err(|_| TransportError::InvalidHost(host.to_string()))?;
    match name {
        ServerName::DnsName(_) => Ok(name),
        _ => Err(TransportError::InvalidHost(host.to_string())),
    }
}

/// TLS connector validating server certificates against the bundled web PKI roots
pub struct SecureTransport {
    config: TransportConfig,
    clock: Arc<dyn Clock>,
    tls: TlsConnector,
}

impl SecureTransport {
    pub fn new(config: TransportConfig, clock: Arc<dyn Clock>) -> Result<Self, TransportError> {
        let client_config = if config.allow_insecure {
            Self::insecure_client_config()?
        } else {
            Self::validating_client_config()?
        };

        Ok(Self {
            config,
            clock,
            tls: TlsConnector::from(Arc::new(client_config)),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn validating_client_config() -> Result<ClientConfig, TransportError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Setup(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(config)
    }

    #[cfg(debug_assertions)]
    fn insecure_client_config() -> Result<ClientConfig, TransportError> {
        warn!("TLS certificate validation DISABLED (development build only)");
        let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Setup(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(dev::NoVerifier))
            .with_no_client_auth();
        Ok(config)
    }

    #[cfg(not(debug_assertions))]
    fn insecure_client_config() -> Result<ClientConfig, TransportError> {
        log::error!("Refusing non-validating TLS mode in a production build");
        Err(TransportError::InsecureModeRefused)
    }
}

#[async_trait]
impl Connector for SecureTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<Connection, TransportError> {
        if !self.clock.is_synchronized() {
            warn!("Connect to {}:{} refused: clock not synchronized", host, port);
            return Err(TransportError::ClockNotSynchronized);
        }
        let server_name = validate_hostname(host)?;

        let budget = self.config.connect_timeout();
        let started = Instant::now();
        debug!("Connecting to {}:{} (timeout {:?})", host, port, budget);

        let attempt = async {
            let tcp = TcpStream::connect((host, port)).await?;
            tcp.set_nodelay(true)?;
            self.tls.connect(server_name, tcp).await
        };

        let outcome = match timeout(budget, attempt).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no response within {:?}", budget)),
        };

        let elapsed = started.elapsed();
        match outcome {
            Ok(stream) => {
                info!("Secure connection to {}:{} established in {:?}", host, port, elapsed);
                Ok(Box::new(stream))
            }
            Err(reason) => {
                let class = FailureClass::from_elapsed(elapsed, budget);
                warn!(
                    "Connection to {}:{} failed after {:?} [{}]: {}",
                    host,
                    port,
                    elapsed,
                    class.as_str(),
                    reason
                );
                Err(TransportError::failed(class, elapsed, reason))
            }
        }
    }

    fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }
}

#[cfg(debug_assertions)]
mod dev {
    use tokio_rustls::rustls;
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any certificate. Compiled into debug builds only.
    #[derive(Debug)]
    pub(super) struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::ED25519,
            ]
        }
    }
}
