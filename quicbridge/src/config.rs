//! Connection and listener configuration

use bytes::Bytes;
use quicbridge_engine::CertificateView;
use std::time::Duration;

/// Credential material presented by a listener.
///
/// The contents are opaque to this layer; TLS itself lives behind the
/// engine boundary. What matters here is only that the bytes reach the
/// peer's validation hook unchanged.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Certificate presented to connecting clients.
    pub certificate: CertificateView,
}

impl Credentials {
    /// Wrap existing certificate material.
    pub fn new(certificate: CertificateView) -> Self {
        Self { certificate }
    }

    /// Placeholder credentials for tests and local development. Real
    /// deployments load certificate material from their credential store.
    pub fn self_signed(subject: &str) -> Self {
        Self {
            certificate: CertificateView {
                der: Bytes::from(format!("self-signed:{subject}").into_bytes()),
                subject: subject.to_owned(),
            },
        }
    }
}

/// Configuration for listeners and the server connections they accept.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Application protocol negotiated with clients.
    pub alpn: Bytes,
    /// Credentials presented during the handshake.
    pub credentials: Credentials,
    /// Application payload embedded in issued resumption tickets; returned
    /// to the server as resumption state when a client resumes. Empty emits
    /// a bare finalizing ticket.
    pub resumption_payload: Bytes,
    /// Idle timeout applied to accepted connections.
    pub idle_timeout: Duration,
    /// Whether unreliable datagrams are negotiated.
    pub datagrams_enabled: bool,
}

impl ServerConfig {
    /// Server configuration with defaults for everything but the protocol
    /// and credentials.
    pub fn new(alpn: &str, credentials: Credentials) -> Self {
        Self {
            alpn: Bytes::copy_from_slice(alpn.as_bytes()),
            credentials,
            resumption_payload: Bytes::new(),
            idle_timeout: Duration::from_secs(60),
            datagrams_enabled: true,
        }
    }
}

/// Configuration for outbound connections.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Application protocol to negotiate.
    pub alpn: Bytes,
    /// Resumption ticket from an earlier connection; presenting one enables
    /// 0-RTT sends before the handshake confirms.
    pub resumption_ticket: Option<Bytes>,
    /// Idle timeout for the connection.
    pub idle_timeout: Duration,
    /// Whether unreliable datagrams are negotiated.
    pub datagrams_enabled: bool,
}

impl ClientConfig {
    /// Client configuration with defaults for everything but the protocol.
    pub fn new(alpn: &str) -> Self {
        Self {
            alpn: Bytes::copy_from_slice(alpn.as_bytes()),
            resumption_ticket: None,
            idle_timeout: Duration::from_secs(60),
            datagrams_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults() {
        let config = ServerConfig::new("test", Credentials::self_signed("localhost"));
        assert_eq!(config.alpn.as_ref(), b"test");
        assert!(config.resumption_payload.is_empty());
        assert!(config.datagrams_enabled);
    }

    #[test]
    fn self_signed_credentials_carry_the_subject() {
        let creds = Credentials::self_signed("localhost");
        assert_eq!(creds.certificate.subject, "localhost");
    }
}
