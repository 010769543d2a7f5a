//! Upstream connections
//! Opens TCP or TLS streams to the remote side of a mapping

use crate::error::{ReproError, Result};
use crate::mapping::Mapping;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::warn;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Certificate verifier that accepts anything, used when insecure upstreams are allowed
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

/// Connects to mapped remotes, shared by every engine
#[derive(Clone)]
pub struct UpstreamConnector {
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    /// Create a connector; `allow_insecure` skips certificate validation entirely
    pub fn new(allow_insecure: bool) -> Self {
        let config = if allow_insecure {
            warn!("TLS certificate verification DISABLED for upstream connections");
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        Self {
            tls: TlsConnector::from(Arc::new(config)),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Override the TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Open a TCP connection to the mapping's remote
    pub async fn connect_tcp(&self, mapping: &Mapping) -> Result<TcpStream> {
        let addr = (mapping.remote_host(), mapping.remote_port());
        let unreachable = |message: String| ReproError::UpstreamUnreachable {
            remote: mapping.remote().to_string(),
            message,
        };

        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(unreachable(e.to_string())),
            Err(_) => Err(unreachable(format!(
                "connect timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }

    /// Run the TLS handshake over an open TCP stream
    pub async fn connect_tls(&self, mapping: &Mapping, stream: TcpStream) -> Result<TlsStream<TcpStream>> {
        let tls_error = |message: String| ReproError::TlsValidationFailure {
            remote: mapping.remote().to_string(),
            message,
        };

        let server_name = ServerName::try_from(mapping.remote_host())
            .map_err(|e| tls_error(e.to_string()))?
            .to_owned();

        self.tls
            .connect(server_name, stream)
            .await
            .map_err(|e| tls_error(e.to_string()))
    }
}
