//! Local-leg connector: plain TCP or TLS with configurable trust.
//!
//! Each tunnel connection pairs the remote socket with a connection to the
//! user's own server. That server is usually plain HTTP on loopback, but it
//! may also be an HTTPS server, self-signed in development or requiring a
//! client certificate in stricter setups. [`LocalConnectConfig`] covers the
//! whole range:
//!
//! - `https == false`: plain TCP
//! - `https == true, allow_invalid_cert == true`: TLS with server
//!   certificate verification disabled
//! - `https == true, allow_invalid_cert == false`: TLS presenting the
//!   configured client certificate and key, trusting the webpki roots plus
//!   an optional CA bundle
//!
//! Certificate material is read from disk synchronously at connect time;
//! read or parse failures surface as [`TunnelError::LocalConfig`].

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::TunnelError;

/// Configuration for the local leg of a tunnel connection.
///
/// # Construction
///
/// Use [`LocalConnectConfig::new()`] to create a configuration, then chain
/// `with_*` methods to customize it:
///
/// ```rust
/// use tnnlr::LocalConnectConfig;
///
/// let config = LocalConnectConfig::new("localhost", 8080);
/// let tls = LocalConnectConfig::new("app.internal", 8443).with_https(true);
/// ```
#[derive(Debug, Clone)]
pub struct LocalConnectConfig {
    /// Hostname of the local server
    pub host: String,

    /// Port of the local server
    pub port: u16,

    /// Whether to speak TLS on the local leg
    pub https: bool,

    /// Skip server certificate verification entirely.
    ///
    /// The local leg targets the operator's own machine, so the tunnel
    /// session enables this when it is not configured otherwise.
    pub allow_invalid_cert: bool,

    /// PEM file holding the client certificate chain to present
    pub cert_file: Option<PathBuf>,

    /// PEM file holding the client private key
    pub key_file: Option<PathBuf>,

    /// PEM file holding additional root CAs to trust
    pub ca_file: Option<PathBuf>,
}

impl LocalConnectConfig {
    /// Creates a plain-TCP configuration for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            https: false,
            allow_invalid_cert: false,
            cert_file: None,
            key_file: None,
            ca_file: None,
        }
    }

    /// Enables TLS on the local leg.
    pub fn with_https(mut self, https: bool) -> Self {
        self.https = https;
        self
    }

    /// Disables server certificate verification.
    pub fn with_allow_invalid_cert(mut self, allow: bool) -> Self {
        self.allow_invalid_cert = allow;
        self
    }

    /// Sets the client certificate and key to present to the local server.
    pub fn with_client_cert(mut self, cert: PathBuf, key: PathBuf) -> Self {
        self.cert_file = Some(cert);
        self.key_file = Some(key);
        self
    }

    /// Sets a custom root CA bundle to trust.
    ///
    /// The provided path should point to a PEM file containing one or more
    /// CA certificates. These will be trusted in addition to the webpki
    /// root certificates.
    pub fn with_trust_ca(mut self, path: PathBuf) -> Self {
        self.ca_file = Some(path);
        self
    }
}

/// A connection to the local server, plain or TLS.
#[derive(Debug)]
pub enum LocalStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for LocalStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            LocalStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LocalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            LocalStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_flush(cx),
            LocalStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            LocalStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Opens a connection to the local server per `config`.
///
/// TLS configuration (including any certificate file reads) is resolved
/// before dialing, so a misconfigured TLS setup fails without touching the
/// network. `ECONNREFUSED` on the dial is distinguished in the returned
/// error.
pub(crate) async fn connect(config: &LocalConnectConfig) -> Result<LocalStream, TunnelError> {
    let tls = if config.https {
        let tls_config = if config.allow_invalid_cert {
            insecure_tls_config()
        } else {
            verified_tls_config(config)?
        };
        Some(TlsConnector::from(Arc::new(tls_config)))
    } else {
        None
    };

    let stream = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map_err(|e| TunnelError::local_dial(&e))?;

    let Some(connector) = tls else {
        tracing::debug!(host = %config.host, port = config.port, "local connection established");
        return Ok(LocalStream::Plain(stream));
    };

    let server_name = ServerName::try_from(config.host.clone())
        .map_err(|e| TunnelError::LocalConfig(Arc::from(format!("invalid host name: {e}"))))?;
    let stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| TunnelError::local_dial(&e))?;
    tracing::debug!(host = %config.host, port = config.port, "local TLS connection established");
    Ok(LocalStream::Tls(Box::new(stream)))
}

/// TLS client config that accepts any server certificate.
fn insecure_tls_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth()
}

/// TLS client config trusting webpki roots plus the optional CA bundle,
/// presenting the configured client certificate when one is given.
fn verified_tls_config(config: &LocalConnectConfig) -> Result<rustls::ClientConfig, TunnelError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(ca_path) = &config.ca_file {
        for cert in load_certs(ca_path)? {
            roots.add(cert).map_err(|e| {
                TunnelError::LocalConfig(Arc::from(format!("failed to add CA certificate: {e}")))
            })?;
        }
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    match (&config.cert_file, &config.key_file) {
        (Some(cert_path), Some(key_path)) => {
            let chain = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            builder.with_client_auth_cert(chain, key).map_err(|e| {
                TunnelError::LocalConfig(Arc::from(format!("invalid client certificate: {e}")))
            })
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(TunnelError::LocalConfig(Arc::from(
            "client certificate and key must be configured together",
        ))),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let file = std::fs::File::open(path).map_err(|e| {
        TunnelError::LocalConfig(Arc::from(format!("failed to open {}: {e}", path.display())))
    })?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            TunnelError::LocalConfig(Arc::from(format!(
                "failed to parse certificates from {}: {e}",
                path.display()
            )))
        })?;
    if certs.is_empty() {
        return Err(TunnelError::LocalConfig(Arc::from(format!(
            "no certificates found in {}",
            path.display()
        ))));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TunnelError> {
    let file = std::fs::File::open(path).map_err(|e| {
        TunnelError::LocalConfig(Arc::from(format!("failed to open {}: {e}", path.display())))
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            TunnelError::LocalConfig(Arc::from(format!(
                "failed to parse key from {}: {e}",
                path.display()
            )))
        })?
        .ok_or_else(|| {
            TunnelError::LocalConfig(Arc::from(format!(
                "no private key found in {}",
                path.display()
            )))
        })
}

/// Certificate verifier that accepts anything.
///
/// The local leg targets the operator's own machine; transport privacy is
/// still provided, identity is not checked.
#[derive(Debug)]
struct SkipServerVerification(rustls::crypto::CryptoProvider);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(rustls::crypto::ring::default_provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hi").await.unwrap();
        });

        let config = LocalConnectConfig::new("127.0.0.1", port);
        let mut stream = connect(&config).await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_refused_is_distinguished() {
        // Bind then drop to find a port with nothing listening on it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = LocalConnectConfig::new("127.0.0.1", port);
        let err = connect(&config).await.unwrap_err();
        assert!(matches!(err, TunnelError::LocalDial { refused: true, .. }));
    }

    #[tokio::test]
    async fn test_missing_cert_file_fails_before_dialing() {
        // No listener: the config error must surface before any dial.
        let config = LocalConnectConfig::new("127.0.0.1", 1)
            .with_https(true)
            .with_client_cert(
                PathBuf::from("/nonexistent/cert.pem"),
                PathBuf::from("/nonexistent/key.pem"),
            );
        let err = connect(&config).await.unwrap_err();
        assert!(matches!(err, TunnelError::LocalConfig(_)));
    }

    #[tokio::test]
    async fn test_cert_without_key_rejected() {
        let mut config = LocalConnectConfig::new("127.0.0.1", 1).with_https(true);
        config.cert_file = Some(PathBuf::from("/nonexistent/cert.pem"));
        let err = connect(&config).await.unwrap_err();
        assert!(matches!(err, TunnelError::LocalConfig(_)));
    }
}
