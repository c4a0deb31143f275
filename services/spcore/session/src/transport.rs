//! TCP and TLS transport for controller sessions.
//!
//! This module provides plain TCP dialing and listening, the unified
//! [`IoStream`] type, and (with the `tls` feature) client- and server-role
//! TLS handshakes with a pluggable certificate validation policy.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use crate::config::{ServerIdentity, TlsSettings};
use crate::SessionError;

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS stream accepted from a dialing controller
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// TLS stream to a controller this side dialed
    #[cfg(feature = "tls")]
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => stream.get_ref().0.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    /// Whether the stream is encrypted
    pub fn is_tls(&self) -> bool {
        !matches!(self, IoStream::Plain(_))
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to `host:port`, resolving the host, bounded by `timeout`
pub async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, SessionError> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(SessionError::Io(e)),
        Err(_) => Err(SessionError::ConnectTimeout(timeout)),
    }
}

/// TLS configuration resolved once per fleet and shared by its sessions
#[derive(Clone, Default)]
pub struct TlsContext {
    enabled: bool,
    settings: TlsSettings,
    #[cfg(feature = "tls")]
    client: Option<std::sync::Arc<rustls::ClientConfig>>,
    #[cfg(feature = "tls")]
    server: Option<std::sync::Arc<rustls::ServerConfig>>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("enabled", &self.enabled)
            .field("settings", &self.settings)
            .finish()
    }
}

impl TlsContext {
    /// Context that never wraps streams
    pub fn plain() -> Self {
        Self::default()
    }

    /// Build client and server configurations from settings
    pub fn from_settings(
        settings: &TlsSettings,
        identity: Option<&ServerIdentity>,
    ) -> anyhow::Result<Self> {
        if !settings.use_encryption {
            return Ok(Self {
                enabled: false,
                settings: settings.clone(),
                ..Default::default()
            });
        }

        #[cfg(not(feature = "tls"))]
        {
            let _ = identity;
            anyhow::bail!("TLS requested but not compiled with TLS support. Build with --features tls");
        }

        #[cfg(feature = "tls")]
        {
            let client = tls::make_client_config(settings)?;
            let server = match identity {
                Some(identity) => Some(std::sync::Arc::new(tls::make_server_config(
                    settings, identity,
                )?)),
                None => None,
            };
            Ok(Self {
                enabled: true,
                settings: settings.clone(),
                client: Some(std::sync::Arc::new(client)),
                server,
            })
        }
    }

    /// Whether streams are wrapped in TLS
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Client-role handshake towards `host`
    pub async fn wrap_client(&self, stream: TcpStream, host: &str) -> Result<IoStream, SessionError> {
        if !self.enabled {
            return Ok(IoStream::Plain(stream));
        }
        #[cfg(feature = "tls")]
        {
            let config = self
                .client
                .clone()
                .ok_or_else(|| SessionError::Tls("client configuration missing".into()))?;
            let sni = self.settings.server_name_for(host);
            tls::connect_tls(config, stream, sni)
                .await
                .map_err(|e| SessionError::Tls(format!("{:#}", e)))
        }
        #[cfg(not(feature = "tls"))]
        {
            let _ = host;
            Err(SessionError::Tls("not compiled with TLS support".into()))
        }
    }

    /// Server-role handshake for a controller that dialed in
    pub async fn wrap_server(&self, stream: TcpStream) -> Result<IoStream, SessionError> {
        if !self.enabled {
            return Ok(IoStream::Plain(stream));
        }
        #[cfg(feature = "tls")]
        {
            let config = self.server.clone().ok_or_else(|| {
                SessionError::Tls("no server certificate configured for inbound TLS".into())
            })?;
            tls::accept_tls(config, stream)
                .await
                .map_err(|e| SessionError::Tls(format!("{:#}", e)))
        }
        #[cfg(not(feature = "tls"))]
        {
            drop(stream);
            Err(SessionError::Tls("not compiled with TLS support".into()))
        }
    }
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS handshakes and certificate policy
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use bitflags::bitflags;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::client::WebPkiServerVerifier;
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
    use rustls::{
        CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig,
        SignatureScheme, SupportedProtocolVersion,
    };
    use std::sync::Arc;
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use tracing::{debug, info, warn};

    use crate::config::TlsProtocol;

    bitflags! {
        /// Classes of certificate validation failure
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct CertErrors: u8 {
            /// Certificate is not valid for the requested name
            const NAME_MISMATCH = 1 << 0;
            /// Chain does not lead to a trusted root, or is otherwise invalid
            const CHAIN = 1 << 1;
        }
    }

    /// How server certificates presented by controllers are validated
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum CertificatePolicy {
        /// Accept any certificate
        AcceptAll,
        /// Validate against the configured roots, tolerating the given error classes
        Strict {
            /// Error classes that are logged and accepted
            ignorable: CertErrors,
        },
    }

    impl CertificatePolicy {
        /// Policy described by the settings
        pub fn from_settings(settings: &TlsSettings) -> Self {
            if settings.accept_any_certificate {
                CertificatePolicy::AcceptAll
            } else if settings.ignore_cert_errors {
                CertificatePolicy::Strict {
                    ignorable: CertErrors::NAME_MISMATCH | CertErrors::CHAIN,
                }
            } else {
                CertificatePolicy::Strict {
                    ignorable: CertErrors::empty(),
                }
            }
        }

        fn tolerates(&self, errors: CertErrors) -> bool {
            match self {
                CertificatePolicy::AcceptAll => true,
                CertificatePolicy::Strict { ignorable } => ignorable.contains(errors),
            }
        }
    }

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    fn protocol_versions(settings: &TlsSettings) -> Vec<&'static SupportedProtocolVersion> {
        if settings.enabled_protocols.is_empty() {
            return rustls::ALL_VERSIONS.to_vec();
        }
        settings
            .enabled_protocols
            .iter()
            .map(|protocol| match protocol {
                TlsProtocol::Tls12 => &rustls::version::TLS12,
                TlsProtocol::Tls13 => &rustls::version::TLS13,
            })
            .collect()
    }

    fn load_roots(settings: &TlsSettings) -> Result<Option<Arc<RootCertStore>>> {
        let Some(path) = &settings.ca_file else {
            return Ok(None);
        };
        let pem = std::fs::read(path)
            .with_context(|| format!("Failed to read CA file {:?}", path))?;
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.context("Failed to parse CA certificates")?;
            roots
                .add(cert)
                .context("Failed to add CA certificate to root store")?;
        }
        Ok(Some(Arc::new(roots)))
    }

    /// Validates server certificates according to a [`CertificatePolicy`]
    #[derive(Debug)]
    pub struct PolicyVerifier {
        policy: CertificatePolicy,
        inner: Option<Arc<WebPkiServerVerifier>>,
        provider: Arc<CryptoProvider>,
    }

    impl PolicyVerifier {
        /// Build a verifier; strict validation without ignorable chain errors needs roots
        pub fn new(
            policy: CertificatePolicy,
            roots: Option<Arc<RootCertStore>>,
            provider: Arc<CryptoProvider>,
        ) -> Result<Self> {
            let inner = match roots {
                Some(roots) => Some(
                    WebPkiServerVerifier::builder_with_provider(roots, provider.clone())
                        .build()
                        .context("Failed to build server certificate verifier")?,
                ),
                None => None,
            };
            if inner.is_none() && !policy.tolerates(CertErrors::CHAIN) {
                anyhow::bail!("Strict certificate validation requires a CA file");
            }
            Ok(Self {
                policy,
                inner,
                provider,
            })
        }
    }

    fn classify(err: &rustls::Error) -> Option<CertErrors> {
        match err {
            rustls::Error::InvalidCertificate(CertificateError::NotValidForName) => {
                Some(CertErrors::NAME_MISMATCH)
            }
            rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
                Some(CertErrors::CHAIN)
            }
            _ => None,
        }
    }

    fn describe(cert: &CertificateDer<'_>) -> String {
        match x509_parser::parse_x509_certificate(cert.as_ref()) {
            Ok((_, parsed)) => parsed.subject().to_string(),
            Err(_) => "<unparseable certificate>".to_string(),
        }
    }

    impl ServerCertVerifier for PolicyVerifier {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            if self.policy == CertificatePolicy::AcceptAll {
                return Ok(ServerCertVerified::assertion());
            }
            let outcome = match &self.inner {
                Some(inner) => inner.verify_server_cert(
                    end_entity,
                    intermediates,
                    server_name,
                    ocsp_response,
                    now,
                ),
                None => Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)),
            };
            match outcome {
                Ok(verified) => Ok(verified),
                Err(err) => match classify(&err) {
                    Some(class) if self.policy.tolerates(class) => {
                        warn!(
                            "Ignoring certificate error for {:?} ({}): {}",
                            server_name,
                            describe(end_entity),
                            err
                        );
                        Ok(ServerCertVerified::assertion())
                    }
                    _ => Err(err),
                },
            }
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
                &self.provider.signature_verification_algorithms,
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
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    /// Create the client configuration used when dialing controllers
    pub fn make_client_config(settings: &TlsSettings) -> Result<ClientConfig> {
        let policy = CertificatePolicy::from_settings(settings);
        info!("Creating TLS client configuration (policy: {:?})", policy);

        let provider = provider();
        let verifier = PolicyVerifier::new(policy, load_roots(settings)?, provider.clone())?;
        let config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&protocol_versions(settings))
            .context("Unsupported TLS protocol selection")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        Ok(config)
    }

    /// Create the server configuration used when controllers dial in
    pub fn make_server_config(settings: &TlsSettings, identity: &ServerIdentity) -> Result<ServerConfig> {
        info!(
            "Creating TLS server configuration from cert={:?}, key={:?}",
            identity.cert_file, identity.key_file
        );

        let cert_pem = std::fs::read(&identity.cert_file)
            .with_context(|| format!("Failed to read certificate file {:?}", identity.cert_file))?;
        let key_pem = std::fs::read(&identity.key_file)
            .with_context(|| format!("Failed to read private key file {:?}", identity.key_file))?;

        let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse certificate chain")?;
        if certs.is_empty() {
            anyhow::bail!("No certificates found in certificate chain");
        }

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow::anyhow!("No private key found"))?;

        let config = ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&protocol_versions(settings))
            .context("Unsupported TLS protocol selection")?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("Failed to configure server certificate")?;
        Ok(config)
    }

    /// Accept a TLS connection from a controller
    pub async fn accept_tls(config: Arc<ServerConfig>, tcp_stream: TcpStream) -> Result<IoStream> {
        let peer = tcp_stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        debug!("Accepting TLS connection from {}", peer);

        let tls_stream = TlsAcceptor::from(config)
            .accept(tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {}", peer))?;

        debug!("TLS connection accepted from {}", peer);
        Ok(IoStream::Tls(Box::new(tls_stream)))
    }

    /// Connect via TLS to a controller
    pub async fn connect_tls(
        config: Arc<ClientConfig>,
        tcp_stream: TcpStream,
        sni: &str,
    ) -> Result<IoStream> {
        let peer = tcp_stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        debug!("Connecting via TLS to {} (SNI: {})", peer, sni);

        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", sni))?;

        let tls_stream = TlsConnector::from(config)
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {} (SNI: {})", peer, sni))?;

        debug!("TLS connection established with {}", peer);
        Ok(IoStream::TlsClient(Box::new(tls_stream)))
    }
}
