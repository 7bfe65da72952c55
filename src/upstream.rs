use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::{BridgeConfig, UpstreamProxy, UpstreamScheme};
use crate::error::{BridgeError, ConfigError};

/// Any byte stream a session can relay over
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Opens connections to the configured upstream proxy.
///
/// Plain TCP for `http://` upstreams, TLS on top of TCP for `https://`.
/// Both the handshake and the TLS negotiation are bounded by the connect
/// timeout.
#[derive(Clone)]
pub struct UpstreamConnector {
    upstream: UpstreamProxy,
    timeout: Duration,
    tls: Option<(TlsConnector, ServerName)>,
}

impl UpstreamConnector {
    pub fn new(config: &BridgeConfig) -> Result<Self, ConfigError> {
        // the descriptor's fields are public, so it may not have come from `parse`
        if config.upstream.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        let tls = match config.upstream.scheme {
            UpstreamScheme::Http => None,
            UpstreamScheme::Https => {
                let client_config = tls_client_config(config.accept_invalid_upstream_certs)?;
                let server_name = ServerName::try_from(config.upstream.host.as_str())
                    .map_err(|e| ConfigError::Tls(format!("{}: {}", config.upstream.host, e)))?;
                Some((TlsConnector::from(Arc::new(client_config)), server_name))
            }
        };
        Ok(Self {
            upstream: config.upstream.clone(),
            timeout: config.connect_timeout,
            tls,
        })
    }

    pub fn upstream(&self) -> &UpstreamProxy {
        &self.upstream
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn connect(&self) -> Result<BoxedStream, BridgeError> {
        let addr = self.upstream.authority();
        let result = tokio::time::timeout(self.timeout, self.open(&addr)).await;
        match result {
            Ok(stream) => stream,
            Err(_) => Err(BridgeError::UpstreamTimeout {
                addr,
                timeout: self.timeout,
            }),
        }
    }

    async fn open(&self, addr: &str) -> Result<BoxedStream, BridgeError> {
        let connect_err = |source| BridgeError::UpstreamConnect {
            addr: addr.to_string(),
            source,
        };
        let tcp = TcpStream::connect((self.upstream.host.as_str(), self.upstream.port))
            .await
            .map_err(connect_err)?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY on upstream socket");
        }
        match &self.tls {
            None => Ok(Box::new(tcp) as BoxedStream),
            Some((connector, server_name)) => {
                let stream = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(connect_err)?;
                Ok(Box::new(stream) as BoxedStream)
            }
        }
    }
}

fn tls_client_config(accept_invalid_certs: bool) -> Result<ClientConfig, ConfigError> {
    let mut root_store = RootCertStore::empty();
    if !accept_invalid_certs {
        let native = rustls_native_certs::load_native_certs()
            .map_err(|e| ConfigError::Tls(format!("loading native certificates: {}", e)))?;
        let der: Vec<Vec<u8>> = native.into_iter().map(|cert| cert.0).collect();
        let (added, ignored) = root_store.add_parsable_certificates(&der);
        debug!(added, ignored, "loaded native root certificates");
    }

    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if accept_invalid_certs {
        warn!("upstream certificate verification is disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert));
    }
    Ok(config)
}

/// Verifier for sandboxes whose upstream presents an untrusted certificate
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
