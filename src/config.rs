use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use url::{Host, Url};

use crate::error::ConfigError;

/// Environment variables consulted, in order, for the upstream proxy URL.
pub const UPSTREAM_ENV_VARS: [&str; 4] = ["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"];

pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";
pub const DEFAULT_BIND_PORT: u16 = 8888;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How the bridge talks to the upstream proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    Http,
    Https,
}

impl UpstreamScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            UpstreamScheme::Http => "http",
            UpstreamScheme::Https => "https",
        }
    }
}

/// Basic credentials for the upstream proxy
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The single upstream proxy every request is forwarded to.
///
/// Parsed once at startup and never mutated afterwards. `host` holds a bare
/// hostname or IP literal (IPv6 without brackets).
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    pub scheme: UpstreamScheme,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl UpstreamProxy {
    /// Parse `scheme://[username:password@]host[:port]`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" => UpstreamScheme::Http,
            "https" => UpstreamScheme::Https,
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(ConfigError::MissingHost),
        };

        if !matches!(url.path(), "" | "/") || url.query().is_some() || url.fragment().is_some() {
            return Err(ConfigError::InvalidUrl(
                "upstream proxy URL must not carry a path, query or fragment".to_string(),
            ));
        }

        // http and https always have a known default port
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ConfigError::InvalidUrl("missing port".to_string()))?;

        let credentials = match (url.username(), url.password()) {
            ("", None) => None,
            (user, Some(pass)) if !user.is_empty() => Some(Credentials {
                username: decode_component(user)?,
                password: decode_component(pass)?,
            }),
            _ => return Err(ConfigError::IncompleteCredentials),
        };

        Ok(Self {
            scheme,
            host,
            port,
            credentials,
        })
    }

    /// Load the upstream URL from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load the upstream URL from the first non-empty variable in
    /// [`UPSTREAM_ENV_VARS`] as reported by `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = UPSTREAM_ENV_VARS
            .iter()
            .filter_map(|name| lookup(name))
            .find(|value| !value.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingUpstream(UPSTREAM_ENV_VARS.join(", ")))?;
        Self::parse(&raw)
    }

    /// Value for the `Proxy-Authorization` header, if credentials are configured.
    pub fn authorization(&self) -> Option<String> {
        self.credentials.as_ref().map(|c| {
            let encoded = general_purpose::STANDARD.encode(format!("{}:{}", c.username, c.password));
            format!("Basic {}", encoded)
        })
    }

    /// `host:port` suitable for connecting and for log lines.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn decode_component(raw: &str) -> Result<String, ConfigError> {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| ConfigError::InvalidUrl(format!("bad percent-encoding in credentials: {}", e)))
}

impl fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamProxy")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credentials", &self.credentials)
            .finish()
    }
}

/// Never includes the password.
impl fmt::Display for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme.as_str())?;
        if let Some(creds) = &self.credentials {
            write!(f, "{}:***@", creds.username)?;
        }
        write!(f, "{}", self.authority())
    }
}

/// Immutable bridge configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub upstream: UpstreamProxy,
    /// Bound on the TCP (and TLS) handshake with the upstream and on the
    /// wait for its answer to CONNECT.
    pub connect_timeout: Duration,
    /// Close a tunnel after this long without traffic in either direction.
    pub idle_timeout: Option<Duration>,
    /// How long `stop` lets in-flight sessions drain before aborting them.
    pub shutdown_grace: Duration,
    /// Skip upstream certificate verification for `https://` upstreams.
    pub accept_invalid_upstream_certs: bool,
}

impl BridgeConfig {
    pub fn new(bind_host: impl Into<String>, bind_port: u16, upstream: UpstreamProxy) -> Self {
        Self {
            bind_host: bind_host.into(),
            bind_port,
            upstream,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            accept_invalid_upstream_certs: false,
        }
    }

    /// Bridge on the default local endpoint `127.0.0.1:8888`.
    pub fn local_default(upstream: UpstreamProxy) -> Self {
        Self::new(DEFAULT_BIND_HOST, DEFAULT_BIND_PORT, upstream)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_accept_invalid_upstream_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_upstream_certs = accept;
        self
    }

    /// Resolve the bind host to a concrete socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidBindAddress {
            host: self.bind_host.clone(),
            port: self.bind_port,
            reason,
        };
        (self.bind_host.as_str(), self.bind_port)
            .to_socket_addrs()
            .map_err(|e| invalid(e.to_string()))?
            .next()
            .ok_or_else(|| invalid("host resolved to no addresses".to_string()))
    }
}
