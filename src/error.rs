//! Error types for the bridge.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Startup-time configuration problems. Always fatal before binding.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no upstream proxy configured (set --upstream or one of {0})")]
    MissingUpstream(String),

    #[error("invalid upstream proxy URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported upstream proxy scheme `{0}` (expected http or https)")]
    UnsupportedScheme(String),

    #[error("upstream proxy URL has no host")]
    MissingHost,

    #[error("upstream proxy credentials need both a username and a password")]
    IncompleteCredentials,

    #[error("invalid bind address {host}:{port}: {reason}")]
    InvalidBindAddress {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("failed to prepare upstream TLS: {0}")]
    Tls(String),
}

/// Errors raised by the bridge and its relay sessions.
///
/// Only `Config` and `Bind` escape [`crate::bridge::start`]; every other
/// variant stays inside the session that produced it.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("cannot reach upstream proxy {addr}: {source}")]
    UpstreamConnect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("upstream proxy {addr} did not respond within {timeout:?}")]
    UpstreamTimeout { addr: String, timeout: Duration },

    #[error("malformed response from upstream proxy: {0}")]
    UpstreamProtocol(String),

    #[error("malformed client request: {0}")]
    ClientProtocol(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// Status line sent back to the client when a session fails before a
    /// response was relayed. `None` means close without answering.
    pub fn status_code(&self) -> Option<(u16, &'static str)> {
        match self {
            BridgeError::UpstreamConnect { .. } | BridgeError::UpstreamProtocol(_) => {
                Some((502, "Bad Gateway"))
            }
            BridgeError::UpstreamTimeout { .. } => Some((504, "Gateway Timeout")),
            BridgeError::Rejected(_) => Some((403, "Forbidden")),
            BridgeError::ClientProtocol(_)
            | BridgeError::Config(_)
            | BridgeError::Bind { .. }
            | BridgeError::Io(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_errors_map_to_gateway_statuses() {
        let connect = BridgeError::UpstreamConnect {
            addr: "proxy.example:9000".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(connect.status_code(), Some((502, "Bad Gateway")));

        let timeout = BridgeError::UpstreamTimeout {
            addr: "proxy.example:9000".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.status_code(), Some((504, "Gateway Timeout")));
    }

    #[test]
    fn test_client_protocol_error_gets_no_response() {
        let err = BridgeError::ClientProtocol("bad request line".to_string());
        assert_eq!(err.status_code(), None);
        assert!(err.to_string().contains("bad request line"));
    }

    #[test]
    fn test_config_error_is_transparent() {
        let err = BridgeError::from(ConfigError::MissingHost);
        assert_eq!(err.to_string(), ConfigError::MissingHost.to_string());
    }
}
