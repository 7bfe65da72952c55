//! Local forward proxy that relays browser traffic through an authenticated
//! upstream proxy, adding `Proxy-Authorization` on the way out.

pub mod bridge;
pub mod config;
pub mod error;
pub mod hooks;
pub mod http;
pub mod logging;
pub mod relay;
pub mod session;
pub mod stats;
pub mod supervisor;
pub mod upstream;


pub use bridge::{start, start_with_hooks, BridgeHandle};
pub use config::{BridgeConfig, Credentials, UpstreamProxy, UpstreamScheme};
pub use error::{BridgeError, ConfigError};
pub use hooks::{CredentialInjector, RelayHooks};
pub use stats::StatsSnapshot;
pub use supervisor::ChildGuard;
