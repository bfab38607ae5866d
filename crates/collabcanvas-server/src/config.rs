//! Server configuration from the environment.

use collabcanvas_core::ConfigError;
use std::net::SocketAddr;

/// Environment variable holding the listen address.
pub const ADDR_VAR: &str = "COLLABCANVAS_ADDR";
/// Listen address when none is configured.
pub const DEFAULT_ADDR: &str = "0.0.0.0:3030";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub addr: SocketAddr,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_value(std::env::var(ADDR_VAR).ok())
    }

    fn from_value(addr: Option<String>) -> Result<Self, ConfigError> {
        let raw = addr
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let addr = raw.parse().map_err(|e| ConfigError::Invalid {
            field: ADDR_VAR,
            reason: format!("{} ({})", raw, e),
        })?;
        Ok(Self { addr })
    }
}
