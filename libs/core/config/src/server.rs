use crate::{env_or_default, ConfigError, FromEnv};
use std::net::Ipv4Addr;

const DEFAULT_PORT: u16 = 3000;

/// HTTP listener settings for the monitor API
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Read `{prefix}_HOST` and `{prefix}_PORT`
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        let host_key = format!("{}_HOST", prefix);
        let port_key = format!("{}_PORT", prefix);

        let host = env_or_default(&host_key, &Ipv4Addr::UNSPECIFIED.to_string());
        let port = env_or_default(&port_key, &DEFAULT_PORT.to_string())
            .parse()
            .map_err(|e| ConfigError::ParseError {
                key: port_key,
                details: format!("{}", e),
            })?;

        Ok(Self { host, port })
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromEnv for ServerConfig {
    /// MONITOR_HOST defaults to 0.0.0.0, MONITOR_PORT to 3000
    fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_prefix("MONITOR")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED.to_string(), DEFAULT_PORT)
    }
}
