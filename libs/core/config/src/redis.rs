use crate::{env_parse, env_required, ConfigError, FromEnv};

/// Redis connection settings
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
    /// Connection attempts retried at startup before giving up
    pub connect_retries: u32,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_retries: 3,
        }
    }

    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }
}

impl FromEnv for RedisConfig {
    /// Requires REDIS_URL; REDIS_CONNECT_RETRIES defaults to 3
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_required("REDIS_URL")?,
            connect_retries: env_parse("REDIS_CONNECT_RETRIES", 3)?,
        })
    }
}
