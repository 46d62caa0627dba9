//! Pool configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connection string handed to every new connection
    pub connection_string: String,
    /// Connections opened up front; idle eviction never goes below this
    pub initial_size: usize,
    /// Upper bound on active + idle connections
    pub max_size: usize,
    /// How long `acquire` waits for a free connection
    #[serde(rename = "connection_timeout_ms", with = "millis")]
    pub connection_timeout: Duration,
    /// Idle connections older than this are closed before the next acquire
    #[serde(rename = "max_idle_time_ms", with = "millis")]
    pub max_idle_time: Duration,
    /// Run a round-trip query on checkout
    pub validate_connections: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            initial_size: 1,
            max_size: 10,
            connection_timeout: Duration::from_secs(30),
            max_idle_time: Duration::from_secs(600),
            validate_connections: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration.
    pub fn new(connection_string: &str) -> Self {
        Self {
            connection_string: connection_string.to_string(),
            ..Default::default()
        }
    }

    /// Load from a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn initial_size(mut self, n: usize) -> Self {
        self.initial_size = n;
        self
    }

    pub fn max_size(mut self, n: usize) -> Self {
        self.max_size = n;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = idle;
        self
    }

    pub fn validate_connections(mut self, enabled: bool) -> Self {
        self.validate_connections = enabled;
        self
    }

    /// Check the size bounds.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("max_size must be at least 1".to_string()));
        }
        if self.initial_size > self.max_size {
            return Err(Error::Config(format!(
                "initial_size ({}) exceeds max_size ({})",
                self.initial_size, self.max_size
            )));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
