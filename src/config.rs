//! Broker configuration read from the environment.
//!
//! Every setting has a default suitable for local development, so a process
//! started without any `REDIS_*` variables talks to `redis://localhost:6379/0`.

use crate::error::BrokerError;

pub const DEFAULT_REDIS_HOST: &str = "localhost";
pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_REDIS_DB: i64 = 0;
/// Key prefix shared by every queue stored in the broker.
pub const DEFAULT_KEY_PREFIX: &str = "bull";

pub const ENV_REDIS_HOST: &str = "REDIS_HOST";
pub const ENV_REDIS_PORT: &str = "REDIS_PORT";
pub const ENV_REDIS_PASSWORD: &str = "REDIS_PASSWORD";
pub const ENV_REDIS_DB: &str = "REDIS_DB";
pub const ENV_QUEUE_PREFIX: &str = "QUEUE_PREFIX";

/// Connection settings shared by the command, subscribe and publish handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Logical database index.
    pub db: i64,
    pub prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_REDIS_HOST.to_string(),
            port: DEFAULT_REDIS_PORT,
            password: None,
            db: DEFAULT_REDIS_DB,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl BrokerConfig {
    /// Reads the configuration from process environment variables.
    pub fn from_env() -> Result<Self, BrokerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    ///
    /// Unset or blank variables fall back to their defaults. A port or
    /// database index that does not parse is rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BrokerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(host) = var(ENV_REDIS_HOST) {
            config.host = host.trim().to_string();
        }
        if let Some(port) = var(ENV_REDIS_PORT) {
            config.port = port.trim().parse().map_err(|_| {
                BrokerError::InvalidConfig(format!("{ENV_REDIS_PORT} is not a valid port: {port}"))
            })?;
        }
        config.password = var(ENV_REDIS_PASSWORD);
        if let Some(db) = var(ENV_REDIS_DB) {
            config.db = db.trim().parse().map_err(|_| {
                BrokerError::InvalidConfig(format!("{ENV_REDIS_DB} is not a valid index: {db}"))
            })?;
        }
        if let Some(prefix) = var(ENV_QUEUE_PREFIX) {
            config.prefix = prefix.trim().to_string();
        }

        Ok(config)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Returns the connection URL for the `redis` client.
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                urlencoding::encode(password),
                self.host,
                self.port,
                self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Same as [`redis_url`](Self::redis_url) with the password masked, for logs.
    pub fn display_url(&self) -> String {
        match self.password {
            Some(_) => format!("redis://:***@{}:{}/{}", self.host, self.port, self.db),
            None => self.redis_url(),
        }
    }
}
