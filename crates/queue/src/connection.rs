//! Broker connection parameters resolved from the environment.

use std::str::FromStr;

/// Redis connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Logical database index.
    pub db: i64,
}

impl RedisConfig {
    /// Load the connection parameters from environment variables.
    ///
    /// | Env Var          | Default     |
    /// |------------------|-------------|
    /// | `REDIS_HOST`     | `localhost` |
    /// | `REDIS_PORT`     | `6379`      |
    /// | `REDIS_PASSWORD` | none        |
    /// | `REDIS_DB`       | `0`         |
    ///
    /// # Panics
    ///
    /// Panics if `REDIS_PORT` or `REDIS_DB` is set but not a valid number.
    pub fn from_env() -> Self {
        let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".into());

        let port: u16 = std::env::var("REDIS_PORT")
            .unwrap_or_else(|_| "6379".into())
            .parse()
            .expect("REDIS_PORT must be a valid u16");

        let password = std::env::var("REDIS_PASSWORD")
            .ok()
            .filter(|p| !p.is_empty());

        let db: i64 = std::env::var("REDIS_DB")
            .unwrap_or_else(|_| "0".into())
            .parse()
            .expect("REDIS_DB must be a valid i64");

        Self {
            host,
            port,
            password,
            db,
        }
    }

    /// Connection info for the Redis client.
    pub fn connection_info(&self) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: redis::RedisConnectionInfo {
                db: self.db,
                username: None,
                password: self.password.clone(),
                protocol: redis::ProtocolVersion::RESP2,
            },
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

/// Which backend stores the queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageType {
    #[default]
    Redis,
    /// Process-local storage; queues are not shared between processes.
    InMemory,
}

impl FromStr for StorageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StorageType::Redis),
            "in_memory" | "in-memory" | "memory" => Ok(StorageType::InMemory),
            other => Err(format!("unknown queue storage type '{other}'")),
        }
    }
}

/// Default key namespace, shared with existing dashboards.
pub const DEFAULT_QUEUE_PREFIX: &str = "bull";

/// Default bound on the initial broker connection.
const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5000;

/// Everything needed to open the shared broker backend.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub redis: RedisConfig,
    /// Key namespace; queue `q` is qualified as `<prefix>:q`.
    pub prefix: String,
    pub connection_timeout_ms: u64,
    pub storage_type: StorageType,
}

impl BrokerConfig {
    /// Load broker configuration from environment variables.
    ///
    /// In addition to the [`RedisConfig`] variables:
    ///
    /// | Env Var                       | Default |
    /// |-------------------------------|---------|
    /// | `QUEUE_PREFIX`                | `bull`  |
    /// | `REDIS_CONNECTION_TIMEOUT_MS` | `5000`  |
    /// | `QUEUE_STORAGE_TYPE`          | `redis` |
    ///
    /// # Panics
    ///
    /// Panics on malformed numeric values or an unknown storage type.
    pub fn from_env() -> Self {
        let prefix = std::env::var("QUEUE_PREFIX")
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_QUEUE_PREFIX.into());

        let connection_timeout_ms: u64 = std::env::var("REDIS_CONNECTION_TIMEOUT_MS")
            .unwrap_or_else(|_| DEFAULT_CONNECTION_TIMEOUT_MS.to_string())
            .parse()
            .expect("REDIS_CONNECTION_TIMEOUT_MS must be a valid u64");

        let storage_type: StorageType = std::env::var("QUEUE_STORAGE_TYPE")
            .unwrap_or_else(|_| "redis".into())
            .parse()
            .unwrap_or_else(|e| panic!("QUEUE_STORAGE_TYPE is invalid: {e}"));

        Self {
            redis: RedisConfig::from_env(),
            prefix,
            connection_timeout_ms,
            storage_type,
        }
    }
}
