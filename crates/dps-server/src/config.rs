//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::inbound::{
    InboundConfig, DEFAULT_INBOUND_CONCURRENCY, DEFAULT_INBOUND_MAX_REDELIVERIES,
    DEFAULT_INBOUND_QUEUE_CAPACITY, DEFAULT_INBOUND_REDELIVERY_DELAY_SECS,
};
use crate::notify::DEFAULT_NOTIFY_QUEUE_CAPACITY;
use crate::packaging::{AssemblerConfig, DEFAULT_MEMORY_THRESHOLD_BYTES};
use crate::transport::DEFAULT_TRANSPORT_TIMEOUT_SECS;
use crate::updater::{UpdaterConfig, DEFAULT_UPDATER_INITIAL_DELAY_SECS, DEFAULT_UPDATER_INTERVAL_SECS};

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/dps";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default root for the local byte source.
pub const DEFAULT_SOURCE_ROOT: &str = "./data/submissions";

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub updater: UpdaterSettings,
    pub transport: TransportSettings,
    pub packaging: PackagingSettings,
    pub inbound: InboundSettings,
    pub notify: NotifySettings,
    pub source: SourceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub initial_delay_secs: u64,
}

impl UpdaterSettings {
    pub fn to_updater_config(&self) -> UpdaterConfig {
        UpdaterConfig {
            interval: Duration::from_secs(self.interval_secs),
            initial_delay: Duration::from_secs(self.initial_delay_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagingSettings {
    pub memory_threshold_bytes: u64,
    pub spool_dir: Option<PathBuf>,
}

impl PackagingSettings {
    pub fn to_assembler_config(&self) -> AssemblerConfig {
        AssemblerConfig {
            memory_threshold_bytes: self.memory_threshold_bytes,
            spool_dir: self.spool_dir.clone().unwrap_or_else(std::env::temp_dir),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundSettings {
    pub queue_capacity: usize,
    pub concurrency: usize,
    pub max_redeliveries: u32,
    pub redelivery_delay_secs: u64,
}

impl InboundSettings {
    pub fn to_inbound_config(&self) -> InboundConfig {
        InboundConfig {
            queue_capacity: self.queue_capacity,
            concurrency: self.concurrency,
            max_redeliveries: self.max_redeliveries,
            redelivery_delay: Duration::from_secs(self.redelivery_delay_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySettings {
    pub queue_capacity: usize,
    pub webhook_url: Option<String>,
}

/// Where submission files are read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceBackend {
    Local,
    S3,
}

impl std::str::FromStr for SourceBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(SourceBackend::Local),
            "s3" => Ok(SourceBackend::S3),
            other => anyhow::bail!("Unknown source backend: {} (expected local or s3)", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    pub backend: SourceBackend,
    pub root: PathBuf,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            server: ServerConfig {
                host: std::env::var("DPS_HOST").unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string()),
                port: env_or("DPS_PORT", DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: env_or("DPS_SHUTDOWN_TIMEOUT", DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            updater: UpdaterSettings {
                enabled: env_or("DPS_UPDATER_ENABLED", true),
                interval_secs: env_or("DPS_UPDATER_INTERVAL_SECS", DEFAULT_UPDATER_INTERVAL_SECS),
                initial_delay_secs: env_or(
                    "DPS_UPDATER_INITIAL_DELAY_SECS",
                    DEFAULT_UPDATER_INITIAL_DELAY_SECS,
                ),
            },
            transport: TransportSettings {
                timeout_secs: env_or("DPS_TRANSPORT_TIMEOUT_SECS", DEFAULT_TRANSPORT_TIMEOUT_SECS),
            },
            packaging: PackagingSettings {
                memory_threshold_bytes: env_or(
                    "DPS_PACKAGE_MEMORY_THRESHOLD_BYTES",
                    DEFAULT_MEMORY_THRESHOLD_BYTES,
                ),
                spool_dir: env_opt("DPS_PACKAGE_SPOOL_DIR").map(PathBuf::from),
            },
            inbound: InboundSettings {
                queue_capacity: env_or("DPS_INBOUND_QUEUE_CAPACITY", DEFAULT_INBOUND_QUEUE_CAPACITY),
                concurrency: env_or("DPS_INBOUND_CONCURRENCY", DEFAULT_INBOUND_CONCURRENCY),
                max_redeliveries: env_or("DPS_INBOUND_MAX_REDELIVERIES", DEFAULT_INBOUND_MAX_REDELIVERIES),
                redelivery_delay_secs: env_or(
                    "DPS_INBOUND_REDELIVERY_DELAY_SECS",
                    DEFAULT_INBOUND_REDELIVERY_DELAY_SECS,
                ),
            },
            notify: NotifySettings {
                queue_capacity: env_or("DPS_NOTIFY_QUEUE_CAPACITY", DEFAULT_NOTIFY_QUEUE_CAPACITY),
                webhook_url: env_opt("DPS_NOTIFY_WEBHOOK_URL"),
            },
            source: SourceSettings {
                backend: match env_opt("DPS_SOURCE_BACKEND") {
                    Some(value) => value.parse()?,
                    None => SourceBackend::Local,
                },
                root: PathBuf::from(
                    env_opt("DPS_SOURCE_ROOT").unwrap_or_else(|| DEFAULT_SOURCE_ROOT.to_string()),
                ),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.updater.interval_secs == 0 {
            anyhow::bail!("DPS_UPDATER_INTERVAL_SECS must be greater than 0");
        }

        if self.transport.timeout_secs == 0 {
            anyhow::bail!("DPS_TRANSPORT_TIMEOUT_SECS must be greater than 0");
        }

        if self.inbound.concurrency == 0 || self.inbound.queue_capacity == 0 {
            anyhow::bail!("Inbound concurrency and queue capacity must be greater than 0");
        }

        if self.notify.queue_capacity == 0 {
            anyhow::bail!("DPS_NOTIFY_QUEUE_CAPACITY must be greater than 0");
        }

        if let Some(url) = &self.notify.webhook_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("DPS_NOTIFY_WEBHOOK_URL must be an http(s) URL, got {}", url);
            }
        }

        if !self.updater.enabled {
            tracing::warn!("Deposit updater disabled - deposit statuses will only change on ad hoc refresh");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            updater: UpdaterSettings {
                enabled: true,
                interval_secs: DEFAULT_UPDATER_INTERVAL_SECS,
                initial_delay_secs: DEFAULT_UPDATER_INITIAL_DELAY_SECS,
            },
            transport: TransportSettings {
                timeout_secs: DEFAULT_TRANSPORT_TIMEOUT_SECS,
            },
            packaging: PackagingSettings {
                memory_threshold_bytes: DEFAULT_MEMORY_THRESHOLD_BYTES,
                spool_dir: None,
            },
            inbound: InboundSettings {
                queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
                concurrency: DEFAULT_INBOUND_CONCURRENCY,
                max_redeliveries: DEFAULT_INBOUND_MAX_REDELIVERIES,
                redelivery_delay_secs: DEFAULT_INBOUND_REDELIVERY_DELAY_SECS,
            },
            notify: NotifySettings {
                queue_capacity: DEFAULT_NOTIFY_QUEUE_CAPACITY,
                webhook_url: None,
            },
            source: SourceSettings {
                backend: SourceBackend::Local,
                root: PathBuf::from(DEFAULT_SOURCE_ROOT),
            },
        }
    }
}
