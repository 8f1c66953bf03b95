//! Configuration management
//!
//! Everything is read from the process environment (after `.env` is loaded).
//! Outside `ENV=local` the service keys are mandatory; locally they fall back
//! to development defaults.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use tokenmedia_common::Chain;

use crate::storage::config::StorageConfig;

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
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/tokenmedia";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Media / Task Constants
// ============================================================================

pub const DEFAULT_IPFS_URL: &str = "https://ipfs.io";

pub const DEFAULT_ARWEAVE_URL: &str = "https://arweave.net";

/// Largest body the transports will read for a single media URL (512 MiB).
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 512 * 1024 * 1024;

pub const DEFAULT_TOKEN_PROCESSING_URL: &str = "http://127.0.0.1:8000";

pub const DEFAULT_TOKEN_PROCESSING_QUEUE: &str = "token-processing";

pub const DEFAULT_TASK_QUEUE_HOST: &str = "http://127.0.0.1:8123";

/// Environment name that relaxes required keys
pub const LOCAL_ENV: &str = "local";

/// Snapshot of the environment variables configuration is read from
#[derive(Debug, Clone, Default)]
pub struct EnvVars {
    vars: HashMap<String, String>,
}

impl EnvVars {
    pub fn from_process() -> Self {
        Self::from_pairs(std::env::vars())
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn environment(&self) -> String {
        self.get("ENV").unwrap_or(LOCAL_ENV).to_string()
    }

    pub fn is_local(&self) -> bool {
        self.environment() == LOCAL_ENV
    }

    /// Trimmed non-empty value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Value that must be set outside local; `local_default` applies locally
    pub fn required(&self, key: &str, local_default: &str) -> anyhow::Result<String> {
        match self.get(key) {
            Some(value) => Ok(value.to_string()),
            None if self.is_local() => Ok(local_default.to_string()),
            None => bail!("Missing required environment variable {}", key),
        }
    }

    /// Value that must be set outside local and has no local default
    pub fn required_opt(&self, key: &str) -> anyhow::Result<Option<String>> {
        match self.get(key) {
            Some(value) => Ok(Some(value.to_string())),
            None if self.is_local() => Ok(None),
            None => bail!("Missing required environment variable {}", key),
        }
    }

    pub fn parse_or<T>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
            None => Ok(default),
        }
    }

    /// All non-empty values whose key is `prefix` or starts with `prefix_`
    pub fn with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        let nested = format!("{}_", prefix);
        let mut found: Vec<(String, String)> = self
            .vars
            .iter()
            .filter(|(k, v)| (k.as_str() == prefix || k.starts_with(&nested)) && !v.trim().is_empty())
            .map(|(k, v)| (k.clone(), v.trim().to_string()))
            .collect();
        found.sort();
        found
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `ENV` value; `local` relaxes required keys
    pub environment: String,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub media: MediaConfig,
    pub providers: ProvidersConfig,
    pub tasks: TasksConfig,
    pub webhooks: WebhookConfig,
    pub reporting: ReportingConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Media fetching and transcoding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// IPFS gateway base, e.g. `https://ipfs.io`
    pub ipfs_url: String,
    pub arweave_url: String,
    /// Explicit ffmpeg binary; resolved from `PATH` when unset
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    pub max_download_bytes: u64,
}

/// Chain indexer endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Alchemy NFT API base URL per chain, API key included
    pub alchemy_urls: BTreeMap<Chain, String>,
    pub indexer_host: Option<String>,
}

/// Task dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Base URL of the task handler routes
    pub processing_url: String,
    pub processing_queue: String,
    pub queue_host: String,
    pub direct_dispatch_enabled: bool,
    pub skip_queues: BTreeSet<String>,
}

/// Webhook authentication
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Every configured `ALCHEMY_WEBHOOK_SECRET*` value
    #[serde(skip_serializing)]
    pub secrets: Vec<String>,
}

/// Error reporting collaborators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportingConfig {
    #[serde(skip_serializing)]
    pub github_api_key: Option<String>,
    #[serde(skip_serializing)]
    pub sentry_dsn: Option<String>,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env_vars(&EnvVars::from_process())
    }

    pub fn from_env_vars(env: &EnvVars) -> anyhow::Result<Self> {
        let mut alchemy_urls = BTreeMap::new();
        for chain in Chain::ALL {
            let key = format!("ALCHEMY_{}_API_URL", chain.env_suffix());
            if let Some(url) = env.required_opt(&key)? {
                alchemy_urls.insert(chain, url);
            }
        }

        let secrets: Vec<String> = env
            .with_prefix("ALCHEMY_WEBHOOK_SECRET")
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        if secrets.is_empty() && !env.is_local() {
            bail!("Missing required environment variable ALCHEMY_WEBHOOK_SECRET");
        }

        let config = Config {
            environment: env.environment(),
            server: ServerConfig {
                host: env.get("TOKENMEDIA_HOST").unwrap_or(DEFAULT_SERVER_HOST).to_string(),
                port: env.parse_or("TOKENMEDIA_PORT", DEFAULT_SERVER_PORT)?,
                shutdown_timeout_secs: env
                    .parse_or("TOKENMEDIA_SHUTDOWN_TIMEOUT", DEFAULT_SHUTDOWN_TIMEOUT_SECS)?,
            },
            database: DatabaseConfig {
                url: env.get("DATABASE_URL").unwrap_or(DEFAULT_DATABASE_URL).to_string(),
                max_connections: env
                    .parse_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS)?,
                min_connections: env
                    .parse_or("DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS)?,
                connect_timeout_secs: env
                    .parse_or("DATABASE_CONNECT_TIMEOUT", DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS)?,
                idle_timeout_secs: env
                    .parse_or("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS)?,
            },
            storage: StorageConfig::from_env_vars(env)?,
            media: MediaConfig {
                ipfs_url: env.required("IPFS_URL", DEFAULT_IPFS_URL)?,
                arweave_url: env.get("ARWEAVE_URL").unwrap_or(DEFAULT_ARWEAVE_URL).to_string(),
                ffmpeg_path: env.get("FFMPEG_PATH").map(PathBuf::from),
                ffprobe_path: env.get("FFPROBE_PATH").map(PathBuf::from),
                max_download_bytes: env
                    .parse_or("MEDIA_MAX_DOWNLOAD_BYTES", DEFAULT_MAX_DOWNLOAD_BYTES)?,
            },
            providers: ProvidersConfig {
                alchemy_urls,
                indexer_host: env.required_opt("INDEXER_HOST")?,
            },
            tasks: TasksConfig {
                processing_url: env
                    .required("TOKEN_PROCESSING_URL", DEFAULT_TOKEN_PROCESSING_URL)?,
                processing_queue: env
                    .required("TOKEN_PROCESSING_QUEUE", DEFAULT_TOKEN_PROCESSING_QUEUE)?,
                queue_host: env.required("TASK_QUEUE_HOST", DEFAULT_TASK_QUEUE_HOST)?,
                direct_dispatch_enabled: env
                    .parse_or("CLOUD_TASKS_DIRECT_DISPATCH_ENABLED", env.is_local())?,
                skip_queues: env
                    .get("CLOUD_TASKS_SKIP_QUEUES")
                    .map(|raw| {
                        raw.split(',')
                            .map(str::trim)
                            .filter(|q| !q.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            webhooks: WebhookConfig { secrets },
            reporting: ReportingConfig {
                github_api_key: env.required_opt("GITHUB_API_KEY")?,
                sentry_dsn: env.required_opt("SENTRY_DSN")?,
            },
        };

        config.validate()?;

        Ok(config)
    }

    pub fn is_local(&self) -> bool {
        self.environment == LOCAL_ENV
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.storage.bucket.is_empty() {
            bail!("Token content bucket cannot be empty");
        }

        for (name, value) in [
            ("IPFS_URL", &self.media.ipfs_url),
            ("ARWEAVE_URL", &self.media.arweave_url),
            ("TOKEN_PROCESSING_URL", &self.tasks.processing_url),
            ("TASK_QUEUE_HOST", &self.tasks.queue_host),
        ] {
            url::Url::parse(value).with_context(|| format!("{} is not a valid URL", name))?;
        }

        if self.media.max_download_bytes == 0 {
            bail!("MEDIA_MAX_DOWNLOAD_BYTES must be greater than 0");
        }

        if self.webhooks.secrets.is_empty() {
            tracing::warn!("No webhook secrets configured - webhook requests will be rejected");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: LOCAL_ENV.to_string(),
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
            storage: StorageConfig::default(),
            media: MediaConfig {
                ipfs_url: DEFAULT_IPFS_URL.to_string(),
                arweave_url: DEFAULT_ARWEAVE_URL.to_string(),
                ffmpeg_path: None,
                ffprobe_path: None,
                max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
            },
            providers: ProvidersConfig {
                alchemy_urls: BTreeMap::new(),
                indexer_host: None,
            },
            tasks: TasksConfig {
                processing_url: DEFAULT_TOKEN_PROCESSING_URL.to_string(),
                processing_queue: DEFAULT_TOKEN_PROCESSING_QUEUE.to_string(),
                queue_host: DEFAULT_TASK_QUEUE_HOST.to_string(),
                direct_dispatch_enabled: true,
                skip_queues: BTreeSet::new(),
            },
            webhooks: WebhookConfig::default(),
            reporting: ReportingConfig::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn production_vars() -> Vec<(&'static str, &'static str)> {
        vec![
            ("ENV", "production"),
            ("IPFS_URL", "https://gateway.example"),
            ("ALCHEMY_ETH_API_URL", "https://eth.example/v3/key"),
            ("ALCHEMY_OPTIMISM_API_URL", "https://op.example/v3/key"),
            ("ALCHEMY_POLYGON_API_URL", "https://poly.example/v3/key"),
            ("ALCHEMY_ARBITRUM_API_URL", "https://arb.example/v3/key"),
            ("ALCHEMY_BASE_API_URL", "https://base.example/v3/key"),
            ("ALCHEMY_BASE_SEPOLIA_API_URL", "https://sepolia.example/v3/key"),
            ("ALCHEMY_WEBHOOK_SECRET", "primary"),
            ("ALCHEMY_WEBHOOK_SECRET_POOLS", "pools"),
            ("GCLOUD_TOKEN_CONTENT_BUCKET", "token-content"),
            ("STORAGE_ACCESS_KEY", "key"),
            ("STORAGE_SECRET_KEY", "secret"),
            ("TOKEN_PROCESSING_URL", "https://tasks.example"),
            ("TOKEN_PROCESSING_QUEUE", "projects/p/locations/l/queues/media"),
            ("TASK_QUEUE_HOST", "https://queue.example"),
            ("CLOUD_TASKS_DIRECT_DISPATCH_ENABLED", "false"),
            ("CLOUD_TASKS_SKIP_QUEUES", "a, b,,"),
            ("INDEXER_HOST", "https://indexer.example"),
            ("GITHUB_API_KEY", "gh"),
            ("SENTRY_DSN", "https://sentry.example/1"),
        ]
    }

    #[test]
    fn test_local_defaults() {
        let config = Config::from_env_vars(&EnvVars::from_pairs([("ENV", "local")])).unwrap();
        assert!(config.is_local());
        assert_eq!(config.server.port, DEFAULT_SERVER_PORT);
        assert_eq!(config.media.ipfs_url, DEFAULT_IPFS_URL);
        assert!(config.tasks.direct_dispatch_enabled);
        assert!(config.providers.alchemy_urls.is_empty());
    }

    #[test]
    fn test_production_loads_every_key() {
        let config = Config::from_env_vars(&EnvVars::from_pairs(production_vars())).unwrap();
        assert!(!config.is_local());
        assert_eq!(config.providers.alchemy_urls.len(), Chain::ALL.len());
        assert_eq!(config.webhooks.secrets.len(), 2);
        assert!(!config.tasks.direct_dispatch_enabled);
        assert_eq!(
            config.tasks.skip_queues.iter().cloned().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(config.storage.bucket, "token-content");
    }

    #[test]
    fn test_production_requires_keys() {
        let vars: Vec<_> = production_vars()
            .into_iter()
            .filter(|(k, _)| *k != "TASK_QUEUE_HOST")
            .collect();
        let err = Config::from_env_vars(&EnvVars::from_pairs(vars)).unwrap_err();
        assert!(err.to_string().contains("TASK_QUEUE_HOST"));
    }

    #[test]
    fn test_malformed_number_is_rejected() {
        let env = EnvVars::from_pairs([("ENV", "local"), ("TOKENMEDIA_PORT", "eighty")]);
        assert!(Config::from_env_vars(&env).is_err());
    }

    #[test]
    fn test_validate_pool_bounds() {
        let mut config = Config::default();
        config.database.min_connections = 20;
        assert!(config.validate().is_err());
    }
}
