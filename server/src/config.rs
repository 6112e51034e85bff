//! Configuration management for the server.

use rowsync_engine::{StrategyKind, System};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Prefix of every provenance id this instance mints
    pub instance_id: String,
    pub feed: FeedConfig,
    /// System A
    pub mysql: StoreConfig,
    /// System B
    pub postgres: StoreConfig,
    pub sync: SyncSettings,
    pub health: HealthConfig,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    File,
    Kafka,
}

impl FromStr for FeedKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(FeedKind::File),
            "kafka" => Ok(FeedKind::Kafka),
            other => Err(format!("unknown feed '{other}', expected 'file' or 'kafka'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub kind: FeedKind,
    pub bootstrap_servers: String,
    pub group_id: String,
    pub system_a_topic_prefix: String,
    pub system_b_topic_prefix: String,
    pub outcome_topic: String,
    /// NDJSON replay source, `-` for stdin
    pub file: String,
}

/// Connection parameters for one target database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl StoreConfig {
    /// Connection URL with the password masked, for log lines.
    pub fn redacted_url(&self, scheme: &str) -> String {
        format!(
            "{scheme}://{}:***@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub initial_sync: bool,
    pub default_strategy: StrategyKind,
    pub workers: usize,
    pub mappings_file: Option<PathBuf>,
    pub provenance_column: Option<String>,
    pub source_priority: Option<System>,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub interval: Duration,
    pub error_rate: f64,
    pub latency_ms: f64,
    pub queue_size: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let feed = FeedConfig {
            kind: vars.parsed("SYNC_FEED", FeedKind::File)?,
            bootstrap_servers: vars.string("KAFKA_BOOTSTRAP_SERVERS", "localhost:29092"),
            group_id: vars.string("SYNC_CONSUMER_GROUP_ID", "db-sync-service"),
            system_a_topic_prefix: vars.string("SYNC_SYSTEM_A_TOPIC_PREFIX", "mysql.sync."),
            system_b_topic_prefix: vars.string("SYNC_SYSTEM_B_TOPIC_PREFIX", "postgres.sync."),
            outcome_topic: vars.string("SYNC_OUTCOME_TOPIC", "sync.events"),
            file: vars.string("SYNC_FEED_FILE", "-"),
        };

        let mysql = StoreConfig {
            host: vars.string("MYSQL_HOST", "localhost"),
            port: vars.parsed("MYSQL_PORT", 3306)?,
            user: vars.string("MYSQL_USER", "root"),
            password: vars.string("MYSQL_PASSWORD", "rootpassword"),
            database: vars.string("MYSQL_DATABASE", "legacy_db"),
        };

        let postgres = StoreConfig {
            host: vars.string("POSTGRES_HOST", "localhost"),
            port: vars.parsed("POSTGRES_PORT", 5432)?,
            user: vars.string("POSTGRES_USER", "postgres"),
            password: vars.string("POSTGRES_PASSWORD", "postgres"),
            database: vars.string("POSTGRES_DATABASE", "new_db"),
        };

        let default_strategy = match vars.get("SYNC_CONFLICT_RESOLUTION_STRATEGY") {
            None => StrategyKind::Timestamp,
            Some(raw) => match raw.parse::<StrategyKind>() {
                Ok(kind @ (StrategyKind::Timestamp | StrategyKind::Version)) => kind,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: "SYNC_CONFLICT_RESOLUTION_STRATEGY",
                        reason: format!("'{raw}' is not 'timestamp' or 'version'"),
                    })
                }
            },
        };

        let source_priority = match vars.get("SYNC_SOURCE_PRIORITY") {
            None => None,
            Some(raw) => Some(parse_system(&raw).ok_or_else(|| ConfigError::InvalidValue {
                var: "SYNC_SOURCE_PRIORITY",
                reason: format!("'{raw}' is not 'a' or 'b'"),
            })?),
        };

        let batch_size: usize = vars.parsed("SYNC_BATCH_SIZE", 1000)?;
        let workers: usize = vars.parsed("SYNC_WORKERS", 4)?;
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                var: "SYNC_BATCH_SIZE",
                reason: "must be at least 1".into(),
            });
        }
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                var: "SYNC_WORKERS",
                reason: "must be at least 1".into(),
            });
        }

        let sync = SyncSettings {
            batch_size,
            initial_sync: vars.flag("SYNC_ENABLE_INITIAL_SYNC", false)?,
            default_strategy,
            workers,
            mappings_file: vars.get("SYNC_MAPPINGS_FILE").map(PathBuf::from),
            provenance_column: vars.get("SYNC_PROVENANCE_COLUMN"),
            source_priority,
        };

        let health = HealthConfig {
            host: vars.string("HOST", "0.0.0.0"),
            port: vars.parsed("PORT", 3000)?,
            data_dir: PathBuf::from(vars.string("SYNC_DATA_DIR", ".")),
            interval: Duration::from_secs(vars.parsed("SYNC_HEALTH_INTERVAL_SECS", 30)?),
            error_rate: vars.parsed("SYNC_ALERT_ERROR_RATE", 0.05)?,
            latency_ms: vars.parsed("SYNC_ALERT_LATENCY_MS", 5000.0)?,
            queue_size: vars.parsed("SYNC_ALERT_QUEUE_SIZE", 1000)?,
        };

        Ok(Self {
            instance_id: vars.string("SYNC_INSTANCE_ID", "db-sync-service"),
            feed,
            mysql,
            postgres,
            sync,
            health,
            log_level: vars.string("SYNC_LOG_LEVEL", "info"),
        })
    }

    /// Tracing filter used when `RUST_LOG` is unset.
    ///
    /// A bare level applies to this service's crates only.
    pub fn log_filter(&self) -> String {
        let level = self.log_level.trim();
        if level.contains('=') || level.contains(',') {
            level.to_string()
        } else {
            format!("rowsync_server={level},rowsync_engine={level},tower_http={level}")
        }
    }
}

fn parse_system(raw: &str) -> Option<System> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "a" | "mysql" => Some(System::A),
        "b" | "postgres" | "postgresql" => Some(System::B),
        _ => None,
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
                var: key,
                value: raw,
            }),
        }
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    var: key,
                    reason: format!("'{raw}' is not a boolean"),
                }),
            },
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {var}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("Invalid {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },
}
