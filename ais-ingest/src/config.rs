use std::fmt;
use std::str::FromStr;
use std::time;

use ais_common::ais::BoundingBox;
use envconfig::Envconfig;
use sqlx::postgres::PgConnectOptions;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub stream: StreamConfig,

    #[envconfig(nested = true)]
    pub database: DatabaseConfig,

    #[envconfig(nested = true)]
    pub gate: GateConfig,

    #[envconfig(nested = true)]
    pub history: HistoryConfig,

    #[envconfig(nested = true)]
    pub cache: CacheConfig,

    #[envconfig(default = "1000")]
    pub shutdown_grace_ms: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct StreamConfig {
    #[envconfig(from = "AISSTREAM_API_KEY")]
    pub api_key: ApiKey,

    #[envconfig(from = "AISSTREAM_URL", default = "wss://stream.aisstream.io/v0/stream")]
    pub url: String,

    #[envconfig(from = "AISSTREAM_BOUNDING_BOX", default = "-180,-90,180,90")]
    pub bounding_box: BoundingBox,

    #[envconfig(from = "RECONNECT_FLOOR_MS", default = "1000")]
    pub reconnect_floor: EnvMsDuration,

    #[envconfig(from = "RECONNECT_MAX_MS", default = "60000")]
    pub reconnect_max: EnvMsDuration,

    #[envconfig(from = "RECONNECT_JITTER_MS", default = "300")]
    pub reconnect_jitter: EnvMsDuration,

    #[envconfig(from = "STREAM_CONNECT_TIMEOUT_MS", default = "30000")]
    pub connect_timeout: EnvMsDuration,

    // A connection that delivers nothing for this long is considered dead.
    #[envconfig(from = "STREAM_IDLE_TIMEOUT_MS", default = "120000")]
    pub idle_timeout: EnvMsDuration,

    #[envconfig(from = "MAX_CONCURRENT_HANDLERS", default = "1024")]
    pub max_concurrent_handlers: usize,
}

#[derive(Envconfig, Clone, Debug)]
pub struct DatabaseConfig {
    #[envconfig(from = "DB_USER")]
    pub user: Option<String>,

    #[envconfig(from = "DB_PSWD")]
    pub password: Option<Secret>,

    #[envconfig(from = "DB_HOST", default = "localhost")]
    pub host: String,

    #[envconfig(from = "DB_PORT", default = "5432")]
    pub port: u16,

    #[envconfig(from = "DB_NAME", default = "vessels")]
    pub name: String,

    #[envconfig(from = "MAX_PG_CONNECTIONS", default = "10")]
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Connection options, or `None` when credentials are missing and storage is disabled.
    pub fn connect_options(&self) -> Option<PgConnectOptions> {
        let user = self.user.as_deref().filter(|u| !u.is_empty())?;
        let password = self
            .password
            .as_ref()
            .map(Secret::expose)
            .filter(|p| !p.is_empty())?;

        Some(
            PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .database(&self.name)
                .username(user)
                .password(password),
        )
    }
}

#[derive(Envconfig, Clone, Copy, Debug)]
pub struct GateConfig {
    #[envconfig(from = "MIN_DISTANCE_METERS", default = "100")]
    pub min_distance_meters: f64,

    #[envconfig(from = "MIN_TIME_DIFF_MS", default = "300000")]
    pub min_time_diff_ms: i64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_distance_meters: 100.0,
            min_time_diff_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Envconfig, Clone, Copy, Debug)]
pub struct HistoryConfig {
    #[envconfig(from = "HISTORY_BUFFER_MAX", default = "5000")]
    pub buffer_max: usize,

    #[envconfig(from = "HISTORY_MAX_BATCH", default = "500")]
    pub max_batch: usize,

    #[envconfig(from = "HISTORY_FLUSH_INTERVAL_MS", default = "1000")]
    pub flush_interval: EnvMsDuration,

    #[envconfig(from = "HISTORY_RETRY_CAP", default = "3")]
    pub retry_cap: u32,

    #[envconfig(from = "SHUTDOWN_FLUSH_TIMEOUT_MS", default = "2000")]
    pub shutdown_flush_timeout: EnvMsDuration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            buffer_max: 5000,
            max_batch: 500,
            flush_interval: EnvMsDuration(time::Duration::from_millis(1000)),
            retry_cap: 3,
            shutdown_flush_timeout: EnvMsDuration(time::Duration::from_millis(2000)),
        }
    }
}

#[derive(Envconfig, Clone, Copy, Debug)]
pub struct CacheConfig {
    #[envconfig(from = "CACHE_TTL_MS", default = "86400000")]
    pub ttl: EnvMsDuration,

    #[envconfig(from = "CACHE_MAX_ENTRIES", default = "10000")]
    pub max_entries: usize,

    #[envconfig(from = "CACHE_CLEANUP_INTERVAL_MS", default = "600000")]
    pub cleanup_interval: EnvMsDuration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: EnvMsDuration(time::Duration::from_secs(24 * 60 * 60)),
            max_entries: 10_000,
            cleanup_interval: EnvMsDuration(time::Duration::from_secs(10 * 60)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected a duration in milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// A value that must never be printed.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted>")
    }
}

impl FromStr for Secret {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Secret(s.to_owned()))
    }
}

/// The stream credential. Required, and never printed.
#[derive(Clone, Debug)]
pub struct ApiKey(pub Secret);

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl fmt::Display for StringIsEmptyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "value must not be empty")
    }
}

impl FromStr for ApiKey {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(ApiKey(Secret(trimmed.to_owned())))
        }
    }
}

impl ApiKey {
    pub fn expose(&self) -> &str {
        self.0.expose()
    }
}
