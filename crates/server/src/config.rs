// Server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own sizing variables in
// `db::pool::PoolConfig`.

use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_FLUSH_DEBOUNCE_MS: u64 = 2_000;
const DEFAULT_FLUSH_MAX_DEBOUNCE_MS: u64 = 10_000;
const DEFAULT_DOC_GRACE_PERIOD_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string. `None` runs against the in-memory store.
    pub database_url: Option<String>,
    /// Require TLS on the PostgreSQL connection.
    pub db_require_tls: bool,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `cdm_server=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Quiet time after the last merge before a document is flushed.
    pub flush_debounce: Duration,
    /// Upper bound between the first unflushed merge and its flush.
    pub flush_max_debounce: Duration,
    /// How long a document outlives its last connection.
    pub doc_grace_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CDM_HOST` | `0.0.0.0` |
    /// | `CDM_PORT` | `8080` |
    /// | `CDM_DATABASE_URL` | *(none, in-memory store)* |
    /// | `CDM_DB_REQUIRE_TLS` | `false` |
    /// | `CDM_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `CDM_LOG_FILTER` | `info` |
    /// | `CDM_LOG_FORMAT` | `text` |
    /// | `CDM_FLUSH_DEBOUNCE_MS` | `2000` |
    /// | `CDM_FLUSH_MAX_DEBOUNCE_MS` | `10000` |
    /// | `CDM_DOC_GRACE_PERIOD_MS` | `30000` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("CDM_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("CDM_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url = env("CDM_DATABASE_URL").ok().filter(|url| !url.trim().is_empty());
        let db_require_tls = env("CDM_DB_REQUIRE_TLS")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
            .unwrap_or(false);
        let cors_origins = env("CDM_CORS_ORIGINS").ok();

        let log_filter = env("CDM_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("CDM_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let millis = |key: &str, default: u64| {
            Duration::from_millis(env(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default))
        };
        let flush_debounce = millis("CDM_FLUSH_DEBOUNCE_MS", DEFAULT_FLUSH_DEBOUNCE_MS);
        let flush_max_debounce = millis("CDM_FLUSH_MAX_DEBOUNCE_MS", DEFAULT_FLUSH_MAX_DEBOUNCE_MS)
            .max(flush_debounce);
        let doc_grace_period = millis("CDM_DOC_GRACE_PERIOD_MS", DEFAULT_DOC_GRACE_PERIOD_MS);

        Self {
            listen_addr,
            database_url,
            db_require_tls,
            cors_origins,
            log_filter,
            log_format,
            flush_debounce,
            flush_max_debounce,
            doc_grace_period,
        }
    }
}
