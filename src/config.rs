//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (SUNBLOCK__SECTION__KEY)
//! 4. Legacy variables (ATPROTO_USER, ATPROTO_PASS, FOLLOW_LIMIT, SUBSCRIPTIONS)

use serde::{Deserialize, Deserializer};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub atproto: AtprotoConfig,
    pub blocking: BlockingConfig,
    pub database: DatabaseConfig,
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Bluesky account and service settings
#[derive(Debug, Clone, Deserialize)]
pub struct AtprotoConfig {
    /// PDS / entryway base URL (e.g., "https://bsky.social")
    pub service_url: String,
    /// Owner handle or email used to log in
    #[serde(default)]
    pub username: String,
    /// App password
    #[serde(default)]
    pub password: String,
    /// Per-request timeout in seconds
    pub request_timeout_seconds: u64,
    pub rate_limit: RateLimitConfig,
}

/// Client-side request pacing
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub max_requests: u32,
    /// Window length in seconds
    pub window_seconds: u64,
}

/// Block-list policy
#[derive(Debug, Clone, Deserialize)]
pub struct BlockingConfig {
    /// Followers following more than this many accounts are blocked
    pub follow_limit: i64,
    /// Handles whose block lists are mirrored
    #[serde(default, deserialize_with = "deserialize_handle_list")]
    pub subscriptions: Vec<String>,
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Run scheduling
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Keep running and reconcile every `interval_seconds` (default: one-shot)
    pub enabled: bool,
    /// Interval between runs in seconds (default: 3600)
    pub interval_seconds: u64,
}

/// Metrics export
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetricsConfig {
    /// Prometheus textfile written after each run
    pub textfile_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

/// Plain variable names used by older deployments.
#[derive(Debug, Clone, Default)]
pub struct LegacyEnv {
    pub user: Option<String>,
    pub pass: Option<String>,
    pub follow_limit: Option<String>,
    pub subscriptions: Option<String>,
}

impl LegacyEnv {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            user: var("ATPROTO_USER"),
            pass: var("ATPROTO_PASS"),
            follow_limit: var("FOLLOW_LIMIT"),
            subscriptions: var("SUBSCRIPTIONS"),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HandleList {
    Joined(String),
    List(Vec<String>),
}

fn deserialize_handle_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = match HandleList::deserialize(deserializer)? {
        HandleList::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        HandleList::List(list) => list,
    };
    Ok(normalize_handles(raw))
}

/// Trim, drop empty entries and de-duplicate while keeping order.
fn normalize_handles(raw: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.into_iter()
        .map(|handle| handle.trim().trim_start_matches('@').to_ascii_lowercase())
        .filter(|handle| !handle.is_empty())
        .filter(|handle| seen.insert(handle.clone()))
        .collect()
}

impl AppConfig {
    /// Load configuration from files and the process environment
    ///
    /// # Errors
    /// Returns error if configuration is invalid or credentials are missing
    pub fn load() -> Result<Self, crate::error::AppError> {
        Self::load_with(LegacyEnv::from_env())
    }

    /// Load configuration with explicit legacy overrides
    pub fn load_with(legacy: LegacyEnv) -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("atproto.service_url", "https://bsky.social")?
            .set_default("atproto.request_timeout_seconds", 30)?
            .set_default("atproto.rate_limit.max_requests", 3000)?
            .set_default("atproto.rate_limit.window_seconds", 300)?
            .set_default("blocking.follow_limit", 4000)?
            .set_default("database.path", "./db.sqlite")?
            .set_default("schedule.enabled", false)?
            .set_default("schedule.interval_seconds", 3600)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (SUNBLOCK__*)
            .add_source(
                Environment::with_prefix("SUNBLOCK")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("atproto.username", legacy.user)?
            .set_override_option("atproto.password", legacy.pass)?
            .set_override_option("blocking.follow_limit", legacy.follow_limit)?
            .set_override_option("blocking.subscriptions", legacy.subscriptions)?
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.atproto.username.trim().is_empty() || self.atproto.password.is_empty() {
            return Err(crate::error::AppError::Config(
                "atproto.username and atproto.password (ATPROTO_USER / ATPROTO_PASS) must be set"
                    .to_string(),
            ));
        }

        let service = url::Url::parse(&self.atproto.service_url).map_err(|e| {
            crate::error::AppError::Config(format!("atproto.service_url is not a valid URL: {e}"))
        })?;
        if service.scheme() != "https" && service.scheme() != "http" {
            return Err(crate::error::AppError::Config(format!(
                "atproto.service_url must use http or https, got {}",
                service.scheme()
            )));
        }

        if self.blocking.follow_limit < 0 {
            return Err(crate::error::AppError::Config(
                "blocking.follow_limit must not be negative".to_string(),
            ));
        }

        if self.schedule.interval_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "schedule.interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.atproto.rate_limit.max_requests == 0 || self.atproto.rate_limit.window_seconds == 0
        {
            return Err(crate::error::AppError::Config(
                "atproto.rate_limit values must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
