use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub google: GoogleConfig,
    pub discord: DiscordConfig,
    pub scheduler: SchedulerConfig,
    pub rate_limit: RateLimitConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public base URL the calendar provider can reach. Push channels are
    /// created with `{webhook_url}/webhooks/calendar` as their address.
    pub webhook_url: String,
}

impl ServerConfig {
    pub fn calendar_callback_url(&self) -> String {
        format!("{}/webhooks/calendar", self.webhook_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    /// Path to the service account JSON key.
    pub service_account_file: String,
    /// Account the service account impersonates (domain-wide delegation).
    /// Leave unset to act as the service account itself.
    pub delegated_subject: Option<String>,
    pub api_base: String,
    pub token_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    pub bot_token: String,
    pub api_base: String,
    pub command_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two sweeps over the stored channels.
    pub interval_seconds: u64,
    /// A watch whose expiration is at most this far away is renewed.
    pub renewal_threshold_seconds: i64,
    /// Auto-display only fires before this local hour.
    pub auto_display_cutoff_hour: u32,
    /// Days covered by the automatically posted grid.
    pub auto_display_days: u32,
    /// How far back the webhook intake looks for updated events.
    pub webhook_lookback_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for the calendar webhook
    pub webhook_per_second: u32,
    /// Burst size for the calendar webhook
    pub webhook_burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Whole-system JSON document from the file-based store, imported once
    /// at startup when set.
    pub legacy_import_path: Option<String>,
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let scheduler = SchedulerConfig {
            interval_seconds: parse_or(
                "SCHEDULER_INTERVAL_SECONDS",
                defaults.scheduler.interval_seconds,
            )?,
            renewal_threshold_seconds: parse_or(
                "WATCH_RENEWAL_THRESHOLD_SECONDS",
                defaults.scheduler.renewal_threshold_seconds,
            )?,
            auto_display_cutoff_hour: parse_or(
                "AUTO_DISPLAY_CUTOFF_HOUR",
                defaults.scheduler.auto_display_cutoff_hour,
            )?,
            auto_display_days: parse_or(
                "AUTO_DISPLAY_DAYS",
                defaults.scheduler.auto_display_days,
            )?,
            webhook_lookback_seconds: parse_or(
                "WEBHOOK_LOOKBACK_SECONDS",
                defaults.scheduler.webhook_lookback_seconds,
            )?,
        };

        if scheduler.interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "SCHEDULER_INTERVAL_SECONDS".to_string(),
            ));
        }
        if scheduler.auto_display_cutoff_hour > 24 {
            return Err(ConfigError::InvalidValue(
                "AUTO_DISPLAY_CUTOFF_HOUR".to_string(),
            ));
        }

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or(defaults.server.host),
                port: parse_or("PORT", defaults.server.port)?,
                webhook_url: env::var("WEBHOOK_URL")
                    .map_err(|_| ConfigError::MissingEnv("WEBHOOK_URL".to_string()))?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: parse_or(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
            },
            google: GoogleConfig {
                service_account_file: env::var("GOOGLE_SERVICE_ACCOUNT_FILE").map_err(|_| {
                    ConfigError::MissingEnv("GOOGLE_SERVICE_ACCOUNT_FILE".to_string())
                })?,
                delegated_subject: env::var("GOOGLE_DELEGATED_SUBJECT")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
                api_base: env::var("GOOGLE_CALENDAR_API_BASE")
                    .unwrap_or(defaults.google.api_base),
                token_uri: env::var("GOOGLE_TOKEN_URI").unwrap_or(defaults.google.token_uri),
            },
            discord: DiscordConfig {
                bot_token: env::var("DISCORD_BOT_TOKEN")
                    .map_err(|_| ConfigError::MissingEnv("DISCORD_BOT_TOKEN".to_string()))?,
                api_base: env::var("DISCORD_API_BASE").unwrap_or(defaults.discord.api_base),
                command_prefix: env::var("COMMAND_PREFIX")
                    .unwrap_or(defaults.discord.command_prefix),
            },
            scheduler,
            rate_limit: RateLimitConfig {
                webhook_per_second: parse_or(
                    "RATE_LIMIT_WEBHOOKS_PER_SECOND",
                    defaults.rate_limit.webhook_per_second,
                )?,
                webhook_burst: parse_or(
                    "RATE_LIMIT_WEBHOOKS_BURST",
                    defaults.rate_limit.webhook_burst,
                )?,
            },
            store: StoreConfig {
                legacy_import_path: env::var("LEGACY_STORE_PATH")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                webhook_url: "http://localhost:8080".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/calendar.db".to_string(),
                max_connections: 5,
            },
            google: GoogleConfig {
                service_account_file: "service_account.json".to_string(),
                delegated_subject: None,
                api_base: "https://www.googleapis.com/calendar/v3".to_string(),
                token_uri: "https://oauth2.googleapis.com/token".to_string(),
            },
            discord: DiscordConfig {
                bot_token: String::new(),
                api_base: "https://discord.com/api/v10".to_string(),
                command_prefix: "!calendar".to_string(),
            },
            scheduler: SchedulerConfig {
                interval_seconds: 28_800,
                renewal_threshold_seconds: 8 * 3600,
                auto_display_cutoff_hour: 12,
                auto_display_days: 7,
                webhook_lookback_seconds: 120,
            },
            rate_limit: RateLimitConfig {
                webhook_per_second: 10,
                webhook_burst: 50,
            },
            store: StoreConfig {
                legacy_import_path: None,
            },
        }
    }
}
