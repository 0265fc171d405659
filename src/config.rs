use std::env;

use serde::Deserialize;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://www.zenduty.com";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub zenduty: ZendutyConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// `max-age` (seconds) sent with every calendar response.
    pub cache_max_age_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZendutyConfig {
    pub base_url: String,
    /// Login email. Also the user served by `/myschedule`.
    pub username: String,
    pub password: String,
    pub request_timeout_seconds: u64,
    /// How many months the remote service expands recurring shifts for.
    pub schedule_months: u32,
    /// Maximum upstream requests in flight while building a combined schedule.
    pub fetch_concurrency: usize,
    /// Log in before serving and refuse to start if that fails.
    pub login_on_startup: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for calendar endpoints
    pub calendar_per_second: u32,
    /// Burst size for calendar endpoints
    pub calendar_burst: u32,
}

impl Config {
    /// Read settings from the process environment (`.env` is loaded by `main`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url =
            env::var("ZENDUTY_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Url::parse(&base_url)
            .map_err(|_| ConfigError::InvalidValue("ZENDUTY_BASE_URL".to_string()))?;

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("PORT", 3000)?,
                cache_max_age_seconds: parse_var("CACHE_MAX_AGE_SECONDS", 300)?,
            },
            zenduty: ZendutyConfig {
                base_url,
                username: env::var("ZENDUTY_USERNAME")
                    .map_err(|_| ConfigError::MissingEnv("ZENDUTY_USERNAME".to_string()))?,
                password: env::var("ZENDUTY_PASSWORD")
                    .map_err(|_| ConfigError::MissingEnv("ZENDUTY_PASSWORD".to_string()))?,
                request_timeout_seconds: parse_var("ZENDUTY_REQUEST_TIMEOUT_SECONDS", 5)?,
                schedule_months: parse_var("ZENDUTY_SCHEDULE_MONTHS", 12)?,
                fetch_concurrency: parse_var::<usize>("ZENDUTY_FETCH_CONCURRENCY", 4)?.max(1),
                login_on_startup: match env::var("ZENDUTY_LOGIN_ON_STARTUP") {
                    Ok(v) => match v.to_lowercase().as_str() {
                        "1" | "true" | "yes" => true,
                        "0" | "false" | "no" => false,
                        _ => true,
                    },
                    Err(_) => true,
                },
            },
            rate_limit: RateLimitConfig {
                calendar_per_second: parse_var("RATE_LIMIT_CALENDAR_PER_SECOND", 2)?,
                calendar_burst: parse_var("RATE_LIMIT_CALENDAR_BURST", 10)?,
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
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
                port: 3000,
                cache_max_age_seconds: 300,
            },
            zenduty: ZendutyConfig {
                base_url: DEFAULT_BASE_URL.to_string(),
                username: String::new(),
                password: String::new(),
                request_timeout_seconds: 5,
                schedule_months: 12,
                fetch_concurrency: 4,
                login_on_startup: true,
            },
            rate_limit: RateLimitConfig {
                calendar_per_second: 2,
                calendar_burst: 10,
            },
        }
    }
}
