//! Configuration loaded from environment variables.
//!
//! `main` calls `dotenvy::dotenv()` first, so a local `.env` file works too.

use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    pub postgres: PostgresConfig,
    pub redis: RedisConfig,
    pub rabbitmq: RabbitConfig,
    pub booking: BookingConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    /// Upper bound of the r2d2 pool.
    pub max_connections: u32,
    /// How long a request waits for a pooled connection.
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct RabbitConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub queue: String,
}

#[derive(Debug, Clone)]
pub struct BookingConfig {
    /// Minimum distance between now and a requested slot.
    pub min_lead_time: chrono::Duration,
    /// Deadline applied to a whole saga.
    pub request_timeout: Duration,
    /// Publish attempts before a notification is reported as failed.
    pub notify_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub admin_ids: HashSet<i64>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            http: HttpConfig {
                host: string("HTTP_HOST", "127.0.0.1"),
                port: parse(&lookup, "HTTP_PORT", 8080)?,
            },
            postgres: PostgresConfig {
                url: lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
                max_connections: parse(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
                connect_timeout: Duration::from_secs(parse(&lookup, "DATABASE_CONNECT_TIMEOUT", 5)?),
            },
            redis: RedisConfig {
                url: string("REDIS_URL", "redis://127.0.0.1:6379"),
            },
            rabbitmq: RabbitConfig::from_lookup(&lookup)?,
            booking: BookingConfig {
                min_lead_time: chrono::Duration::minutes(parse(&lookup, "BOOKING_MIN_LEAD_MINUTES", 300)?),
                request_timeout: Duration::from_millis(parse(&lookup, "BOOKING_REQUEST_TIMEOUT_MS", 4000)?),
                notify_attempts: parse::<u32, _>(&lookup, "BOOKING_NOTIFY_ATTEMPTS", 2)?.max(1),
            },
            auth: AuthConfig {
                jwt_secret: lookup("APP_SECRET").ok_or(ConfigError::Missing("APP_SECRET"))?,
                admin_ids: parse_ids(&lookup, "ADMIN_USER_IDS")?,
            },
        })
    }
}

impl RabbitConfig {
    /// Broker settings alone, for processes that only consume.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            host: string("RABBITMQ_HOST", "localhost"),
            port: parse(lookup, "RABBITMQ_PORT", 5672)?,
            username: string("RABBITMQ_USER", "guest"),
            password: string("RABBITMQ_PASSWORD", "guest"),
            queue: string("RABBITMQ_QUEUE", "notifications_queue"),
        })
    }
}

fn parse<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

fn parse_ids<F>(lookup: &F, key: &'static str) -> Result<HashSet<i64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(HashSet::new());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError::Invalid { key, value: raw.clone() })
        })
        .collect()
}
