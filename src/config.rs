//! Cache and authentication configuration

use std::{str::FromStr, time::Duration};

use tracing::warn;

/// Configuration for the dual-tier cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Redis connection URL (`redis://[:password@]host:port/db`)
    pub redis_url: String,
    /// Upper bound for establishing a connection, handshake included
    pub connect_timeout: Duration,
    /// Upper bound for a single command round trip
    pub command_timeout: Duration,
    /// First reconnect delay; doubled on every failed attempt
    pub reconnect_base_delay: Duration,
    /// Ceiling for the reconnect delay
    pub reconnect_max_delay: Duration,
    /// TTL used by [`crate::CacheService::set_default`]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_owned(),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(5),
            default_ttl: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl CacheConfig {
    /// Build a configuration from `REDIS_*` environment variables.
    ///
    /// `REDIS_URL` wins over the individual host/port/password/db variables.
    /// Timeouts are read in milliseconds.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let redis_url = env_string("REDIS_URL").unwrap_or_else(|| {
            let host = env_string("REDIS_HOST").unwrap_or_else(|| "127.0.0.1".to_owned());
            let port: u16 = env_parse("REDIS_PORT", 6379);
            let db: u32 = env_parse("REDIS_DB", 0);
            match env_string("REDIS_PASSWORD") {
                Some(password) => format!("redis://:{}@{}:{}/{}", password, host, port, db),
                None => format!("redis://{}:{}/{}", host, port, db),
            }
        });

        Self {
            redis_url,
            connect_timeout: Duration::from_millis(env_parse(
                "REDIS_CONNECT_TIMEOUT",
                millis(defaults.connect_timeout),
            )),
            command_timeout: Duration::from_millis(env_parse(
                "REDIS_COMMAND_TIMEOUT",
                millis(defaults.command_timeout),
            )),
            ..defaults
        }
    }
}

/// Configuration for token issuing and verification
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HMAC secret for access tokens
    pub access_secret: String,
    /// HMAC secret for refresh tokens; must differ from the access secret
    pub refresh_secret: String,
    /// Lifetime of access tokens; also the TTL of their session record
    pub access_ttl: Duration,
    /// Lifetime of refresh tokens; also the TTL of their session record
    pub refresh_ttl: Duration,
    /// Clock skew tolerated when checking `exp`
    pub leeway: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_secret: "change-me-access".to_owned(),
            refresh_secret: "change-me-refresh".to_owned(),
            access_ttl: Duration::from_secs(3600),            // 1 hour
            refresh_ttl: Duration::from_secs(7 * 24 * 3600), // 7 days
            leeway: Duration::ZERO,
        }
    }
}

impl AuthConfig {
    /// Build a configuration from `JWT_*` / `REFRESH_TOKEN_*` environment variables.
    ///
    /// Lifetimes are read in seconds.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            access_secret: env_string("JWT_SECRET").unwrap_or(defaults.access_secret),
            refresh_secret: env_string("REFRESH_TOKEN_SECRET").unwrap_or(defaults.refresh_secret),
            access_ttl: Duration::from_secs(env_parse(
                "JWT_EXPIRES_IN",
                defaults.access_ttl.as_secs(),
            )),
            refresh_ttl: Duration::from_secs(env_parse(
                "REFRESH_TOKEN_EXPIRES_IN",
                defaults.refresh_ttl.as_secs(),
            )),
            leeway: defaults.leeway,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr + Copy + std::fmt::Display>(name: &str, default: T) -> T {
    match env_string(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(
                "Invalid value {:?} for {}; using default {}",
                raw, name, default
            );
            default
        }),
        None => default,
    }
}
