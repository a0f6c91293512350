//! Process configuration loaded once at startup from environment variables.
//! The resulting `Config` is handed to `server::run_with_config`; nothing reads
//! the environment after that point.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub access_secret: String,
    pub access_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dial_timeout: Duration,
    /// Per-operation timeout for blacklist reads and writes.
    pub op_timeout: Duration,
}

impl RedisConfig {
    /// `REDIS_HOST=memory` selects the in-process revocation store.
    pub fn is_in_memory(&self) -> bool { self.host.eq_ignore_ascii_case("memory") }

    /// Credentials are percent-encoded so any character is safe in them.
    pub fn url(&self) -> String {
        let user = self.user.as_deref().map(urlencoding::encode);
        let password = self.password.as_deref().map(urlencoding::encode);
        let auth = match (&user, &password) {
            (Some(u), Some(p)) => format!("{}:{}@", u, p),
            (None, Some(p)) => format!(":{}@", p),
            (Some(u), None) => format!("{}@", u),
            (None, None) => String::new(),
        };
        format!("redis://{}{}:{}/0", auth, self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct PhotoConfig {
    pub root: String,
    pub bucket: String,
    pub public_base: String,
}

#[derive(Debug, Clone)]
pub struct OrbitConfig {
    pub url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub service_host: String,
    pub service_port: u16,
    pub jwt: JwtConfig,
    pub redis: RedisConfig,
    /// Postgres connection string; `None` keeps users and comets in memory.
    pub database_url: Option<String>,
    pub photos: PhotoConfig,
    pub orbit: OrbitConfig,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env_opt(key) {
        Some(v) => v.parse::<T>().map_err(|_| ConfigError::Invalid { key, value: v }),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let access_secret = env_opt("JWT_ACCESS_SECRET").ok_or(ConfigError::Missing("JWT_ACCESS_SECRET"))?;
        Ok(Self {
            service_host: env_or("SERVICE_HOST", "0.0.0.0"),
            service_port: env_parse("SERVICE_PORT", 8080u16)?,
            jwt: JwtConfig {
                access_secret,
                access_ttl: Duration::from_secs(env_parse("JWT_ACCESS_TTL_SECS", 3600u64)?),
            },
            redis: RedisConfig {
                host: env_or("REDIS_HOST", "localhost"),
                port: env_parse("REDIS_PORT", 6379u16)?,
                user: env_opt("REDIS_USER"),
                password: env_opt("REDIS_PASSWORD"),
                dial_timeout: Duration::from_millis(env_parse("REDIS_DIAL_TIMEOUT_MS", 3000u64)?),
                op_timeout: Duration::from_millis(env_parse("REDIS_OP_TIMEOUT_MS", 2000u64)?),
            },
            database_url: env_opt("DATABASE_URL"),
            photos: PhotoConfig {
                root: env_or("PHOTO_ROOT", "photos"),
                bucket: env_or("PHOTO_BUCKET", "comets"),
                public_base: env_or("PHOTO_PUBLIC_BASE", "http://localhost:9000"),
            },
            orbit: OrbitConfig {
                url: env_or("ORBIT_SERVICE_URL", "http://localhost:8000/calculate-orbit"),
                timeout: Duration::from_secs(env_parse("ORBIT_TIMEOUT_SECS", 30u64)?),
            },
        })
    }

    /// Configuration for tests and local runs: in-memory stores, given secret.
    pub fn in_memory(access_secret: &str, photo_root: &str) -> Self {
        Self {
            service_host: "127.0.0.1".to_string(),
            service_port: 0,
            jwt: JwtConfig { access_secret: access_secret.to_string(), access_ttl: Duration::from_secs(3600) },
            redis: RedisConfig {
                host: "memory".to_string(),
                port: 0,
                user: None,
                password: None,
                dial_timeout: Duration::from_secs(3),
                op_timeout: Duration::from_secs(2),
            },
            database_url: None,
            photos: PhotoConfig {
                root: photo_root.to_string(),
                bucket: "comets".to_string(),
                public_base: "http://localhost:9000".to_string(),
            },
            orbit: OrbitConfig { url: "http://localhost:8000/calculate-orbit".to_string(), timeout: Duration::from_secs(30) },
        }
    }
}
