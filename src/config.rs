//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use crate::storage::postgres::MAX_INSERT_BATCH;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum ConfigError {
    #[error("Failed to load environment variables: {0}")]
    EnvLoad(#[from] dotenvy::Error),

    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0),
            port: 3000,
        }
    }
}

/// Which relational store backs the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_pool_size: usize,
    pub require_tls: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "governance".to_string(),
            max_pool_size: 10,
            require_tls: false,
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Audit buffer configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub flush_interval: Duration,
    /// Bounded channel capacity; producers wait when it is full
    pub buffer_capacity: usize,
    /// Largest batch written in one round trip
    pub max_batch: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(5000),
            buffer_capacity: 10_000,
            max_batch: 500,
        }
    }
}

/// Read-cache TTLs for policies and filter rules
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub policy_ttl: Duration,
    pub filter_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            policy_ttl: Duration::from_secs(300),
            filter_ttl: Duration::from_secs(300),
        }
    }
}

/// External moderation API configuration
#[derive(Debug, Clone)]
pub struct ModerationConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            timeout: Duration::from_millis(2000),
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub storage: StorageBackend,
    pub database: DatabaseConfig,
    pub cors: CorsConfig,
    pub audit: AuditConfig,
    pub cache: CacheConfig,
    pub moderation: ModerationConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageBackend::Memory,
            database: DatabaseConfig::default(),
            cors: CorsConfig::default(),
            audit: AuditConfig::default(),
            cache: CacheConfig::default(),
            moderation: ModerationConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            host: env_parse("HOST").unwrap_or_else(|| ServerConfig::default().host),
            port: env_parse("PORT").unwrap_or_else(|| ServerConfig::default().port),
        };

        let database_url = std::env::var("DATABASE_URL").ok();

        let storage = match std::env::var("STORAGE_BACKEND").ok().as_deref() {
            Some("memory") => StorageBackend::Memory,
            Some("postgres") => StorageBackend::Postgres,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "STORAGE_BACKEND must be 'postgres' or 'memory', got '{}'",
                    other
                )))
            }
            None if database_url.is_some() => StorageBackend::Postgres,
            None => StorageBackend::Memory,
        };

        // Try DATABASE_URL first, fall back to individual vars
        let database = if let Some(url) = database_url {
            Self::parse_database_url(&url)?
        } else {
            let defaults = DatabaseConfig::default();
            DatabaseConfig {
                host: std::env::var("DB_HOST").unwrap_or(defaults.host),
                port: env_parse("DB_PORT").unwrap_or(defaults.port),
                user: std::env::var("DB_USER").unwrap_or(defaults.user),
                password: std::env::var("DB_PASSWORD").unwrap_or_default(),
                database: std::env::var("DB_NAME").unwrap_or(defaults.database),
                max_pool_size: env_parse("DB_MAX_CONNECTIONS").unwrap_or(defaults.max_pool_size),
                require_tls: false,
            }
        };

        let cors = CorsConfig {
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        let audit_defaults = AuditConfig::default();
        let audit = AuditConfig {
            flush_interval: env_parse("AUDIT_FLUSH_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(audit_defaults.flush_interval),
            buffer_capacity: env_parse::<usize>("AUDIT_BUFFER_CAPACITY")
                .filter(|c| *c > 0)
                .unwrap_or(audit_defaults.buffer_capacity),
            max_batch: audit_max_batch(env_parse("AUDIT_MAX_BATCH"), audit_defaults.max_batch),
        };

        let cache_defaults = CacheConfig::default();
        let cache = CacheConfig {
            policy_ttl: env_parse("POLICY_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(cache_defaults.policy_ttl),
            filter_ttl: env_parse("FILTER_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(cache_defaults.filter_ttl),
        };

        let moderation = ModerationConfig {
            api_url: std::env::var("MODERATION_API_URL").ok().filter(|s| !s.is_empty()),
            api_key: std::env::var("MODERATION_API_KEY").ok().filter(|s| !s.is_empty()),
            timeout: env_parse("MODERATION_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or_else(|| ModerationConfig::default().timeout),
        };

        Ok(Self {
            server,
            storage,
            database,
            cors,
            audit,
            cache,
            moderation,
        })
    }

    /// Parse a DATABASE_URL connection string (postgresql://...)
    fn parse_database_url(url: &str) -> Result<DatabaseConfig, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue(
                "Invalid DATABASE_URL format (expected postgresql://...)".to_string(),
            )
        })?;

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidValue("Missing host in DATABASE_URL".to_string()))?
            .to_string();

        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(ConfigError::InvalidValue(
                "Missing database name in DATABASE_URL".to_string(),
            ));
        }

        let require_tls = parsed
            .query_pairs()
            .any(|(k, v)| k == "sslmode" && v == "require");

        Ok(DatabaseConfig {
            host,
            port: parsed.port().unwrap_or(5432),
            user: parsed.username().to_string(),
            password: parsed.password().map(|p| p.to_string()).unwrap_or_default(),
            database,
            max_pool_size: env_parse("DB_MAX_CONNECTIONS").unwrap_or(10),
            require_tls,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Zero falls back to the default; anything above one INSERT's capacity is clamped
fn audit_max_batch(requested: Option<usize>, default: usize) -> usize {
    match requested.filter(|n| *n > 0) {
        Some(n) if n > MAX_INSERT_BATCH => {
            warn!(
                "AUDIT_MAX_BATCH {} exceeds {}, clamping",
                n, MAX_INSERT_BATCH
            );
            MAX_INSERT_BATCH
        }
        Some(n) => n,
        None => default,
    }
}
