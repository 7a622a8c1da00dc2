//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: TENANTRY_, nesting separator: `__`)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/tenantry/{service_name}/config.toml
//! 4. System directory: /etc/tenantry/{service_name}/config.toml
//! 5. Default values
//!
//! `TENANTRY_DATABASE__MAX_CONNECTIONS=20` sets `database.max_connections`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::repository::FindOrCreateStrategy;

const ENV_PREFIX: &str = "TENANTRY_";
const APP_DIR: &str = "tenantry";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Database configuration (optional)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Repository behavior
    #[serde(default)]
    pub repository: RepositoryConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name, used in log records
    pub name: String,

    /// Log level filter (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log records instead of human-readable lines
    #[serde(default = "default_true")]
    pub json_logs: bool,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing database connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout_secs: default_connection_timeout(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Repository behavior switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Re-read a row after updating it instead of trusting `RETURNING`
    #[serde(default = "default_true")]
    pub refetch_after_update: bool,

    /// Strategy used by `find_or_create`
    #[serde(default)]
    pub find_or_create: FindOrCreateStrategy,

    /// Reject unknown include relations instead of skipping them
    #[serde(default = "default_false")]
    pub strict_includes: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            refetch_after_update: default_true(),
            find_or_create: FindOrCreateStrategy::default(),
            strict_includes: default_false(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_connections() -> u32 {
    50
}

fn default_min_connections() -> u32 {
    5
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Config {
    /// Load configuration from all sources
    ///
    /// The service name is taken from the binary name.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| APP_DIR.to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Self::defaults(service_name);

        // Lowest priority first so that later files override earlier ones
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        let config = figment.merge(Self::env()).extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// Bypasses the XDG and system directories; environment variables still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::defaults(APP_DIR)
            .merge(Toml::file(path.as_ref()))
            .merge(Self::env())
            .extract()?;

        Ok(config)
    }

    fn defaults(service_name: &str) -> Figment {
        let mut defaults = Config::default();
        defaults.service.name = service_name.to_string();
        Figment::new().merge(Serialized::defaults(defaults))
    }

    fn env() -> Env {
        Env::prefixed(ENV_PREFIX).split("__")
    }

    /// All possible config file paths for a service, highest priority first
    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        let xdg_dirs = xdg::BaseDirectories::with_prefix(APP_DIR);
        let config_file_path = Path::new(service_name).join("config.toml");
        if let Some(path) = xdg_dirs.find_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(PathBuf::from("/etc").join(APP_DIR).join(service_name).join("config.toml"));

        paths
    }

    /// Get database URL
    pub fn database_url(&self) -> Option<&str> {
        self.database.as_ref().map(|db| db.url.as_str())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: APP_DIR.to_string(),
                log_level: default_log_level(),
                json_logs: default_true(),
            },
            database: None,
            repository: RepositoryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service.log_level, "info");
        assert!(config.database.is_none());
        assert!(config.repository.refetch_after_update);
        assert!(!config.repository.strict_includes);
        assert_eq!(config.repository.find_or_create, FindOrCreateStrategy::Atomic);
    }

    #[test]
    fn test_load_from_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[service]
name = "registers"
log_level = "debug"

[database]
url = "postgres://localhost/registers"
max_connections = 8

[repository]
find_or_create = "find_create_find"
strict_includes = true
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.service.name, "registers");
        assert_eq!(config.service.log_level, "debug");
        assert!(config.service.json_logs);

        let db = config.database.unwrap();
        assert_eq!(db.max_connections, 8);
        assert_eq!(db.min_connections, 5);
        assert_eq!(db.connection_timeout(), Duration::from_secs(10));

        assert_eq!(
            config.repository.find_or_create,
            FindOrCreateStrategy::FindCreateFind
        );
        assert!(config.repository.strict_includes);
        assert!(config.repository.refetch_after_update);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.service.name, "tenantry");
        assert!(config.database_url().is_none());
    }

    #[test]
    fn test_invalid_strategy_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[repository]\nfind_or_create = \"sometimes\"").unwrap();
        assert!(Config::load_from(file.path()).is_err());
    }
}
