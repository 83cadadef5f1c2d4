use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TICK_SECS: u64 = 60;
pub const DEFAULT_QUEUE_DEPTH: usize = 256;
pub const DEFAULT_PRODUCER_PATH: &str = "/wp-json/sitevault/v1/backup";
pub const DEFAULT_PRODUCER_TIMEOUT_SECS: u64 = 30;

/// Top-level config (sitevault.toml + SITEVAULT_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            auth: AuthConfig::default(),
        }
    }
}

/// Gate for mutating API calls. Requests must carry
/// `Authorization: Bearer <token>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: Some("change-me".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Scheduler loop and worker queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between due-ness scans.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Capacity of the created-job → producer dispatch channel.
    #[serde(default = "default_queue_depth")]
    pub dispatch_buffer: usize,
    /// Capacity of the completion → retention worker channel.
    #[serde(default = "default_queue_depth")]
    pub retention_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: DEFAULT_TICK_SECS,
            dispatch_buffer: DEFAULT_QUEUE_DEPTH,
            retention_buffer: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// How the gateway reaches the WordPress plugin agent on each site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Path appended to the site URL when requesting a backup.
    #[serde(default = "default_producer_path")]
    pub endpoint_path: String,
    #[serde(default = "default_producer_timeout")]
    pub timeout_secs: u64,
    /// Public base URL of this gateway; the agent posts job events to
    /// `{callback_base_url}/jobs/{id}/events`.
    pub callback_base_url: Option<String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            endpoint_path: DEFAULT_PRODUCER_PATH.to_string(),
            timeout_secs: DEFAULT_PRODUCER_TIMEOUT_SECS,
            callback_base_url: None,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}
fn default_producer_path() -> String {
    DEFAULT_PRODUCER_PATH.to_string()
}
fn default_producer_timeout() -> u64 {
    DEFAULT_PRODUCER_TIMEOUT_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.sitevault/sitevault.db", home)
}

impl VaultConfig {
    /// Load config from a TOML file with SITEVAULT_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `SITEVAULT_SCHEDULER__TICK_SECS=30`. A missing file is not an error;
    /// every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: VaultConfig = Figment::from(Serialized::defaults(VaultConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SITEVAULT_").split("__"))
            .extract()
            .map_err(|e| crate::error::VaultError::Config(e.to_string()))?;

        if config.scheduler.tick_secs == 0 {
            return Err(crate::error::VaultError::Config(
                "scheduler.tick_secs must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.sitevault/sitevault.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.toml");
        let config = VaultConfig::load(path.to_str()).expect("load");
        assert_eq!(config.gateway.port, DEFAULT_PORT);
        assert_eq!(config.scheduler.tick_secs, DEFAULT_TICK_SECS);
        assert_eq!(config.producer.endpoint_path, DEFAULT_PRODUCER_PATH);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sitevault.toml");
        fs::write(
            &path,
            "[gateway]\nport = 9000\n\n[scheduler]\ntick_secs = 5\n\n[database]\npath = \"/tmp/v.db\"\n",
        )
        .expect("write");

        let config = VaultConfig::load(path.to_str()).expect("load");
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.bind, DEFAULT_BIND);
        assert_eq!(config.scheduler.tick_secs, 5);
        assert_eq!(config.scheduler.dispatch_buffer, DEFAULT_QUEUE_DEPTH);
        assert_eq!(config.database.path, "/tmp/v.db");
    }

    #[test]
    fn zero_tick_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sitevault.toml");
        fs::write(&path, "[scheduler]\ntick_secs = 0\n").expect("write");
        assert!(VaultConfig::load(path.to_str()).is_err());
    }
}
