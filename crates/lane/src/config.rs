//! TOML configuration for the lane binary.
//!
//! The file mirrors [`ControllerConfig`] with plain millisecond integers so it
//! stays hand-editable; [`AppConfig::to_controller_config`] does the conversion.

use anyhow::Context;
use lane_controller::{
    CacheConfig, ControllerConfig, LeastLoaded, MostLoaded, PersistenceConfig, SelectionPolicy,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_POLICIES: [&str; 2] = ["least_loaded", "most_loaded"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub persistence: PersistenceSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Address instances connect to (e.g. "0.0.0.0:7400")
    pub bind_address: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_route_confirm_timeout_ms")]
    pub route_confirm_timeout_ms: u64,
    #[serde(default = "default_route_retry_limit")]
    pub route_retry_limit: u32,
    /// Where orphaned players go; unset leaves them orphaned
    #[serde(default)]
    pub fallback_game_type: Option<String>,
    /// "least_loaded" or "most_loaded"
    #[serde(default = "default_selection_policy")]
    pub selection_policy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceSettings {
    /// SQLite URL; records stay in memory when unset
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    #[serde(default)]
    pub json_format: bool,
}

fn default_max_connections() -> usize {
    1000
}

fn default_heartbeat_timeout_ms() -> u64 {
    15_000
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_route_confirm_timeout_ms() -> u64 {
    5_000
}

fn default_route_retry_limit() -> u32 {
    1
}

fn default_selection_policy() -> String {
    "least_loaded".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cache_entries() -> usize {
    10_000
}

fn default_cache_ttl_ms() -> u64 {
    2_000
}

fn default_pool_size() -> u32 {
    5
}

fn default_acquire_timeout_ms() -> u64 {
    3_000
}

fn default_write_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7400".to_string(),
            max_connections: default_max_connections(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            route_confirm_timeout_ms: default_route_confirm_timeout_ms(),
            route_retry_limit: default_route_retry_limit(),
            fallback_game_type: Some("lobby".to_string()),
            selection_policy: default_selection_policy(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_entries(),
            ttl_ms: default_cache_ttl_ms(),
        }
    }
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: default_pool_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            write_retries: default_write_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file, writing the defaults to `path`
    /// first if it does not exist.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let controller = &self.controller;
        if controller.bind_address.parse::<SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", controller.bind_address));
        }

        let positive = [
            ("controller.heartbeat_timeout_ms", controller.heartbeat_timeout_ms),
            ("controller.heartbeat_interval_ms", controller.heartbeat_interval_ms),
            ("controller.sweep_interval_ms", controller.sweep_interval_ms),
            ("controller.route_confirm_timeout_ms", controller.route_confirm_timeout_ms),
            ("controller.max_connections", controller.max_connections as u64),
            ("cache.max_entries", self.cache.max_entries as u64),
            ("cache.ttl_ms", self.cache.ttl_ms),
            ("persistence.max_connections", u64::from(self.persistence.max_connections)),
            ("persistence.acquire_timeout_ms", self.persistence.acquire_timeout_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(format!("{name} must be greater than zero"));
        }

        if controller.heartbeat_interval_ms >= controller.heartbeat_timeout_ms {
            return Err(format!(
                "Heartbeat interval ({}ms) must be shorter than the heartbeat timeout ({}ms)",
                controller.heartbeat_interval_ms, controller.heartbeat_timeout_ms
            ));
        }

        if matches!(&controller.fallback_game_type, Some(game_type) if game_type.trim().is_empty()) {
            return Err("Fallback game type cannot be empty".to_string());
        }

        if !VALID_POLICIES.contains(&controller.selection_policy.as_str()) {
            return Err(format!(
                "Invalid selection policy: {}. Must be one of: {VALID_POLICIES:?}",
                controller.selection_policy
            ));
        }

        if matches!(&self.persistence.database_url, Some(url) if url.trim().is_empty()) {
            return Err("Database URL cannot be empty".to_string());
        }

        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {VALID_LEVELS:?}",
                self.logging.level
            ));
        }

        Ok(())
    }

    pub fn to_controller_config(&self) -> anyhow::Result<ControllerConfig> {
        let controller = &self.controller;
        let persistence = &self.persistence;
        let backoff = Duration::from_millis(persistence.retry_backoff_ms);

        Ok(ControllerConfig {
            bind_address: controller
                .bind_address
                .parse()
                .with_context(|| format!("invalid bind address {}", controller.bind_address))?,
            max_connections: controller.max_connections,
            heartbeat_timeout: Duration::from_millis(controller.heartbeat_timeout_ms),
            heartbeat_interval: Duration::from_millis(controller.heartbeat_interval_ms),
            sweep_interval: Duration::from_millis(controller.sweep_interval_ms),
            route_confirm_timeout: Duration::from_millis(controller.route_confirm_timeout_ms),
            route_retry_limit: controller.route_retry_limit,
            fallback_game_type: controller.fallback_game_type.clone(),
            cache: CacheConfig {
                enabled: self.cache.enabled,
                max_entries: self.cache.max_entries,
                ttl: Duration::from_millis(self.cache.ttl_ms),
            },
            persistence: PersistenceConfig {
                database_url: persistence.database_url.clone(),
                max_connections: persistence.max_connections,
                acquire_timeout: Duration::from_millis(persistence.acquire_timeout_ms),
                write_retries: persistence.write_retries,
                initial_backoff: backoff,
                max_backoff: PersistenceConfig::default().max_backoff.max(backoff),
            },
        })
    }

    pub fn selection_policy(&self) -> Arc<dyn SelectionPolicy> {
        match self.controller.selection_policy.as_str() {
            "most_loaded" => Arc::new(MostLoaded),
            _ => Arc::new(LeastLoaded),
        }
    }
}
