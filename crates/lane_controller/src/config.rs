//! Controller configuration types and defaults.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the controller core and its protocol listener.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Address the instance protocol listener binds to
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent instance connections
    pub max_connections: usize,

    /// Instances not heard from within this window are evicted
    pub heartbeat_timeout: Duration,

    /// Heartbeat interval suggested to instances on registration
    pub heartbeat_interval: Duration,

    /// How often the maintenance loop runs (sweep, expiry, flush)
    pub sweep_interval: Duration,

    /// How long a matched routing request waits for ROUTE_ACK
    pub route_confirm_timeout: Duration,

    /// Extra candidates tried after a decline before a request is rejected
    pub route_retry_limit: u32,

    /// Game type orphaned players are re-routed to, if any
    pub fallback_game_type: Option<String>,

    pub cache: CacheConfig,

    pub persistence: PersistenceConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 7400)),
            max_connections: 1000,
            heartbeat_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            route_confirm_timeout: Duration::from_secs(5),
            route_retry_limit: 1,
            fallback_game_type: Some("lobby".to_string()),
            cache: CacheConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

/// Read-through cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// When false every lookup goes straight to the registry/directory
    pub enabled: bool,
    /// Maximum entries per cache (instances and players are cached separately)
    pub max_entries: usize,
    /// Time-to-live of a cached entry
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            ttl: Duration::from_secs(2),
        }
    }
}

/// Session store and write-retry settings.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// SQLite URL (e.g. "sqlite://lane.db"); `None` keeps records in memory
    pub database_url: Option<String>,
    /// Maximum pooled connections
    pub max_connections: u32,
    /// How long to wait for a pooled connection before giving up
    pub acquire_timeout: Duration,
    /// Retries after the first failed write
    pub write_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any single retry delay
    pub max_backoff: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(3),
            write_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}
