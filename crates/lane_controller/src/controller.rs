//! The `Controller` facade: wires the stores together and exposes the
//! operations platform adapters and the protocol server call.

use crate::adapter::PlatformAdapter;
use crate::cache::LookupCache;
use crate::config::ControllerConfig;
use crate::directory::{PlayerSession, SessionDirectory};
use crate::error::{ControllerError, Result};
use crate::links::{DirectiveRouter, InstanceLinks};
use crate::persistence::{
    MemorySessionStore, RetryPolicy, SessionRecord, SessionStore, SessionWriter, SqliteSessionStore,
};
use crate::registry::{InstanceFilter, InstanceRegistry, InstanceSnapshot, SweepReport};
use crate::routing::{
    LeastLoaded, RouteConstraints, RouteHandle, RouteReason, RoutingEngine, SelectionPolicy,
};
use lane_protocol::{InstanceDescriptor, InstanceId, PlayerId, RequestId};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What one maintenance pass did.
#[derive(Debug, Default, Clone)]
pub struct MaintenanceReport {
    pub sweep: SweepReport,
    pub expired_requests: Vec<RequestId>,
    /// Orphaned players for whom a new routing request was submitted
    pub rerouted: usize,
    /// Buffered session records written this pass
    pub flushed: usize,
}

/// Central coordination point of the controller.
///
/// Owns the [`InstanceRegistry`], [`SessionDirectory`], [`RoutingEngine`],
/// [`LookupCache`] and [`SessionWriter`] and wires them together: the cache,
/// directory, engine and directive router observe the registry, so an
/// evicted instance invalidates cached reads, orphans its players and
/// resolves the routing requests matched to it.
///
/// Platform adapters drive it through the `on_*` hooks; the
/// [`ControllerServer`](crate::ControllerServer) drives it for instances
/// speaking the protocol. Periodic housekeeping runs through
/// [`spawn_maintenance`](Self::spawn_maintenance).
///
/// # Examples
///
/// ```rust
/// use lane_controller::{
///     Controller, ControllerConfig, InstanceDescriptor, LoggingAdapter, PlayerId, RouteConstraints,
///     RouteState,
/// };
/// use lane_controller::persistence::MemorySessionStore;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> lane_controller::Result<()> {
/// let controller = Controller::new(
///     ControllerConfig::default(),
///     Arc::new(MemorySessionStore::new()),
///     Arc::new(LoggingAdapter),
/// );
/// let arena = controller.on_instance_ready(InstanceDescriptor::new("arena", "10.0.0.1:25565", 8))?;
///
/// let player = PlayerId::new();
/// controller.on_player_connect(player);
/// let handle = controller.route_player(player, RouteConstraints::game_type("arena"))?;
/// assert!(matches!(handle.state(), RouteState::Matched { .. }));
///
/// controller.confirm_route(&arena, handle.id()).await?;
/// assert_eq!(handle.outcome().await, RouteState::Confirmed { instance: arena.clone() });
/// # Ok(())
/// # }
/// ```
pub struct Controller {
    config: ControllerConfig,
    registry: Arc<InstanceRegistry>,
    directory: Arc<SessionDirectory>,
    engine: Arc<RoutingEngine>,
    cache: Arc<LookupCache>,
    writer: Arc<SessionWriter>,
    links: Arc<InstanceLinks>,
    router: Arc<DirectiveRouter>,
}

impl Controller {
    pub fn new(config: ControllerConfig, store: Arc<dyn SessionStore>, adapter: Arc<dyn PlatformAdapter>) -> Self {
        Self::with_policy(config, store, adapter, Arc::new(LeastLoaded))
    }

    pub fn with_policy(
        config: ControllerConfig,
        store: Arc<dyn SessionStore>,
        adapter: Arc<dyn PlatformAdapter>,
        policy: Arc<dyn SelectionPolicy>,
    ) -> Self {
        let registry = Arc::new(InstanceRegistry::new(config.heartbeat_timeout));
        let cache = Arc::new(LookupCache::new(&config.cache));
        let writer = Arc::new(SessionWriter::new(
            store,
            RetryPolicy::from_config(&config.persistence),
        ));
        let directory = Arc::new(SessionDirectory::new(
            registry.clone(),
            writer.clone(),
            cache.clone(),
        ));
        let links = Arc::new(InstanceLinks::new());
        let router = Arc::new(DirectiveRouter::new(links.clone(), adapter.clone()));
        let engine = Arc::new(
            RoutingEngine::new(
                registry.clone(),
                directory.clone(),
                router.clone(),
                adapter,
                &config,
            )
            .with_policy(policy),
        );

        registry.subscribe(&cache);
        registry.subscribe(&directory);
        registry.subscribe(&engine);
        registry.subscribe(&router);

        info!(
            "🧭 Controller ready (policy: {}, heartbeat timeout: {:?}, cache: {})",
            engine.policy_name(),
            config.heartbeat_timeout,
            if config.cache.enabled { "on" } else { "off" }
        );

        Self {
            config,
            registry,
            directory,
            engine,
            cache,
            writer,
            links,
            router,
        }
    }

    /// Opens the configured session store (SQLite, or in memory when no
    /// database URL is set) and builds the controller on top of it.
    pub async fn connect(config: ControllerConfig, adapter: Arc<dyn PlatformAdapter>) -> Result<Self> {
        Self::connect_with_policy(config, adapter, Arc::new(LeastLoaded)).await
    }

    pub async fn connect_with_policy(
        config: ControllerConfig,
        adapter: Arc<dyn PlatformAdapter>,
        policy: Arc<dyn SelectionPolicy>,
    ) -> Result<Self> {
        let store: Arc<dyn SessionStore> = match &config.persistence.database_url {
            Some(url) => Arc::new(SqliteSessionStore::connect(url, &config.persistence).await?),
            None => {
                info!("🗄️ No database configured, keeping session records in memory");
                Arc::new(MemorySessionStore::new())
            }
        };
        Ok(Self::with_policy(config, store, adapter, policy))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    pub fn engine(&self) -> &Arc<RoutingEngine> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<LookupCache> {
        &self.cache
    }

    pub fn writer(&self) -> &Arc<SessionWriter> {
        &self.writer
    }

    pub fn links(&self) -> &Arc<InstanceLinks> {
        &self.links
    }

    /// Adapter hook: an instance is up and may receive players right away.
    ///
    /// Unless the instance later opens a protocol connection of its own,
    /// routing directives for it go through
    /// [`PlatformAdapter::deliver_directive`] and its answers come back via
    /// [`confirm_route`](Self::confirm_route) and
    /// [`decline_route`](Self::decline_route).
    ///
    /// # Errors
    ///
    /// Fails with [`ControllerError::Validation`] for a malformed descriptor
    /// and [`ControllerError::DuplicateRegistration`] when the id is held by
    /// a live instance.
    pub fn on_instance_ready(&self, descriptor: InstanceDescriptor) -> Result<InstanceId> {
        let id = self.registry.register(descriptor)?;
        self.router.manage(id.clone());
        self.registry.activate(&id)?;
        Ok(id)
    }

    /// Adapter hook: `instance` accepted the routed players of `request`.
    ///
    /// Same effect as a `ROUTE_ACK` arriving over the protocol.
    pub async fn confirm_route(&self, instance: &InstanceId, request: RequestId) -> Result<()> {
        self.engine.acknowledge(instance, request).await
    }

    /// Adapter hook: `instance` refused `request`; the engine retries
    /// elsewhere while attempts remain.
    pub fn decline_route(&self, instance: &InstanceId, request: RequestId, reason: &str) -> Result<()> {
        self.engine.decline(instance, request, reason)
    }

    /// Registration arriving over the protocol; the instance becomes
    /// routable with its first heartbeat.
    pub fn register_instance(&self, descriptor: InstanceDescriptor, seq: u64) -> Result<InstanceId> {
        self.registry.register_at(descriptor, seq, Instant::now())
    }

    pub fn deregister_instance(&self, id: &InstanceId) -> Result<InstanceSnapshot> {
        self.registry.deregister(id)
    }

    /// Adapter hook: a player joined the network.
    pub fn on_player_connect(&self, player: PlayerId) -> PlayerSession {
        self.directory.begin_session(player)
    }

    /// Starts a session and routes the player to the fallback game type.
    pub fn join_network(&self, player: PlayerId) -> Result<RouteHandle> {
        let fallback = self.config.fallback_game_type.clone().ok_or_else(|| {
            ControllerError::Validation("no fallback game type configured".into())
        })?;
        self.directory.begin_session(player);
        self.engine
            .submit(player, RouteConstraints::game_type(fallback), RouteReason::NetworkJoin)
    }

    /// Adapter hook: a player left the network.
    ///
    /// Any routing request of theirs is cancelled before the session is
    /// closed and recorded.
    pub async fn on_player_disconnect(&self, player: PlayerId) -> Result<SessionRecord> {
        match self.engine.cancel_for_player(&player) {
            Ok(_) | Err(ControllerError::NotFound { .. }) => {}
            Err(e) => warn!("Cancelling routing for {} failed: {}", player, e),
        }
        self.directory.end_session(&player).await
    }

    /// Submits a routing request for a connected player.
    ///
    /// # Arguments
    ///
    /// * `player` - A player with an open session
    /// * `constraints` - Where the player may go, as ordered fallback stages
    ///
    /// # Returns
    ///
    /// A [`RouteHandle`] that resolves to exactly one terminal state. A
    /// request with no eligible instance is already `Rejected` when this
    /// returns.
    ///
    /// # Errors
    ///
    /// Fails with [`ControllerError::NotFound`] when the player has no
    /// session and [`ControllerError::Validation`] for empty constraints or a
    /// player that already has a request in flight.
    pub fn route_player(&self, player: PlayerId, constraints: RouteConstraints) -> Result<RouteHandle> {
        self.engine.submit(player, constraints, RouteReason::Requested)
    }

    /// Cached read of a player's session.
    pub async fn locate_player(&self, player: PlayerId) -> Result<PlayerSession> {
        let directory = &self.directory;
        self.cache
            .players
            .get_or_fetch(&player, || async move { directory.lookup(&player) })
            .await
    }

    /// Cached read of an instance record.
    pub async fn instance_info(&self, id: &InstanceId) -> Result<InstanceSnapshot> {
        let registry = &self.registry;
        self.cache
            .instances
            .get_or_fetch(id, || async move { registry.snapshot(id) })
            .await
    }

    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.run_maintenance_at(Instant::now()).await
    }

    /// Sweeps the registry, expires unconfirmed routes, re-routes orphaned
    /// players, flushes buffered session records and snapshots instances.
    pub async fn run_maintenance_at(&self, now: Instant) -> MaintenanceReport {
        let sweep = self.registry.sweep_at(now);
        let expired_requests = self.engine.expire_at(now);
        let rerouted = self.reroute_orphans();
        let flushed = self.writer.flush_pending().await;

        let instances = self.registry.query(&InstanceFilter::all());
        self.writer.snapshot_instances(&instances).await;

        let report = MaintenanceReport {
            sweep,
            expired_requests,
            rerouted,
            flushed,
        };
        if !report.sweep.is_empty() || !report.expired_requests.is_empty() || report.rerouted > 0 {
            debug!("Maintenance pass: {:?}", report);
        }
        report
    }

    fn reroute_orphans(&self) -> usize {
        let Some(fallback) = &self.config.fallback_game_type else {
            return 0;
        };

        let mut rerouted = 0;
        for player in self.directory.orphaned() {
            match self.engine.submit(
                player,
                RouteConstraints::game_type(fallback.clone()),
                RouteReason::Orphaned,
            ) {
                Ok(_) => rerouted += 1,
                Err(e) => debug!("Could not re-route orphaned player {}: {}", player, e),
            }
        }
        if rerouted > 0 {
            info!("🧭 Re-routing {} orphaned player(s) to {}", rerouted, fallback);
        }
        rerouted
    }

    /// Runs maintenance every `sweep_interval` until `shutdown` fires.
    pub fn spawn_maintenance(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(controller.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        controller.run_maintenance().await;
                    }
                    _ = shutdown.recv() => {
                        debug!("Maintenance loop stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Flushes what can be flushed and releases the store.
    pub async fn shutdown(&self) {
        info!("🧹 Shutting down controller...");
        let flushed = self.writer.flush_pending().await;
        let pending = self.writer.pending_len();
        if pending > 0 {
            warn!("{} session record(s) could not be written before shutdown", pending);
        } else if flushed > 0 {
            info!("💾 Wrote {} buffered session record(s)", flushed);
        }
        self.links.clear();
        self.cache.clear();
        self.writer.store().close().await;
        info!("✅ Controller stopped");
    }
}
