//! # Lane Controller
//!
//! Coordinates a network of self-registering game-server instances behind a
//! routing proxy: which instances exist, how full they are, which player is
//! where, and where the next player should go.
//!
//! ## Components
//!
//! - [`InstanceRegistry`]: authoritative table of instances, per-instance
//!   locking, heartbeat eviction and slot accounting.
//! - [`SessionDirectory`]: player → instance mapping; at most one instance
//!   per player.
//! - [`RoutingEngine`]: matches routing requests to instances, reserves
//!   slots and resolves every request to exactly one terminal state.
//! - [`LookupCache`]: read-through cache in front of the registry and
//!   directory.
//! - [`persistence`]: completed-session records behind a pooled SQLite store
//!   (or an in-memory one), written with bounded retry.
//! - [`ControllerServer`]: the TCP side of the controller–instance protocol.
//!
//! [`Controller`] wires everything together and is what adapters talk to.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lane_controller::{Controller, ControllerConfig, ControllerServer, LoggingAdapter};
//! use std::sync::Arc;
//!
//! # async fn run() -> lane_controller::Result<()> {
//! let controller = Arc::new(Controller::connect(ControllerConfig::default(), Arc::new(LoggingAdapter)).await?);
//! let server = ControllerServer::bind(controller.clone())?;
//! let maintenance = controller.spawn_maintenance(server.shutdown_sender().subscribe());
//! server.run().await?;
//! maintenance.await.ok();
//! controller.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod cache;
pub mod config;
pub mod controller;
pub mod directory;
pub mod error;
pub mod links;
pub mod persistence;
pub mod registry;
pub mod routing;
pub mod server;

pub use adapter::{LoggingAdapter, PlatformAdapter};
pub use cache::{CacheStats, LookupCache, ReadThroughCache};
pub use config::{CacheConfig, ControllerConfig, PersistenceConfig};
pub use controller::{Controller, MaintenanceReport};
pub use directory::{PlayerSession, SessionDirectory, SessionState};
pub use error::{ControllerError, EntityKind, PersistenceError, Result};
pub use links::{DirectiveRouter, InstanceLinks};
pub use persistence::{SessionOutcome, SessionRecord, SessionStore};
pub use registry::{
    EvictionReason, InstanceFilter, InstanceRegistry, InstanceSnapshot, Lifecycle, RegistryObserver,
    StateUpdate, SweepReport, UpdateOutcome,
};
pub use routing::{
    DirectiveSink, LeastLoaded, MostLoaded, RejectReason, RouteConstraints, RouteHandle, RouteReason,
    RouteStage, RouteState, RoutingEngine, RoutingRequest, SelectionPolicy,
};
pub use server::ControllerServer;

// Re-export the wire types adapters need alongside the controller.
pub use lane_protocol::{HealthStatus, InstanceDescriptor, InstanceId, PlayerId, RequestId};
