//! Hook into the proxy platform that actually moves players.

use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use lane_protocol::{InstanceId, PlayerId, RequestId};
use tracing::info;

/// Implemented by the proxy integration.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Transfers `player` to the instance listening at `address`.
    async fn send_move_command(&self, player: PlayerId, address: &str) -> Result<()>;

    /// Hands a routing directive to an instance the adapter announced with
    /// [`Controller::on_instance_ready`](crate::Controller::on_instance_ready)
    /// and which has no protocol connection of its own.
    ///
    /// Must not block. The instance's answer comes back later through
    /// [`Controller::confirm_route`](crate::Controller::confirm_route) or
    /// [`Controller::decline_route`](crate::Controller::decline_route); an
    /// error here counts as an immediate decline.
    ///
    /// Adapters that cannot reach their instances keep the default, so
    /// their instances decline every directive.
    fn deliver_directive(&self, instance: &InstanceId, _request: RequestId, _players: &[PlayerId]) -> Result<()> {
        Err(ControllerError::Network(format!(
            "adapter cannot deliver directives to {instance}"
        )))
    }
}

/// Adapter that only logs what it is asked to do. Directives are accepted
/// and left unanswered, so they expire unless confirmed by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAdapter;

#[async_trait]
impl PlatformAdapter for LoggingAdapter {
    async fn send_move_command(&self, player: PlayerId, address: &str) -> Result<()> {
        info!("🚚 Moving player {} to {}", player, address);
        Ok(())
    }

    fn deliver_directive(&self, instance: &InstanceId, request: RequestId, players: &[PlayerId]) -> Result<()> {
        info!(
            "📨 Directive {} for {} player(s) handed to {}",
            request,
            players.len(),
            instance
        );
        Ok(())
    }
}
