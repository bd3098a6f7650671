//! Outbound queues of the connected instances.

use crate::adapter::PlatformAdapter;
use crate::error::{ControllerError, Result};
use crate::registry::{EvictionReason, InstanceSnapshot, RegistryObserver};
use crate::routing::DirectiveSink;
use dashmap::{DashMap, DashSet};
use lane_protocol::{InstanceId, Message, PlayerId, RequestId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

struct Link {
    outbound: mpsc::Sender<Message>,
    token: u64,
}

/// Maps registered instances to the writer queue of their connection.
///
/// A re-registration over a new connection replaces the link; each attach
/// returns a token so a closing connection only removes its own link.
#[derive(Default)]
pub struct InstanceLinks {
    links: DashMap<InstanceId, Link>,
    next_token: AtomicU64,
}

impl InstanceLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, instance: InstanceId, outbound: mpsc::Sender<Message>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Link to {} attached (token {})", instance, token);
        self.links.insert(instance, Link { outbound, token });
        token
    }

    /// Removes the link if it still belongs to `token`.
    pub fn detach(&self, instance: &InstanceId, token: u64) -> bool {
        let removed = self
            .links
            .remove_if(instance, |_, link| link.token == token)
            .is_some();
        if removed {
            debug!("Link to {} detached", instance);
        }
        removed
    }

    pub fn is_attached(&self, instance: &InstanceId) -> bool {
        self.links.contains_key(instance)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Queues `message` for `instance` without waiting.
    pub fn send(&self, instance: &InstanceId, message: Message) -> Result<()> {
        let link = self
            .links
            .get(instance)
            .ok_or_else(|| ControllerError::Network(format!("no connection to {instance}")))?;
        link.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => ControllerError::Network(format!("outbound queue to {instance} is full")),
            TrySendError::Closed(_) => ControllerError::Network(format!("connection to {instance} closed")),
        })
    }

    pub fn clear(&self) {
        self.links.clear();
    }
}

impl DirectiveSink for InstanceLinks {
    fn send_directive(&self, instance: &InstanceId, request: RequestId, players: &[PlayerId]) -> Result<()> {
        self.send(
            instance,
            Message::RouteDirective {
                request_id: request,
                players: players.to_vec(),
            },
        )
    }
}

/// Picks the delivery path for a routing directive.
///
/// An instance with a live protocol connection always gets the directive
/// over it. Instances the platform adapter announced (and that never
/// connected) get it through [`PlatformAdapter::deliver_directive`]. Anything
/// else is unreachable.
pub struct DirectiveRouter {
    links: Arc<InstanceLinks>,
    adapter: Arc<dyn PlatformAdapter>,
    managed: DashSet<InstanceId>,
}

impl DirectiveRouter {
    pub fn new(links: Arc<InstanceLinks>, adapter: Arc<dyn PlatformAdapter>) -> Self {
        Self {
            links,
            adapter,
            managed: DashSet::new(),
        }
    }

    /// Marks `instance` as reachable through the adapter until it is evicted.
    pub fn manage(&self, instance: InstanceId) {
        self.managed.insert(instance);
    }

    pub fn is_managed(&self, instance: &InstanceId) -> bool {
        self.managed.contains(instance)
    }
}

impl DirectiveSink for DirectiveRouter {
    fn send_directive(&self, instance: &InstanceId, request: RequestId, players: &[PlayerId]) -> Result<()> {
        if self.links.is_attached(instance) {
            self.links.send_directive(instance, request, players)
        } else if self.managed.contains(instance) {
            self.adapter.deliver_directive(instance, request, players)
        } else {
            Err(ControllerError::Network(format!("no connection to {instance}")))
        }
    }
}

impl RegistryObserver for DirectiveRouter {
    fn on_instance_evicted(&self, instance: &InstanceSnapshot, _reason: EvictionReason) {
        if self.managed.remove(&instance.id).is_some() {
            debug!("Adapter delivery for {} dropped", instance.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_connection_cannot_detach_new_link() {
        let links = InstanceLinks::new();
        let id = InstanceId::new("arena-1");
        let (old_tx, _old_rx) = mpsc::channel(4);
        let (new_tx, mut new_rx) = mpsc::channel(4);

        let old = links.attach(id.clone(), old_tx);
        let _new = links.attach(id.clone(), new_tx);
        assert!(!links.detach(&id, old));

        links
            .send_directive(&id, RequestId::new(), &[PlayerId::new()])
            .unwrap();
        assert!(matches!(new_rx.recv().await, Some(Message::RouteDirective { .. })));
    }

    #[test]
    fn closed_or_missing_link_is_a_network_error() {
        let links = InstanceLinks::new();
        let id = InstanceId::new("arena-1");
        assert!(matches!(
            links.send(&id, Message::HeartbeatAck),
            Err(ControllerError::Network(_))
        ));

        let (tx, rx) = mpsc::channel(1);
        links.attach(id.clone(), tx);
        drop(rx);
        assert!(matches!(
            links.send(&id, Message::HeartbeatAck),
            Err(ControllerError::Network(_))
        ));
    }

    #[derive(Default)]
    struct CountingAdapter {
        directives: AtomicU64,
    }

    #[async_trait::async_trait]
    impl PlatformAdapter for CountingAdapter {
        async fn send_move_command(&self, _player: PlayerId, _address: &str) -> Result<()> {
            Ok(())
        }

        fn deliver_directive(&self, _instance: &InstanceId, _request: RequestId, _players: &[PlayerId]) -> Result<()> {
            self.directives.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn router_prefers_link_then_adapter() {
        let links = Arc::new(InstanceLinks::new());
        let adapter = Arc::new(CountingAdapter::default());
        let router = DirectiveRouter::new(links.clone(), adapter.clone());
        let managed = InstanceId::new("managed");
        let connected = InstanceId::new("connected");
        let stranger = InstanceId::new("stranger");

        router.manage(managed.clone());
        router.manage(connected.clone());
        let (tx, mut rx) = mpsc::channel(4);
        links.attach(connected.clone(), tx);

        router.send_directive(&managed, RequestId::new(), &[PlayerId::new()]).unwrap();
        router.send_directive(&connected, RequestId::new(), &[PlayerId::new()]).unwrap();
        assert!(matches!(
            router.send_directive(&stranger, RequestId::new(), &[PlayerId::new()]),
            Err(ControllerError::Network(_))
        ));

        assert_eq!(adapter.directives.load(Ordering::SeqCst), 1);
        assert!(matches!(rx.recv().await, Some(Message::RouteDirective { .. })));
    }
}
