use crate::controller::Controller;
use crate::error::ControllerError;
use crate::registry::{StateUpdate, UpdateOutcome};
use lane_protocol::{
    Envelope, FrameWriter, FramedConnection, InstanceDescriptor, InstanceId, Message, ProtocolError,
    RejectCode, SequenceTracker,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Drives one instance connection until it closes or the server shuts down.
///
/// The registry entry outlives the connection: losing the link only stops
/// directives, and the entry expires through the heartbeat timeout.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    controller: Arc<Controller>,
    mut shutdown: broadcast::Receiver<()>,
) {
    stream.set_nodelay(true).ok();
    let (mut reader, writer) = FramedConnection::new(stream, addr).into_split();
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let writer_task = tokio::spawn(write_loop(writer, outbound_rx, addr));

    let mut session = ConnectionSession {
        controller,
        addr,
        outbound,
        instance: None,
        link_token: 0,
        inbound: SequenceTracker::new(),
    };

    loop {
        let read = tokio::select! {
            read = reader.read_envelope() => read,
            _ = shutdown.recv() => break,
        };

        let flow = match read {
            Ok(Some(envelope)) => session.handle(envelope).await,
            Ok(None) => {
                debug!("Connection from {} closed by peer", addr);
                Flow::Close
            }
            Err(e @ ProtocolError::UnsupportedVersion { .. }) => {
                session.reject(RejectCode::UnsupportedVersion, e.to_string()).await;
                Flow::Close
            }
            Err(ProtocolError::Serialization(e)) => {
                // Framing is intact, only this body is bad.
                session
                    .reject(RejectCode::ProtocolViolation, format!("malformed frame: {e}"))
                    .await;
                Flow::Continue
            }
            Err(e) => {
                warn!("Connection from {} failed: {}", addr, e);
                Flow::Close
            }
        };

        if flow == Flow::Close {
            break;
        }
    }

    session.detach();
    drop(session);
    if let Err(e) = writer_task.await {
        warn!("Writer task for {} ended abnormally: {}", addr, e);
    }
}

async fn write_loop(mut writer: FrameWriter<OwnedWriteHalf>, mut outbound: mpsc::Receiver<Message>, addr: SocketAddr) {
    let mut seq = 0u64;
    while let Some(message) = outbound.recv().await {
        seq += 1;
        debug!("→ {} {} seq={}", addr, message.kind(), seq);
        if let Err(e) = writer.write_envelope(&Envelope::new(seq, message)).await {
            warn!("Write to {} failed: {}", addr, e);
            return;
        }
    }
    writer.shutdown().await.ok();
}

struct ConnectionSession {
    controller: Arc<Controller>,
    addr: SocketAddr,
    outbound: mpsc::Sender<Message>,
    instance: Option<InstanceId>,
    link_token: u64,
    inbound: SequenceTracker,
}

impl ConnectionSession {
    async fn send(&self, message: Message) {
        if self.outbound.send(message).await.is_err() {
            debug!("Writer for {} already gone", self.addr);
        }
    }

    async fn reject(&self, code: RejectCode, message: impl Into<String>) {
        let message = message.into();
        warn!("🚫 Rejecting frame from {} ({:?}): {}", self.addr, code, message);
        self.send(Message::Rejected { code, message }).await;
    }

    fn detach(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.controller.links().detach(&instance, self.link_token);
        }
    }

    async fn handle(&mut self, envelope: Envelope) -> Flow {
        let seq = envelope.seq;
        if !self.inbound.accept(seq) {
            debug!(
                "Discarding {} seq={} from {} (last applied {:?})",
                envelope.message.kind(),
                seq,
                self.addr,
                self.inbound.last()
            );
            return Flow::Continue;
        }
        debug!("← {} {} seq={}", self.addr, envelope.message.kind(), seq);

        let Some(instance) = self.instance.clone() else {
            return match envelope.message {
                Message::Register { descriptor } => self.register(descriptor, seq).await,
                other => {
                    self.reject(
                        RejectCode::NotRegistered,
                        format!("expected REGISTER, got {}", other.kind()),
                    )
                    .await;
                    Flow::Close
                }
            };
        };

        match envelope.message {
            Message::Register { .. } => {
                self.reject(
                    RejectCode::ProtocolViolation,
                    format!("connection already registered as {instance}"),
                )
                .await;
                Flow::Continue
            }
            Message::Heartbeat { status } => {
                let result = self.controller.registry().heartbeat(&instance, seq, status);
                match result {
                    Ok(UpdateOutcome::Applied) => {
                        self.send(Message::HeartbeatAck).await;
                        Flow::Continue
                    }
                    Ok(UpdateOutcome::Stale) => Flow::Continue,
                    Err(e) => self.entry_error(&instance, e).await,
                }
            }
            Message::StateUpdate {
                occupancy,
                capacity,
                closing,
            } => {
                let update = StateUpdate {
                    occupancy,
                    capacity,
                    closing,
                };
                match self.controller.registry().apply_state_update(&instance, seq, update) {
                    Ok(_) => Flow::Continue,
                    Err(e) => self.entry_error(&instance, e).await,
                }
            }
            Message::RouteAck { request_id } => {
                if let Err(e) = self.controller.engine().acknowledge(&instance, request_id).await {
                    warn!("ROUTE_ACK {} from {} not applied: {}", request_id, instance, e);
                }
                Flow::Continue
            }
            Message::RouteNack { request_id, reason } => {
                if let Err(e) = self.controller.engine().decline(&instance, request_id, &reason) {
                    warn!("ROUTE_NACK {} from {} not applied: {}", request_id, instance, e);
                }
                Flow::Continue
            }
            Message::Deregister => {
                self.detach();
                if let Err(e) = self.controller.deregister_instance(&instance) {
                    debug!("Deregister of {} after eviction: {}", instance, e);
                }
                Flow::Close
            }
            Message::Unknown => {
                debug!("Ignoring unknown message kind from {}", instance);
                Flow::Continue
            }
            other @ (Message::Registered { .. }
            | Message::HeartbeatAck
            | Message::RouteDirective { .. }
            | Message::Rejected { .. }) => {
                self.reject(
                    RejectCode::ProtocolViolation,
                    format!("{} is sent by the controller only", other.kind()),
                )
                .await;
                Flow::Continue
            }
        }
    }

    async fn register(&mut self, descriptor: InstanceDescriptor, seq: u64) -> Flow {
        match self.controller.register_instance(descriptor, seq) {
            Ok(id) => {
                self.link_token = self.controller.links().attach(id.clone(), self.outbound.clone());
                let heartbeat_interval_ms = self.controller.config().heartbeat_interval.as_millis() as u64;
                self.send(Message::Registered {
                    instance_id: id.clone(),
                    heartbeat_interval_ms,
                })
                .await;
                info!("🔗 Instance {} connected from {}", id, self.addr);
                self.instance = Some(id);
                Flow::Continue
            }
            Err(e) => {
                let code = match e {
                    ControllerError::DuplicateRegistration(_) => RejectCode::DuplicateRegistration,
                    ControllerError::Validation(_) => RejectCode::Validation,
                    _ => RejectCode::ProtocolViolation,
                };
                self.reject(code, e.to_string()).await;
                Flow::Close
            }
        }
    }

    /// Maps a failed per-instance update to a reply. An entry that no longer
    /// exists closes the connection so the instance re-registers.
    async fn entry_error(&mut self, instance: &InstanceId, error: ControllerError) -> Flow {
        match error {
            ControllerError::NotFound { .. } => {
                self.reject(
                    RejectCode::NotRegistered,
                    format!("instance {instance} is no longer registered"),
                )
                .await;
                Flow::Close
            }
            ControllerError::Validation(message) => {
                self.reject(RejectCode::Validation, message).await;
                Flow::Continue
            }
            other => {
                warn!("Update from {} failed: {}", instance, other);
                Flow::Continue
            }
        }
    }
}
