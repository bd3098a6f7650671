//! Instance-side client for registering with a controller.
//!
//! A game-server instance uses [`InstanceClient`] to register itself, keep its
//! registry entry fresh with heartbeats, report occupancy changes and answer
//! routing directives.

use crate::codec::{Envelope, ProtocolError};
use crate::message::{Message, RejectCode};
use crate::transport::{FrameReader, FrameWriter, FramedConnection};
use crate::types::{HealthStatus, InstanceDescriptor, InstanceId, PlayerId, RequestId};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

/// Connection settings for [`InstanceClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Controller address (e.g., "127.0.0.1:7400")
    pub controller_address: String,
    /// How long to wait for the controller to answer REGISTER
    pub register_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            controller_address: "127.0.0.1:7400".to_string(),
            register_timeout: Duration::from_secs(10),
        }
    }
}

/// A routing directive received from the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub request_id: RequestId,
    pub players: Vec<PlayerId>,
}

/// Registered connection from an instance to the controller.
pub struct InstanceClient {
    instance_id: InstanceId,
    capacity: AtomicU32,
    occupancy: AtomicU32,
    heartbeat_interval: Duration,
    seq: AtomicU64,
    writer: Mutex<FrameWriter<OwnedWriteHalf>>,
    directives: Mutex<mpsc::UnboundedReceiver<Directive>>,
    connected: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl InstanceClient {
    /// Connects to the controller and registers `descriptor`.
    ///
    /// Resolves once the controller has answered with REGISTERED, or fails if
    /// it answered with REJECTED or not at all.
    pub async fn connect(
        config: &ClientConfig,
        descriptor: InstanceDescriptor,
    ) -> Result<Self, ProtocolError> {
        info!("📡 Registering with controller at {}", config.controller_address);

        let connection = FramedConnection::connect(&config.controller_address).await?;
        let (mut reader, mut writer) = connection.into_split();
        let capacity = descriptor.capacity;

        writer
            .write_envelope(&Envelope::new(1, Message::Register { descriptor }))
            .await?;

        let reply = timeout(config.register_timeout, reader.read_envelope())
            .await
            .map_err(|_| ProtocolError::Unexpected("no answer to REGISTER".to_string()))??;

        let (instance_id, heartbeat_interval) = match reply.map(|e| e.message) {
            Some(Message::Registered {
                instance_id,
                heartbeat_interval_ms,
            }) => (instance_id, Duration::from_millis(heartbeat_interval_ms)),
            Some(Message::Rejected { code, message }) => {
                error!("❌ Registration rejected ({code:?}): {message}");
                return Err(ProtocolError::Unexpected(format!(
                    "registration rejected ({code:?}): {message}"
                )));
            }
            Some(other) => {
                return Err(ProtocolError::Unexpected(format!(
                    "expected REGISTERED, got {}",
                    other.kind()
                )))
            }
            None => return Err(ProtocolError::ConnectionClosed),
        };

        info!("✅ Registered with controller as {}", instance_id);

        let (directive_tx, directive_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let reader_task = tokio::spawn(read_loop(reader, directive_tx, connected.clone()));

        Ok(Self {
            instance_id,
            capacity: AtomicU32::new(capacity),
            occupancy: AtomicU32::new(0),
            heartbeat_interval,
            seq: AtomicU64::new(1),
            writer: Mutex::new(writer),
            directives: Mutex::new(directive_rx),
            connected,
            reader_task,
        })
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Heartbeat interval suggested by the controller.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: Message) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        // Assigned under the writer lock so frames hit the wire in seq order.
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("→ {} seq={}", message.kind(), seq);
        writer.write_envelope(&Envelope::new(seq, message)).await
    }

    pub async fn heartbeat(&self, status: HealthStatus) -> Result<(), ProtocolError> {
        self.send(Message::Heartbeat { status }).await
    }

    /// Reports current occupancy and capacity.
    pub async fn update_state(&self, occupancy: u32, capacity: u32) -> Result<(), ProtocolError> {
        self.occupancy.store(occupancy, Ordering::SeqCst);
        self.capacity.store(capacity, Ordering::SeqCst);
        self.send(Message::StateUpdate {
            occupancy,
            capacity,
            closing: false,
        })
        .await
    }

    /// Tells the controller this instance is draining; no new players will be routed here.
    pub async fn begin_closing(&self) -> Result<(), ProtocolError> {
        self.send(Message::StateUpdate {
            occupancy: self.occupancy.load(Ordering::SeqCst),
            capacity: self.capacity.load(Ordering::SeqCst),
            closing: true,
        })
        .await
    }

    pub async fn ack(&self, request_id: RequestId) -> Result<(), ProtocolError> {
        self.send(Message::RouteAck { request_id }).await
    }

    pub async fn nack(&self, request_id: RequestId, reason: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(Message::RouteNack {
            request_id,
            reason: reason.into(),
        })
        .await
    }

    /// Waits for the next routing directive. Returns `None` once the
    /// connection to the controller is gone.
    pub async fn next_directive(&self) -> Option<Directive> {
        self.directives.lock().await.recv().await
    }

    /// Sends DEREGISTER and closes the connection.
    pub async fn deregister(&self) -> Result<(), ProtocolError> {
        self.send(Message::Deregister).await?;
        self.writer.lock().await.shutdown().await?;
        self.connected.store(false, Ordering::SeqCst);
        info!("👋 Deregistered {} from controller", self.instance_id);
        Ok(())
    }

    /// Spawns a loop sending a heartbeat every [`heartbeat_interval`](Self::heartbeat_interval).
    ///
    /// The loop ends when a heartbeat can't be written.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(client.heartbeat_interval.max(Duration::from_millis(10)));
            loop {
                ticker.tick().await;
                if let Err(e) = client.heartbeat(HealthStatus::Healthy).await {
                    warn!("💔 Heartbeat failed, stopping loop: {}", e);
                    break;
                }
            }
        })
    }
}

impl Drop for InstanceClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(
    mut reader: FrameReader<OwnedReadHalf>,
    directives: mpsc::UnboundedSender<Directive>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match reader.read_envelope().await {
            Ok(Some(envelope)) => match envelope.message {
                Message::RouteDirective {
                    request_id,
                    players,
                } => {
                    if directives.send(Directive { request_id, players }).is_err() {
                        break;
                    }
                }
                Message::HeartbeatAck => {}
                Message::Rejected { code, message } => {
                    warn!("Controller rejected a message ({code:?}): {message}");
                    if code == RejectCode::NotRegistered {
                        break;
                    }
                }
                other => debug!("Ignoring {} from controller", other.kind()),
            },
            Ok(None) => {
                info!("Controller closed the connection");
                break;
            }
            Err(e) => {
                warn!("Controller connection error: {}", e);
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}
