use super::connection::handle_connection;
use crate::controller::Controller;
use crate::error::{ControllerError, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

/// Accepts instance connections and hands each one to its own task.
pub struct ControllerServer {
    controller: Arc<Controller>,
    listener: TcpListener,
    local_addr: SocketAddr,
    connection_slots: Arc<Semaphore>,
    shutdown_sender: broadcast::Sender<()>,
}

impl ControllerServer {
    /// Binds the configured protocol address.
    ///
    /// The listener is created through `socket2` with `SO_REUSEADDR` set,
    /// then handed to tokio. Binding port 0 picks a free port; read it back
    /// with [`local_addr`](Self::local_addr).
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Network`] when the socket cannot be
    /// created, bound or switched to non-blocking mode.
    pub fn bind(controller: Arc<Controller>) -> Result<Self> {
        let config = controller.config();
        let address = config.bind_address;

        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ControllerError::Network(format!("Socket creation failed: {e}")))?;
        socket.set_reuse_address(true).ok();
        socket
            .bind(&address.into())
            .map_err(|e| ControllerError::Network(format!("Bind to {address} failed: {e}")))?;
        socket
            .listen(1024)
            .map_err(|e| ControllerError::Network(format!("Listen failed: {e}")))?;

        let std_listener: StdTcpListener = socket.into();
        std_listener
            .set_nonblocking(true)
            .map_err(|e| ControllerError::Network(format!("Non-blocking mode failed: {e}")))?;
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| ControllerError::Network(format!("Tokio listener creation failed: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ControllerError::Network(e.to_string()))?;

        info!("✅ Instance protocol listener bound on {}", local_addr);

        let (shutdown_sender, _) = broadcast::channel(1);
        let connection_slots = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Ok(Self {
            controller,
            listener,
            local_addr,
            connection_slots,
            shutdown_sender,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sender that stops the accept loop and every open connection.
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_sender.clone()
    }

    /// Accepts connections until a shutdown signal is received.
    ///
    /// Every accepted connection runs in its own task, bounded by
    /// `max_connections`; connections over the limit are dropped on accept.
    /// On shutdown the accept loop stops and each connection task is told to
    /// close. Instances whose connection closed without a DEREGISTER stay
    /// registered until the heartbeat sweep evicts them.
    ///
    /// # Returns
    ///
    /// `Ok(())` after a clean shutdown. Accept errors are logged and do not
    /// end the loop.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use lane_controller::{Controller, ControllerConfig, ControllerServer, LoggingAdapter};
    /// # use std::sync::Arc;
    /// # async fn serve() -> lane_controller::Result<()> {
    /// let controller = Arc::new(Controller::connect(ControllerConfig::default(), Arc::new(LoggingAdapter)).await?);
    /// let server = ControllerServer::bind(controller)?;
    /// let shutdown = server.shutdown_sender();
    /// let running = tokio::spawn(server.run());
    ///
    /// // later
    /// let _ = shutdown.send(());
    /// running.await.ok();
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run(self) -> Result<()> {
        let mut shutdown = self.shutdown_sender.subscribe();
        info!("🚀 Accepting instance connections on {}", self.local_addr);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let Ok(permit) = self.connection_slots.clone().try_acquire_owned() else {
                            warn!("🚫 Connection limit reached, refusing {}", addr);
                            continue;
                        };
                        debug!("Instance connection from {}", addr);
                        let controller = self.controller.clone();
                        let shutdown = self.shutdown_sender.subscribe();
                        tokio::spawn(async move {
                            handle_connection(stream, addr, controller, shutdown).await;
                            drop(permit);
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, closing listener");
                    break;
                }
            }
        }

        Ok(())
    }
}
