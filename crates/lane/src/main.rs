//! Lane controller entry point.
//!
//! Loads configuration, sets up logging, opens the session store, binds the
//! instance protocol listener and runs until SIGINT/SIGTERM.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::{anyhow, Context};
use cli::CliArgs;
use config::AppConfig;
use lane_controller::{Controller, ControllerServer, LoggingAdapter};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Application {
    config: AppConfig,
    controller: Arc<Controller>,
    server: ControllerServer,
}

impl Application {
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(bind_address) = args.bind_address {
            config.controller.bind_address = bind_address;
        }
        if let Some(database_url) = args.database_url {
            config.persistence.database_url = Some(database_url);
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        config
            .validate()
            .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;

        logging::setup_logging(&config.logging)?;
        info!(
            "🌟 Lane Controller v{} | config: {}",
            env!("CARGO_PKG_VERSION"),
            args.config_path.display()
        );

        let controller_config = config.to_controller_config()?;
        let controller = Controller::connect_with_policy(
            controller_config,
            Arc::new(LoggingAdapter),
            config.selection_policy(),
        )
        .await
        .context("opening the session store")?;
        let controller = Arc::new(controller);

        let server = ControllerServer::bind(controller.clone())
            .with_context(|| format!("binding {}", config.controller.bind_address))?;

        Ok(Self {
            config,
            controller,
            server,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            config,
            controller,
            server,
        } = self;

        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", server.local_addr());
        info!("  👥 Max connections: {}", config.controller.max_connections);
        info!(
            "  💓 Heartbeat: every {}ms, evict after {}ms",
            config.controller.heartbeat_interval_ms, config.controller.heartbeat_timeout_ms
        );
        info!(
            "  🎯 Fallback game type: {}",
            config.controller.fallback_game_type.as_deref().unwrap_or("<none>")
        );
        info!(
            "  🗄️ Session store: {}",
            config.persistence.database_url.as_deref().unwrap_or("in-memory")
        );

        let shutdown = server.shutdown_sender();
        let maintenance = controller.spawn_maintenance(shutdown.subscribe());
        let mut server_handle = tokio::spawn(server.run());

        info!("✅ Lane Controller is now running");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        tokio::select! {
            signal = signals::wait_for_shutdown() => {
                match signal {
                    Ok(()) => info!("🛑 Shutdown signal received, initiating graceful shutdown..."),
                    Err(e) => error!("❌ Signal handling failed, shutting down: {}", e),
                }
            }
            finished = &mut server_handle => {
                // The listener only stops on its own when something went wrong.
                error!("❌ Protocol listener stopped unexpectedly: {:?}", finished);
            }
        }

        shutdown.send(()).ok();

        if !server_handle.is_finished() {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut server_handle).await {
                Ok(Ok(Err(e))) => error!("❌ Server error during shutdown: {}", e),
                Ok(Err(e)) => error!("❌ Server task failed: {}", e),
                Ok(Ok(Ok(()))) => {}
                Err(_) => {
                    warn!("⏳ Listener did not stop within {:?}, aborting", SHUTDOWN_GRACE);
                    server_handle.abort();
                }
            }
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, maintenance).await.is_err() {
            warn!("⏳ Maintenance loop did not stop within {:?}", SHUTDOWN_GRACE);
        }

        controller.shutdown().await;
        info!("👋 Lane Controller shutdown complete");
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start application: {:?}", e);
            std::process::exit(1);
        }
    }
}
