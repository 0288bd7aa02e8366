//! Main application logic and lifecycle management.
//!
//! The `Application` struct wires the event bus, the module registry and the
//! module manager together, then waits for a shutdown signal and unwinds
//! everything in order.

use crate::{cli::CliArgs, config::AppConfig, logging::display_banner, signals};
use module_system::{ModuleManager, ModuleRegistry};
use relay_events::{EventBus, ShutdownState};
use std::sync::Arc;
use tracing::info;

pub struct Application {
    /// Module lifecycle driver
    manager: ModuleManager,
    /// Shared shutdown coordination state
    shutdown: ShutdownState,
}

impl Application {
    /// Builds the bus, registers the protocol module factories, and runs the
    /// two-phase module load: every configured module reads its raw config
    /// node first, then all of them are applied together.
    pub async fn new(args: CliArgs, config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }

        display_banner();

        let bus = Arc::new(EventBus::new());
        let shutdown = ShutdownState::new();

        let mut registry = ModuleRegistry::new();
        irc_client::register(&mut registry);
        rcon_client::register(&mut registry);

        let mut manager = ModuleManager::new(bus, shutdown.clone(), registry);
        manager.read_configs(&config.modules)?;
        manager.apply_configs().await;

        info!(
            "Config: {} | Modules: {}",
            args.config_path.display(),
            manager.module_names().join(", ")
        );

        Ok(Self { manager, shutdown })
    }

    /// Runs until a termination signal arrives, then shuts the modules down
    /// and reports final bus statistics.
    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Relay running");
        signals::wait_for_shutdown(&self.shutdown).await?;

        self.manager.shutdown().await;

        let stats = self.manager.bus().stats();
        info!(
            "Final bus statistics: {} events broadcast, {} dispatched",
            stats.events_broadcast, stats.events_dispatched
        );
        info!("Shutdown complete");
        Ok(())
    }
}
