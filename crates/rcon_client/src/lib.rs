//! Minecraft RCON protocol module.
//!
//! Maintains one authenticated RCON connection per configured server and
//! executes send commands addressed to it from the event bus, resolving
//! each command's completion channel with the server's response.

mod config;
mod connection;
pub mod packet;

pub use packet::RconError;

use async_trait::async_trait;
use config::{load_module_config, ClientConfig};
use module_system::{Module, ModuleError, ModuleRegistry};
use relay_events::EventBus;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const MODULE_NAME: &str = "minecraft";

/// Add the Minecraft factory to a module registry.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register(MODULE_NAME, |bus, _shutdown| {
        Box::new(MinecraftModule::new(bus))
    });
}

pub struct MinecraftModule {
    bus: Arc<EventBus>,
    configs: Vec<Arc<ClientConfig>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MinecraftModule {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            configs: Vec::new(),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl Module for MinecraftModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn read_config(&mut self, node: &toml::Value) -> Result<(), ModuleError> {
        self.configs = load_module_config(node)?.into_iter().map(Arc::new).collect();
        Ok(())
    }

    async fn apply_config(&mut self) -> Result<(), ModuleError> {
        for config in &self.configs {
            info!("Creating Minecraft client {}", config.name);
            self.tasks.push(tokio::spawn(connection::supervise(
                config.clone(),
                self.bus.clone(),
                self.cancel.clone(),
            )));
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("All Minecraft clients stopped");
    }
}
