//! IRC protocol module.
//!
//! Maintains one client connection per configured network, relaying channel
//! and private messages onto the event bus and executing raw send commands
//! addressed to IRC connections. Connections negotiate IRCv3 capabilities,
//! track channel rosters with status and account information, and reconnect
//! on their own until the module shuts down.

mod config;
mod connection;
mod session;
mod wire;

use async_trait::async_trait;
use config::{load_module_config, ClientConfig};
use module_system::{Module, ModuleError, ModuleRegistry};
use relay_events::EventBus;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const MODULE_NAME: &str = "irc";

/// Add the IRC factory to a module registry.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register(MODULE_NAME, |bus, _shutdown| Box::new(IrcModule::new(bus)));
}

pub struct IrcModule {
    bus: Arc<EventBus>,
    configs: Vec<Arc<ClientConfig>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl IrcModule {
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
impl Module for IrcModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn read_config(&mut self, node: &toml::Value) -> Result<(), ModuleError> {
        self.configs = load_module_config(node)?.into_iter().map(Arc::new).collect();
        Ok(())
    }

    async fn apply_config(&mut self) -> Result<(), ModuleError> {
        for config in &self.configs {
            info!("Starting IRC connection {}", config.name);
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
        info!("All IRC connections stopped");
    }
}
