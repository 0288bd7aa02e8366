//! Configuration model for Minecraft RCON client instances.

use module_system::ModuleError;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

fn default_reconnect_delay() -> u64 {
    30
}

fn default_connect_retry_delay() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct RconConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
}

#[derive(Debug, Deserialize)]
struct RawClientConfig {
    name: String,
    rcon: RconConfig,
    /// Delay before reconnecting after an established session is lost
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay: u64,
    /// Delay before retrying after a failed connection attempt
    #[serde(default = "default_connect_retry_delay")]
    connect_retry_delay: u64,
}

/// Validated configuration for one RCON client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub rcon: RconConfig,
    pub reconnect_delay: Duration,
    pub connect_retry_delay: Duration,
}

#[derive(Debug, Deserialize)]
struct RawModuleConfig {
    #[serde(default, rename = "client")]
    clients: Vec<toml::Value>,
}

/// Parse the module's configuration node into a list of client instances.
pub fn load_module_config(node: &toml::Value) -> Result<Vec<ClientConfig>, ModuleError> {
    let raw: RawModuleConfig = node
        .clone()
        .try_into()
        .map_err(|e| ModuleError::config("minecraft", e.to_string()))?;

    let mut clients: Vec<ClientConfig> = Vec::new();
    for value in raw.clients {
        let client: RawClientConfig = match value.try_into() {
            Ok(client) => client,
            Err(e) => {
                warn!("Skipping Minecraft client with invalid configuration: {}", e);
                continue;
            }
        };
        if clients.iter().any(|c| c.name == client.name) {
            warn!("Duplicate Minecraft client config name: {}", client.name);
            continue;
        }
        if client.rcon.password.is_empty() {
            warn!(
                "Minecraft client {} has an empty RCON password, skipping",
                client.name
            );
            continue;
        }

        clients.push(ClientConfig {
            name: client.name,
            rcon: client.rcon,
            reconnect_delay: Duration::from_secs(client.reconnect_delay),
            connect_retry_delay: Duration::from_secs(client.connect_retry_delay),
        });
    }
    Ok(clients)
}
