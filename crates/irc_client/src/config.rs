//! Configuration model for IRC client instances.
//!
//! The module receives its raw `[modules.irc]` node and deserializes each
//! `[[modules.irc.client]]` entry on its own, so one broken client skips
//! that client with a warning while the others proceed.

use module_system::ModuleError;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

fn default_port() -> u16 {
    6667
}

fn default_reconnect_delay() -> u64 {
    30
}

fn default_connect_retry_delay() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub nick: String,
    pub username: String,
    pub gecos: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawClientConfig {
    name: String,
    server: ServerConfig,
    user: UserConfig,
    #[serde(default, rename = "channel")]
    channels: Vec<ChannelConfig>,
    /// Delay before reconnecting after an established session is lost
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay: u64,
    /// Delay before retrying after a failed connection attempt
    #[serde(default = "default_connect_retry_delay")]
    connect_retry_delay: u64,
}

/// Validated configuration for one IRC client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub server: ServerConfig,
    pub user: UserConfig,
    /// Lowercased channel name → channel settings
    pub channels: HashMap<String, ChannelConfig>,
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
        .map_err(|e| ModuleError::config("irc", e.to_string()))?;

    let mut clients: Vec<ClientConfig> = Vec::new();
    for value in raw.clients {
        let client: RawClientConfig = match value.try_into() {
            Ok(client) => client,
            Err(e) => {
                warn!("Skipping IRC client with invalid configuration: {}", e);
                continue;
            }
        };
        if clients.iter().any(|c| c.name == client.name) {
            warn!("Duplicate IRC client config name: {}", client.name);
            continue;
        }

        let mut channels = HashMap::new();
        for chan in client.channels {
            let lower = chan.name.to_lowercase();
            if channels.contains_key(&lower) {
                warn!(
                    "Channel {} for IRC client {} already exists",
                    chan.name, client.name
                );
                continue;
            }
            if chan.key.as_deref().is_some_and(|key| key.contains(' ')) {
                warn!(
                    "Channel {} for IRC client {} has a key containing a space, skipping channel",
                    chan.name, client.name
                );
                continue;
            }
            channels.insert(lower, chan);
        }

        let password = client.server.password.filter(|p| !p.is_empty());
        clients.push(ClientConfig {
            name: client.name,
            server: ServerConfig {
                password,
                ..client.server
            },
            user: client.user,
            channels,
            reconnect_delay: Duration::from_secs(client.reconnect_delay),
            connect_retry_delay: Duration::from_secs(client.connect_retry_delay),
        });
    }
    Ok(clients)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(src: &str) -> toml::Value {
        toml::from_str(src).unwrap()
    }

    #[test]
    fn loads_a_full_client() {
        let cfgs = load_module_config(&node(
            r##"
            [[client]]
            name = "net1"
            [client.server]
            host = "irc.example.net"
            port = 6697
            tls = true
            password = "hunter2"
            [client.user]
            nick = "relay"
            username = "relay"
            gecos = "Relay Bot"
            [[client.channel]]
            name = "#Lobby"
            key = "sekrit"
            "##,
        ))
        .unwrap();
        assert_eq!(cfgs.len(), 1);
        let cfg = &cfgs[0];
        assert_eq!(cfg.server.port, 6697);
        assert!(cfg.server.tls);
        assert_eq!(cfg.server.password.as_deref(), Some("hunter2"));
        assert_eq!(cfg.channels["#lobby"].name, "#Lobby");
        assert_eq!(cfg.channels["#lobby"].key.as_deref(), Some("sekrit"));
        assert_eq!(cfg.reconnect_delay, Duration::from_secs(30));
        assert_eq!(cfg.connect_retry_delay, Duration::from_secs(10));
    }

    #[test]
    fn broken_client_is_skipped_but_others_load() {
        let cfgs = load_module_config(&node(
            r#"
            [[client]]
            name = "broken"
            [client.user]
            nick = "x"
            username = "x"
            gecos = "x"

            [[client]]
            name = "ok"
            [client.server]
            host = "irc.example.net"
            [client.user]
            nick = "relay"
            username = "relay"
            gecos = "Relay Bot"
            "#,
        ))
        .unwrap();
        assert_eq!(cfgs.len(), 1);
        assert_eq!(cfgs[0].name, "ok");
    }

    #[test]
    fn spaced_key_and_duplicate_channel_are_dropped() {
        let cfgs = load_module_config(&node(
            r##"
            [[client]]
            name = "net1"
            [client.server]
            host = "irc.example.net"
            [client.user]
            nick = "relay"
            username = "relay"
            gecos = "Relay Bot"
            [[client.channel]]
            name = "#a"
            key = "has space"
            [[client.channel]]
            name = "#b"
            [[client.channel]]
            name = "#B"
            "##,
        ))
        .unwrap();
        let channels = &cfgs[0].channels;
        assert!(!channels.contains_key("#a"));
        assert_eq!(channels.len(), 1);
        assert_eq!(channels["#b"].name, "#b");
    }

    #[test]
    fn empty_password_becomes_none() {
        let cfgs = load_module_config(&node(
            r#"
            [[client]]
            name = "net1"
            [client.server]
            host = "irc.example.net"
            password = ""
            [client.user]
            nick = "relay"
            username = "relay"
            gecos = "Relay Bot"
            "#,
        ))
        .unwrap();
        assert!(cfgs[0].server.password.is_none());
    }
}
