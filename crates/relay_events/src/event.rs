//! The event model shared by every protocol module.
//!
//! Events are transient: they exist for the duration of one dispatch and are
//! never persisted. The payload is kind-specific JSON so modules that do not
//! understand a kind can ignore it without a type dependency on its producer.

use crate::error::EventError;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Event kinds carried by the core.
pub mod kinds {
    /// A message spoken in a joined IRC channel
    pub const CHANNEL_MESSAGE: &str = "CHANNEL_MESSAGE";
    /// A CTCP ACTION in a joined IRC channel
    pub const CHANNEL_ACTION: &str = "CHANNEL_ACTION";
    /// A private message addressed to the bot
    pub const USER_MESSAGE: &str = "USER_MESSAGE";
    /// A CTCP ACTION addressed to the bot
    pub const USER_ACTION: &str = "USER_ACTION";
    /// Raw IRC command for a client to transmit verbatim
    pub const IRC_SENDCMD: &str = "IRC_SENDCMD";
    /// RCON command for a client to execute, optionally with a completion
    pub const RCON_SENDCMD: &str = "RCON_SENDCMD";
}

/// The wire protocol a connection speaks, used for loop suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Irc,
    Rcon,
    Udp,
    Log,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Irc => "irc",
            Protocol::Rcon => "rcon",
            Protocol::Udp => "udp",
            Protocol::Log => "log",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a connection: (module name, instance name).
///
/// Instance names are unique within their module at any instant; the bus
/// enforces this at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointId {
    pub module: CompactString,
    pub instance: CompactString,
}

impl EndpointId {
    pub fn new(module: &str, instance: &str) -> Self {
        Self {
            module: CompactString::new(module),
            instance: CompactString::new(instance),
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.instance)
    }
}

/// A single bus event.
///
/// The completion channel is used only by request/response style events
/// (RCON commands); it can be taken exactly once, by whichever consumer
/// acts on the event.
#[derive(Debug)]
pub struct Event {
    pub kind: CompactString,
    pub source: EndpointId,
    pub protocol: Protocol,
    pub payload: Value,
    completion: Mutex<Option<oneshot::Sender<String>>>,
}

impl Event {
    pub fn new(kind: &str, source: EndpointId, protocol: Protocol, payload: Value) -> Self {
        Self {
            kind: CompactString::new(kind),
            source,
            protocol,
            payload,
            completion: Mutex::new(None),
        }
    }

    /// Attach a completion channel, resolved with the response text by the
    /// connection that executes the request.
    pub fn with_completion(mut self, tx: oneshot::Sender<String>) -> Self {
        self.completion = Mutex::new(Some(tx));
        self
    }

    /// Take the completion channel, if present and not already taken.
    pub fn take_completion(&self) -> Option<oneshot::Sender<String>> {
        self.completion
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }

    /// Deserialize the payload into a kind-specific structure.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, EventError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| EventError::MalformedPayload {
            kind: self.kind.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Sender identity attached to chat events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatSource {
    /// Full source as it appeared on the wire (nick!ident@host)
    pub full: String,
    pub name: String,
    pub ident: String,
    pub host: String,
    /// Prefix-mode letters the sender holds on the channel, e.g. "ov"
    #[serde(default)]
    pub modes: String,
    /// Services account name, empty when not known or not logged in
    #[serde(default)]
    pub account: String,
}

/// Payload of the CHANNEL_/USER_ message and action events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub name: String,
    pub target: String,
    pub message: String,
    pub source: ChatSource,
}

/// Payload of IRC_SENDCMD and RCON_SENDCMD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendCommand {
    pub command: String,
}
