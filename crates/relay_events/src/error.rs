//! Error types for the event substrate.

use crate::event::EndpointId;

/// Errors raised by the event bus registry.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// A connection with the same (module, instance) pair is already registered
    #[error("duplicate connection instance: {0}")]
    DuplicateInstance(EndpointId),
}

/// Errors that can occur while consuming events.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Payload did not match the shape expected for its event kind
    #[error("malformed payload for event {kind}: {reason}")]
    MalformedPayload { kind: String, reason: String },
}
