//! Event substrate for the relay: the event model, the connection-registry
//! event bus, per-connection timer sets, and shutdown coordination.
//!
//! Protocol modules register their live connections with the [`EventBus`] and
//! exchange [`Event`]s through it; the bus never invokes handler code
//! directly, it only pushes events into each connection's inbox so a slow
//! consumer cannot stall delivery to the others.

pub mod bus;
pub mod error;
pub mod event;
pub mod shutdown;
pub mod timer;

pub use bus::{BusStats, EventBus, EventInbox, EventTarget};
pub use error::{BusError, EventError};
pub use event::{kinds, ChatPayload, ChatSource, EndpointId, Event, Protocol, SendCommand};
pub use shutdown::ShutdownState;
pub use timer::TimerSet;
