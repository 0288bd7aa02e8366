//! Module lifecycle management for the relay.
//!
//! A module is a protocol handler (IRC network, Minecraft server) that owns
//! zero or more named connections. Modules are created from a static factory
//! registry populated at startup, configured in two phases (every module is
//! loaded before any module reads configuration, so cross-module name
//! references always resolve), activated without blocking the caller, and
//! signalled to shut down in turn.

pub mod error;
pub mod manager;
pub mod module;
pub mod registry;

pub use error::ModuleError;
pub use manager::{ModuleManager, ModuleState};
pub use module::Module;
pub use registry::{ModuleFactory, ModuleRegistry};
