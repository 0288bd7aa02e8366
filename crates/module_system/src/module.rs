//! The module contract implemented by every protocol handler.

use crate::error::ModuleError;
use async_trait::async_trait;

/// A protocol module: the unit the lifecycle manager drives.
///
/// Modules receive their raw configuration node and deserialize it
/// themselves; the manager has no knowledge of per-module schemas. Events
/// reach a module's connections through the inboxes they register with the
/// event bus, not through this trait.
#[async_trait]
pub trait Module: Send + Sync {
    /// The module's unique name, matching its configuration section.
    fn name(&self) -> &str;

    /// Parse this module's configuration node. A connection with a broken
    /// config is skipped with a warning; a module-level failure is returned
    /// and excludes the module from activation.
    fn read_config(&mut self, node: &toml::Value) -> Result<(), ModuleError>;

    /// Begin establishing this module's connections. Must not block: work is
    /// handed to spawned tasks and this returns once they are scheduled.
    async fn apply_config(&mut self) -> Result<(), ModuleError>;

    /// Signal every connection to close and release its timers. Sockets may
    /// finish closing asynchronously after this returns.
    async fn shutdown(&mut self);
}
