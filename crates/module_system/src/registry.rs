//! Static module factory registry.
//!
//! Modules are instantiated by name from a table populated at startup, so an
//! unknown name in the configuration is a plain configuration error instead
//! of a failed dynamic import.

use crate::error::ModuleError;
use crate::module::Module;
use relay_events::{EventBus, ShutdownState};
use std::collections::HashMap;
use std::sync::Arc;

/// Constructor for one module kind.
pub type ModuleFactory =
    Box<dyn Fn(Arc<EventBus>, ShutdownState) -> Box<dyn Module> + Send + Sync>;

/// Name-keyed table of module constructors.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a module name. Later registrations replace
    /// earlier ones.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(Arc<EventBus>, ShutdownState) -> Box<dyn Module> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Instantiate the named module, or fail with
    /// [`ModuleError::UnknownModule`].
    pub fn create(
        &self,
        name: &str,
        bus: Arc<EventBus>,
        shutdown: ShutdownState,
    ) -> Result<Box<dyn Module>, ModuleError> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory(bus, shutdown)),
            None => Err(ModuleError::UnknownModule(name.to_string())),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}
