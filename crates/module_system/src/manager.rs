//! The module lifecycle manager.
//!
//! Drives every module through load → configure → activate → shutdown.
//! Configuration is two-phase: all modules are loaded before any module
//! reads its configuration, because module configs may reference other
//! modules by name and those names must already exist.

use crate::error::ModuleError;
use crate::module::Module;
use crate::registry::ModuleRegistry;
use relay_events::{EventBus, ShutdownState};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lifecycle position of a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Loaded,
    Configured,
    Active,
    ShuttingDown,
    Stopped,
}

struct LoadedModule {
    name: String,
    state: ModuleState,
    module: Box<dyn Module>,
}

/// Owns the loaded modules and the shared bus, and drives their lifecycle.
pub struct ModuleManager {
    bus: Arc<EventBus>,
    shutdown: ShutdownState,
    registry: ModuleRegistry,
    modules: Vec<LoadedModule>,
}

impl ModuleManager {
    pub fn new(bus: Arc<EventBus>, shutdown: ShutdownState, registry: ModuleRegistry) -> Self {
        Self {
            bus,
            shutdown,
            registry,
            modules: Vec::new(),
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Load one module by name from the factory registry.
    pub fn load(&mut self, name: &str) -> Result<(), ModuleError> {
        if self.modules.iter().any(|m| m.name == name) {
            warn!("Unable to load module {}: already loaded", name);
            return Err(ModuleError::AlreadyLoaded(name.to_string()));
        }
        let module = self
            .registry
            .create(name, self.bus.clone(), self.shutdown.clone())?;
        self.modules.push(LoadedModule {
            name: name.to_string(),
            state: ModuleState::Loaded,
            module,
        });
        debug!("Loaded module {}", name);
        Ok(())
    }

    /// Load every module named in the configuration table, then let each one
    /// read its node. A module whose configuration fails is logged and left
    /// unconfigured; the rest proceed.
    pub fn read_configs(&mut self, modules: &toml::value::Table) -> Result<(), ModuleError> {
        // Phase 1: load everything so cross-module name references resolve.
        for name in modules.keys() {
            if let Err(e) = self.load(name) {
                error!("Error loading module {}: {}", name, e);
            }
        }
        if self.modules.is_empty() {
            return Err(ModuleError::config("core", "no modules could be loaded"));
        }
        info!(
            "Modules loaded: {}",
            self.modules
                .iter()
                .map(|m| m.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        // Phase 2: configuration.
        for loaded in &mut self.modules {
            let Some(node) = modules.get(&loaded.name) else {
                continue;
            };
            match loaded.module.read_config(node) {
                Ok(()) => loaded.state = ModuleState::Configured,
                Err(e) => {
                    error!("Error configuring module {}: {}", loaded.name, e);
                }
            }
        }
        Ok(())
    }

    /// Drive every configured module's connection establishment. Modules
    /// schedule their work and return immediately.
    pub async fn apply_configs(&mut self) {
        for loaded in &mut self.modules {
            if loaded.state != ModuleState::Configured {
                continue;
            }
            debug!("Applying configuration for module {}", loaded.name);
            match loaded.module.apply_config().await {
                Ok(()) => loaded.state = ModuleState::Active,
                Err(e) => {
                    error!("Error activating module {}: {}", loaded.name, e);
                }
            }
        }
    }

    /// Signal every module to shut down. Returns once every shutdown signal
    /// has been dispatched; the underlying sockets close asynchronously.
    pub async fn shutdown(&mut self) {
        self.shutdown.initiate_shutdown();
        for loaded in &mut self.modules {
            if matches!(loaded.state, ModuleState::Stopped) {
                continue;
            }
            debug!("Shutting down module {}", loaded.name);
            loaded.state = ModuleState::ShuttingDown;
            loaded.module.shutdown().await;
            loaded.state = ModuleState::Stopped;
        }
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.modules.iter().any(|m| m.name == name)
    }

    pub fn module_state(&self, name: &str) -> Option<ModuleState> {
        self.modules.iter().find(|m| m.name == name).map(|m| m.state)
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestModule {
        name: &'static str,
        fail_config: bool,
        shut_down: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Module for TestModule {
        fn name(&self) -> &str {
            self.name
        }

        fn read_config(&mut self, _node: &toml::Value) -> Result<(), ModuleError> {
            if self.fail_config {
                Err(ModuleError::config(self.name, "missing host"))
            } else {
                Ok(())
            }
        }

        async fn apply_config(&mut self) -> Result<(), ModuleError> {
            Ok(())
        }

        async fn shutdown(&mut self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    fn registry(fail_irc_config: bool, flag: Arc<AtomicBool>) -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry.register("irc", move |_bus, _shutdown| {
            Box::new(TestModule {
                name: "irc",
                fail_config: fail_irc_config,
                shut_down: flag.clone(),
            })
        });
        registry
    }

    fn manager(registry: ModuleRegistry) -> ModuleManager {
        ModuleManager::new(Arc::new(EventBus::new()), ShutdownState::new(), registry)
    }

    fn table(toml_src: &str) -> toml::value::Table {
        toml::from_str(toml_src).unwrap()
    }

    #[tokio::test]
    async fn unknown_module_is_a_config_error() {
        let mut mgr = manager(ModuleRegistry::new());
        let err = mgr.load("nosuch").unwrap_err();
        assert!(matches!(err, ModuleError::UnknownModule(_)));
    }

    #[tokio::test]
    async fn double_load_fails() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut mgr = manager(registry(false, flag));
        mgr.load("irc").unwrap();
        assert!(matches!(
            mgr.load("irc"),
            Err(ModuleError::AlreadyLoaded(_))
        ));
    }

    #[tokio::test]
    async fn lifecycle_reaches_active_and_stopped() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut mgr = manager(registry(false, flag.clone()));
        mgr.read_configs(&table("[irc]\n")).unwrap();
        assert_eq!(mgr.module_state("irc"), Some(ModuleState::Configured));

        mgr.apply_configs().await;
        assert_eq!(mgr.module_state("irc"), Some(ModuleState::Active));

        mgr.shutdown().await;
        assert_eq!(mgr.module_state("irc"), Some(ModuleState::Stopped));
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn config_failure_skips_activation() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut mgr = manager(registry(true, flag));
        mgr.read_configs(&table("[irc]\n")).unwrap();
        assert_eq!(mgr.module_state("irc"), Some(ModuleState::Loaded));

        mgr.apply_configs().await;
        assert_eq!(mgr.module_state("irc"), Some(ModuleState::Loaded));
    }

    #[tokio::test]
    async fn all_names_load_before_any_config_read() {
        // Both modules must be present in the name space by the time either
        // reads its configuration.
        let flag = Arc::new(AtomicBool::new(false));
        let mut registry = registry(false, flag.clone());
        registry.register("minecraft", move |_bus, _shutdown| {
            Box::new(TestModule {
                name: "minecraft",
                fail_config: false,
                shut_down: flag.clone(),
            })
        });
        let mut mgr = manager(registry);
        mgr.read_configs(&table("[irc]\n[minecraft]\n")).unwrap();
        assert!(mgr.is_loaded("irc"));
        assert!(mgr.is_loaded("minecraft"));
    }
}
