//! Error types for the module system.

/// Main error type for module loading and configuration.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// A module with this name is already loaded
    #[error("module {0} is already loaded")]
    AlreadyLoaded(String),

    /// The factory registry has no entry for this name
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// Malformed or incomplete configuration for a module or connection
    #[error("configuration error in module {module}: {reason}")]
    ConfigError { module: String, reason: String },
}

impl ModuleError {
    pub fn config(module: &str, reason: impl Into<String>) -> Self {
        ModuleError::ConfigError {
            module: module.to_string(),
            reason: reason.into(),
        }
    }
}
