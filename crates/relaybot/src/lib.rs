//! # RelayBot - Main Entry Point
//!
//! Relay service bridging IRC networks and Minecraft RCON servers over a
//! shared event bus. This entry point handles CLI parsing, configuration
//! loading, and application lifecycle management.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration
//! relaybot
//!
//! # Specify custom configuration
//! relaybot --config production.toml
//!
//! # Override the log level
//! relaybot --log-level debug
//!
//! # JSON logging for production
//! relaybot --json-logs
//! ```
//!
//! ## Configuration
//!
//! The relay loads configuration from a TOML file (default: `config.toml`).
//! A missing configuration file is fatal: the relay does nothing useful
//! without configured modules.
//!
//! ## Signal Handling
//!
//! The relay shuts down gracefully on:
//! - SIGINT (Ctrl+C)
//! - SIGTERM (Unix systems)

use tracing::error;

mod app;
mod cli;
mod config;
mod logging;
mod signals;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

/// Main entry point for the relay.
///
/// Handles the complete application lifecycle including:
/// 1. Command-line argument parsing
/// 2. Configuration loading and validation
/// 3. Logging system initialization
/// 4. Application creation and execution
/// 5. Error handling and cleanup
///
/// # Exit Codes
///
/// * **0**: Successful execution and shutdown
/// * **1**: Error during startup, configuration, or runtime
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let mut config = match AppConfig::load_from_file(&args.config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Failed to load configuration from {}: {e}",
                args.config_path.display()
            );
            std::process::exit(1);
        }
    };

    // CLI overrides apply before logging starts.
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }

    if let Err(e) = logging::setup_logging(&config.logging) {
        eprintln!("Failed to setup logging: {e}");
        std::process::exit(1);
    }

    match Application::new(args, config).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("Application error: {e:?}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}

// Re-export main types for potential library usage
pub use config::LoggingSettings;
