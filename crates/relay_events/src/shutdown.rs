//! Shutdown signalling.
//!
//! One shared flag, flipped exactly once by whoever notices the operator
//! wants out (signal handler or module manager). Connection supervisors
//! consult it before scheduling another reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Cloneable handle to the process-wide shutdown flag.
#[derive(Debug, Clone)]
pub struct ShutdownState {
    initiated: Arc<AtomicBool>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.initiated.load(Ordering::Acquire)
    }

    /// Request shutdown; connections stop scheduling reconnects.
    pub fn initiate_shutdown(&self) {
        if !self.initiated.swap(true, Ordering::AcqRel) {
            info!("Shutdown initiated");
        }
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_observe_the_same_flag() {
        let state = ShutdownState::new();
        let observer = state.clone();
        assert!(!observer.is_shutdown_initiated());

        state.initiate_shutdown();
        assert!(observer.is_shutdown_initiated());

        // Repeat requests are harmless.
        observer.initiate_shutdown();
        assert!(state.is_shutdown_initiated());
    }
}
