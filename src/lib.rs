//! # plugin-sentinel
//!
//! Defense-in-depth security layer for dynamically loaded plugins.
//!
//! This crate assesses plugin code before it runs (static analysis, signature trust,
//! role-based permissions, a security test battery) and supervises it while it runs
//! (isolated execution, resource and behavior monitoring, graduated emergency response).
//! [`orchestrator::SecurityOrchestrator`] wires the components together.

pub mod analyzer;
pub mod behavior;
pub mod config;
pub mod emergency;
pub mod error;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod permission;
pub mod plugin;
pub mod resource;
pub mod sandbox;
pub mod signature;
pub mod types;

pub use config::SentinelConfig;
pub use error::{Error, Result};
pub use orchestrator::{SecurityAssessment, SecurityOrchestrator};
pub use plugin::{Plugin, PluginManifest};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::InvalidInput("test".to_string());
        assert!(err.to_string().contains("test"));
    }
}
