//! Common test utilities and infrastructure
//!
//! Shared fixtures and helpers for the gateway's integration suites.

pub mod fixtures;
pub mod helpers;

// Re-export commonly used items for convenience
pub use fixtures::TestFixtures;
pub use helpers::{GatewayBuilder, InProcessLauncher, TestGateway};
