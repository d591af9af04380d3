//! Per-account worker process for the broker gateway
//!
//! A worker owns exactly one broker session, receives framed commands on
//! stdin, executes them through an explicit method registry and answers on
//! stdout.

pub mod core;
pub mod error;
pub mod services;
pub mod traits;
pub mod worker_impl;

// Re-export main types
pub use crate::core::{standard_registry, Call, MethodHandler, MethodParams, MethodRegistry};
pub use error::{WorkerError, WorkerResult};
pub use services::HttpBrokerSession;
pub use traits::BrokerSession;
pub use worker_impl::Worker;
