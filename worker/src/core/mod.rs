//! Worker core logic: method table and parameter validation

pub mod handlers;
pub mod registry;

pub use handlers::standard_registry;
pub use registry::{BrokerMethod, Call, MethodHandler, MethodParams, MethodRegistry, HEALTH_CHECK, NAMESPACES};
