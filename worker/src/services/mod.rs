//! Worker services implementations

pub mod broker_session;

#[cfg(test)]
pub mod tests;

pub use broker_session::HttpBrokerSession;
