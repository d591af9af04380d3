//! Tests for worker services
//!
//! HTTP-facing services are exercised against a local wiremock server.

pub mod broker_session;

/// Shared fixtures for service tests
pub mod common {
    use shared::{AccountId, BrokerEnvironment, SessionCredentials};

    /// Credentials pointing at `server_url`
    pub fn credentials(server_url: &str) -> SessionCredentials {
        SessionCredentials {
            account_id: AccountId::new(),
            account_number: "U7654321".to_string(),
            environment: BrokerEnvironment::Sandbox,
            server_url: server_url.to_string(),
            client_id: "client-7".to_string(),
            private_key: "pk-secret".to_string(),
            access_token: Some("access-7".to_string()),
        }
    }
}
