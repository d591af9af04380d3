//! HTTP broker session bound to one account's credentials

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use serde_json::{json, Value};

use shared::{process_debug, ProcessRole, SessionCredentials};

use crate::error::{WorkerError, WorkerResult};
use crate::traits::BrokerSession;

/// Broker session speaking JSON over HTTPS to the account's server
pub struct HttpBrokerSession {
    credentials: SessionCredentials,
    client: reqwest::Client,
    endpoint: Url,
    opened: AtomicBool,
}

impl HttpBrokerSession {
    /// Create a session; fails if the server URL is unusable
    pub fn new(credentials: SessionCredentials, request_timeout: Duration) -> WorkerResult<Self> {
        let base = Url::parse(&credentials.server_url).map_err(|e| WorkerError::ConfigError {
            message: format!("Invalid server url '{}': {e}", credentials.server_url),
        })?;
        let endpoint = base.join("gateway").map_err(|e| WorkerError::ConfigError {
            message: format!("Invalid server url '{}': {e}", credentials.server_url),
        })?;

        let client = reqwest::Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            credentials,
            client,
            endpoint,
            opened: AtomicBool::new(false),
        })
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }
}

#[async_trait]
impl BrokerSession for HttpBrokerSession {
    async fn open(&self) -> WorkerResult<()> {
        if self.credentials.client_id.trim().is_empty() {
            return Err(WorkerError::SessionError {
                message: "client id is missing".to_string(),
            });
        }
        if self.credentials.private_key.trim().is_empty() {
            return Err(WorkerError::SessionError {
                message: "private key is missing".to_string(),
            });
        }

        self.opened.store(true, Ordering::Release);
        process_debug!(
            ProcessRole::current(),
            "🔌 Broker session open for account {} ({})",
            self.credentials.account_number,
            self.credentials.environment
        );
        Ok(())
    }

    async fn call(&self, operation: &str, params: Value) -> WorkerResult<Value> {
        if !self.is_open() {
            return Err(WorkerError::NotInitialized);
        }

        let body = json!({
            "method": operation,
            "account": self.credentials.account_number,
            "client_id": self.credentials.client_id,
            "timestamp": Utc::now().to_rfc3339(),
            "biz_content": params,
        });

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(token) = &self.credentials.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(WorkerError::BrokerError {
                operation: operation.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        let payload: Value = response.json().await?;

        // Application-level failures arrive as HTTP 200 with a non-zero code
        match payload.get("code").and_then(Value::as_i64) {
            Some(0) | None => Ok(payload.get("data").cloned().unwrap_or(payload)),
            Some(code) => Err(WorkerError::BrokerError {
                operation: operation.to_string(),
                status: status.as_u16(),
                message: format!(
                    "code {code}: {}",
                    payload.get("message").and_then(Value::as_str).unwrap_or("unknown error")
                ),
            }),
        }
    }
}
