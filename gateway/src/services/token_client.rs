//! HTTP client for the broker's token and profile endpoints

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};

use shared::{process_debug, process_warn, ProcessRole};

use crate::config::CredentialConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::traits::{TokenEndpoint, TokenGrant, TokenGrantKind, TokenRequest};

const USER_AGENT: &str = concat!("broker-gateway/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct TokenResponseBody {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// `TokenEndpoint` over reqwest with bounded retries
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    config: CredentialConfig,
}

impl HttpTokenEndpoint {
    pub fn new(config: CredentialConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.api_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| GatewayError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn url(&self, server_url: &str, path: &str) -> String {
        format!("{}{}", server_url.trim_end_matches('/'), path)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.retry_delay * 2u32.saturating_pow(attempt)
    }

    fn body(grant: &TokenGrantKind) -> serde_json::Value {
        match grant {
            TokenGrantKind::RefreshToken {
                refresh_token,
                client_id,
            } => json!({
                "grant_type": grant.grant_type(),
                "refresh_token": refresh_token,
                "client_id": client_id,
            }),
            TokenGrantKind::ClientCredentials {
                client_id,
                client_secret,
            } => json!({
                "grant_type": grant.grant_type(),
                "client_id": client_id,
                "client_secret": client_secret,
            }),
        }
    }

    fn retry_after(&self, response: &reqwest::Response) -> Duration {
        response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_retry_after)
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn request_token(&self, request: &TokenRequest) -> GatewayResult<TokenGrant> {
        let url = self.url(&request.server_url, &self.config.token_path);
        let body = Self::body(&request.grant);
        let attempts = self.config.max_attempts.max(1);

        for attempt in 0..attempts {
            let last = attempt + 1 == attempts;
            let started = Instant::now();

            let response = match self.client.post(&url).json(&body).send().await {
                Ok(response) => response,
                Err(e) => {
                    let kind = if e.is_timeout() { "timeout" } else { "transport error" };
                    if last {
                        return Err(GatewayError::TokenRefresh {
                            status: None,
                            message: format!("token request {kind} after {attempts} attempts: {e}"),
                        });
                    }
                    let wait = self.backoff(attempt);
                    process_warn!(ProcessRole::current(), "⚠️ Token request {}, retrying in {:?}", kind, wait);
                    tokio::time::sleep(wait).await;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let parsed: TokenResponseBody = response.json().await.map_err(|e| GatewayError::TokenRefresh {
                    status: Some(status.as_u16()),
                    message: format!("invalid token response: {e}"),
                })?;
                let access_token = parsed.access_token.ok_or_else(|| GatewayError::TokenRefresh {
                    status: Some(status.as_u16()),
                    message: "no access token in response".to_string(),
                })?;
                process_debug!(ProcessRole::current(), "🔑 Token issued by {}", request.server_url);
                return Ok(TokenGrant {
                    access_token,
                    refresh_token: parsed.refresh_token,
                    expires_in: parsed.expires_in,
                    status_code: status.as_u16(),
                    response_time_ms: started.elapsed().as_millis() as u64,
                });
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = self.retry_after(&response);
                if last {
                    return Err(GatewayError::TokenRateLimit {
                        retry_after_secs: wait.as_secs(),
                    });
                }
                process_warn!(ProcessRole::current(), "⏳ Token endpoint rate limited, waiting {:?}", wait);
                tokio::time::sleep(wait).await;
                continue;
            }

            let text = response.text().await.unwrap_or_default();
            if last {
                return Err(GatewayError::TokenRefresh {
                    status: Some(status.as_u16()),
                    message: format!("HTTP {}: {}", status.as_u16(), text),
                });
            }
            let wait = self.backoff(attempt);
            process_warn!(
                ProcessRole::current(),
                "⚠️ Token endpoint returned HTTP {}, retrying in {:?}",
                status.as_u16(),
                wait
            );
            tokio::time::sleep(wait).await;
        }

        Err(GatewayError::TokenRefresh {
            status: None,
            message: "all retry attempts failed".to_string(),
        })
    }

    async fn probe_token(&self, server_url: &str, access_token: &str) -> GatewayResult<bool> {
        let url = self.url(server_url, &self.config.profile_path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| GatewayError::TokenRefresh {
                status: None,
                message: format!("token validation request failed: {e}"),
            })?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(false),
            s => Err(GatewayError::TokenRefresh {
                status: Some(s.as_u16()),
                message: format!("validation failed: HTTP {}", s.as_u16()),
            }),
        }
    }
}
