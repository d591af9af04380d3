//! Remote method calls executed by a worker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

/// Carries JSON values as JSON text so non-self-describing codecs can frame them
pub mod json_text {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        let text = serde_json::to_string(value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: DeserializeOwned,
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text).map_err(serde::de::Error::custom)
    }
}

/// A single method invocation for a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: Uuid,
    /// Dotted method name, e.g. `trade.place_order`
    pub method: String,
    #[serde(with = "json_text")]
    pub args: Vec<Value>,
    #[serde(with = "json_text")]
    pub kwargs: Map<String, Value>,
    pub timeout_ms: u64,
}

impl TaskRequest {
    /// Build a request with a fresh task id
    pub fn new(method: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>, timeout: Duration) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            method: method.into(),
            args,
            kwargs,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Outcome of a `TaskRequest`; exactly one per request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: Uuid,
    pub success: bool,
    #[serde(with = "json_text")]
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl TaskResponse {
    pub fn success(task_id: Uuid, result: Value, elapsed: Duration) -> Self {
        Self {
            task_id,
            success: true,
            result: Some(result),
            error: None,
            execution_time_ms: elapsed.as_secs_f64() * 1000.0,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(task_id: Uuid, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            task_id,
            success: false,
            result: None,
            error: Some(error.into()),
            execution_time_ms: elapsed.as_secs_f64() * 1000.0,
            timestamp: Utc::now(),
        }
    }
}
