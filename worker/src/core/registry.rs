//! Explicit registry of the broker methods a worker will execute
//!
//! Method names are `namespace.method`. The registry is built once at startup
//! and rejects unknown namespaces and duplicate names, so a bad table fails
//! the worker before it ever reports ready.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{WorkerError, WorkerResult};
use crate::traits::BrokerSession;

/// Namespaces a registered method may live in
pub const NAMESPACES: [&str; 2] = ["trade", "quote"];

/// Built-in method answered by the runtime itself
pub const HEALTH_CHECK: &str = "health_check";

/// Arguments of one invocation as they arrived over the wire
#[derive(Debug, Clone)]
pub struct Call {
    pub method: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Call {
    pub fn new(method: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            method: method.into(),
            args,
            kwargs,
        }
    }

    /// Bind positional arguments onto `positional`, merge keyword arguments
    /// and decode the result into `T`
    pub fn bind<T: DeserializeOwned>(&self, positional: &[&str]) -> WorkerResult<T> {
        if self.args.len() > positional.len() {
            return Err(WorkerError::invalid_params(
                &self.method,
                format!(
                    "expected at most {} positional arguments, got {}",
                    positional.len(),
                    self.args.len()
                ),
            ));
        }

        let mut object = self.kwargs.clone();
        for (name, value) in positional.iter().zip(self.args.iter()) {
            if object.contains_key(*name) {
                return Err(WorkerError::invalid_params(
                    &self.method,
                    format!("argument '{name}' given both positionally and by keyword"),
                ));
            }
            object.insert((*name).to_string(), value.clone());
        }

        serde_json::from_value(Value::Object(object))
            .map_err(|e| WorkerError::invalid_params(&self.method, e.to_string()))
    }
}

/// Typed parameter set for one broker method
pub trait MethodParams: DeserializeOwned + Serialize + Send + Sync + 'static {
    /// Field names bound to positional arguments, in order
    const POSITIONAL: &'static [&'static str];

    /// Semantic checks beyond what deserialization enforces
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Executes one registered method against the session
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, session: &dyn BrokerSession, call: Call) -> WorkerResult<Value>;
}

/// Handler that validates `P` and forwards it to a broker operation
pub struct BrokerMethod<P> {
    operation: String,
    _params: PhantomData<fn() -> P>,
}

impl<P: MethodParams> BrokerMethod<P> {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            _params: PhantomData,
        }
    }
}

#[async_trait]
impl<P: MethodParams> MethodHandler for BrokerMethod<P> {
    async fn handle(&self, session: &dyn BrokerSession, call: Call) -> WorkerResult<Value> {
        let params: P = call.bind(P::POSITIONAL)?;
        params
            .validate()
            .map_err(|message| WorkerError::invalid_params(&call.method, message))?;

        let payload = serde_json::to_value(&params)?;
        session.call(&self.operation, payload).await
    }
}

/// Name → handler table
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler under `name`, rejecting malformed, foreign or duplicate names
    pub fn register(&mut self, name: &str, handler: Arc<dyn MethodHandler>) -> WorkerResult<()> {
        let (namespace, method) = name
            .split_once('.')
            .ok_or_else(|| WorkerError::registry(format!("method '{name}' has no namespace")))?;

        if !NAMESPACES.contains(&namespace) {
            return Err(WorkerError::registry(format!(
                "method '{name}' uses unknown namespace '{namespace}'"
            )));
        }
        if method.is_empty() || method.contains('.') {
            return Err(WorkerError::registry(format!("malformed method name '{name}'")));
        }
        if self.methods.contains_key(name) {
            return Err(WorkerError::registry(format!("method '{name}' registered twice")));
        }

        self.methods.insert(name.to_string(), handler);
        Ok(())
    }

    /// Register a typed broker method whose operation is the part after the namespace
    pub fn register_broker<P: MethodParams>(&mut self, name: &str) -> WorkerResult<()> {
        let operation = name.split_once('.').map(|(_, op)| op).unwrap_or(name);
        self.register(name, Arc::new(BrokerMethod::<P>::new(operation)))
    }

    pub fn resolve(&self, name: &str) -> WorkerResult<Arc<dyn MethodHandler>> {
        self.methods
            .get(name)
            .cloned()
            .ok_or_else(|| WorkerError::UnknownMethod {
                method: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Registered names, sorted
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockBrokerSession;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct EchoParams {
        text: String,
        #[serde(default)]
        repeat: Option<u32>,
    }

    impl MethodParams for EchoParams {
        const POSITIONAL: &'static [&'static str] = &["text", "repeat"];

        fn validate(&self) -> Result<(), String> {
            if self.text.is_empty() {
                return Err("text must not be empty".to_string());
            }
            Ok(())
        }
    }

    fn call(args: Vec<Value>, kwargs: Value) -> Call {
        let kwargs = kwargs.as_object().cloned().unwrap_or_default();
        Call::new("quote.echo", args, kwargs)
    }

    #[test]
    fn test_bind_merges_positional_and_keyword() {
        let params: EchoParams = call(vec![json!("hi")], json!({"repeat": 2}))
            .bind(EchoParams::POSITIONAL)
            .unwrap();

        assert_eq!(params.text, "hi");
        assert_eq!(params.repeat, Some(2));
    }

    #[test]
    fn test_bind_rejects_duplicate_argument() {
        let err = call(vec![json!("hi")], json!({"text": "again"}))
            .bind::<EchoParams>(EchoParams::POSITIONAL)
            .unwrap_err();

        assert!(matches!(err, WorkerError::InvalidParams { .. }));
    }

    #[test]
    fn test_bind_rejects_unknown_keyword() {
        let err = call(vec![], json!({"text": "hi", "colour": "red"}))
            .bind::<EchoParams>(EchoParams::POSITIONAL)
            .unwrap_err();

        assert!(err.to_string().contains("colour"));
    }

    #[test]
    fn test_bind_rejects_surplus_positional() {
        let err = call(vec![json!("a"), json!(1), json!(2)], json!({}))
            .bind::<EchoParams>(EchoParams::POSITIONAL)
            .unwrap_err();

        assert!(err.to_string().contains("at most 2"));
    }

    #[test]
    fn test_register_rejects_unknown_namespace() {
        let mut registry = MethodRegistry::new();
        let err = registry.register_broker::<EchoParams>("push.subscribe").unwrap_err();

        assert!(err.to_string().contains("unknown namespace"));
    }

    #[test]
    fn test_register_rejects_duplicates_and_bare_names() {
        let mut registry = MethodRegistry::new();
        registry.register_broker::<EchoParams>("quote.echo").unwrap();

        assert!(registry.register_broker::<EchoParams>("quote.echo").is_err());
        assert!(registry.register_broker::<EchoParams>(HEALTH_CHECK).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_unknown_method() {
        let registry = MethodRegistry::new();
        let err = registry.resolve("trade.nothing").err().unwrap();

        assert!(matches!(err, WorkerError::UnknownMethod { .. }));
    }

    #[tokio::test]
    async fn test_broker_method_forwards_validated_params() {
        let mut session = MockBrokerSession::new();
        session
            .expect_call()
            .withf(|operation, params| operation == "echo" && params["text"] == "hi")
            .times(1)
            .returning(|_, params| Ok(params));

        let handler = BrokerMethod::<EchoParams>::new("echo");
        let result = handler.handle(&session, call(vec![json!("hi")], json!({}))).await.unwrap();

        assert_eq!(result["text"], "hi");
    }

    #[tokio::test]
    async fn test_broker_method_stops_on_validation_failure() {
        let mut session = MockBrokerSession::new();
        session.expect_call().never();

        let handler = BrokerMethod::<EchoParams>::new("echo");
        let err = handler.handle(&session, call(vec![json!("")], json!({}))).await.unwrap_err();

        assert!(err.to_string().contains("text must not be empty"));
    }
}
