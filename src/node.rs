use std::{collections::HashMap, fmt, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::{JsonSchema, Schema};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::warn;

use crate::{
    build_config::{BuildConfig, ConfigUpdate},
    config::Settings,
    http::{HttpError, RemoteClient},
    message::{Message, PortValue},
};

/// What an output port produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Message,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OutputSpec {
    pub name: String,
    pub kind: OutputKind,
}

impl OutputSpec {
    pub fn message(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: OutputKind::Message,
        }
    }

    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: OutputKind::Text,
        }
    }
}

#[typetag::serde]
#[async_trait]
pub trait NodeType: Send + Sync + Debug {
    fn type_name(&self) -> String;
    /// Return this concrete type's schema.
    fn schema(&self) -> Schema;
    fn outputs(&self) -> Vec<OutputSpec>;
    /// The build config for the first render, before any refresh.
    fn build_config(&self) -> BuildConfig;
    /// Recomputes dynamic options after a field changed (or on first load).
    async fn update_build_config(
        &self,
        update: ConfigUpdate,
        context: &NodeContext,
    ) -> Result<BuildConfig, NodeError>;
    /// Reads one output port. Reads within the same `context` are memoised by
    /// nodes that talk to the network.
    async fn output(
        &self,
        port: &str,
        inputs: &Inputs,
        context: &NodeContext,
    ) -> Result<Message, NodeError>;
    fn clone_box(&self) -> Box<dyn NodeType>;
}

#[derive(Serialize, Deserialize)]
pub struct Node(pub Box<dyn NodeType>);

impl std::ops::Deref for Node {
    type Target = dyn NodeType;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Node(self.0.clone_box())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Node").field(&self.0).finish()
    }
}

/// Values on the connected input ports, keyed by port name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Inputs(HashMap<String, PortValue>);

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, port: &str, value: impl Into<PortValue>) -> Self {
        self.0.insert(port.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, port: &str, value: impl Into<PortValue>) {
        self.0.insert(port.to_string(), value.into());
    }

    pub fn get(&self, port: &str) -> Option<&PortValue> {
        self.0.get(port)
    }

    /// Text on `port`, or `None` when unconnected or blank.
    pub fn text(&self, port: &str) -> Option<String> {
        self.get(port)
            .map(PortValue::as_text)
            .filter(|t| !t.trim().is_empty())
    }
}

/// Identifies one node instance for memoisation. Each new or deserialized
/// node gets a fresh id; clones of a node share it along with its caches.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(Arc<str>);

impl Default for InstanceId {
    fn default() -> Self {
        Self(Arc::from(uuid::Uuid::new_v4().to_string()))
    }
}

impl InstanceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-invocation state shared by every node of one run. Each node instance
/// gets its own memoised response, dropped with the context.
#[derive(Clone)]
pub struct NodeContext {
    settings: Arc<Settings>,
    client: RemoteClient,
    responses: Arc<DashMap<InstanceId, Arc<OnceCell<String>>>>,
}

impl NodeContext {
    pub fn new(settings: Settings) -> Self {
        let client = RemoteClient::new(settings.host_rewrite.clone())
            .with_bearer(settings.api_key.clone());
        Self::with_client(settings, client)
    }

    pub fn with_client(settings: Settings, client: RemoteClient) -> Self {
        Self {
            settings: Arc::new(settings),
            client,
            responses: Arc::default(),
        }
    }

    /// A fresh invocation sharing settings and client but no memoised
    /// responses.
    pub fn next_invocation(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            client: self.client.clone(),
            responses: Arc::default(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn client(&self) -> &RemoteClient {
        &self.client
    }

    pub fn is_strict(&self) -> bool {
        self.settings.is_strict()
    }

    /// Runs `compute` at most once per instance and context; later calls
    /// for the same instance get the first successful value. Failed
    /// computations are not cached.
    pub async fn memoize<F, Fut>(
        &self,
        instance: &InstanceId,
        compute: F,
    ) -> Result<String, NodeError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<String, NodeError>>,
    {
        // the map guard must not live across the await
        let cell = self.responses.entry(instance.clone()).or_default().clone();
        cell.get_or_try_init(compute).await.cloned()
    }

    /// Lenient mode turns a failure into the informative `fallback` output,
    /// strict mode hands back `err`.
    pub fn degrade(&self, fallback: String, err: NodeError) -> Result<String, NodeError> {
        if self.is_strict() {
            return Err(err);
        }
        warn!(error = %err, "degrading to informative output");
        Ok(fallback)
    }
}

impl Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("settings", &self.settings)
            .field("memoized_instances", &self.responses.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize, JsonSchema)]
pub enum NodeError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Processing error: {0}")]
    ExecutionFailed(String),
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),
    #[error("Unknown output `{0}`")]
    UnknownOutput(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<HttpError> for NodeError {
    fn from(err: HttpError) -> Self {
        if err.is_transport() {
            NodeError::ConnectionFailed(err.to_string())
        } else {
            NodeError::ExecutionFailed(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_config::Field;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
    struct EchoNode;

    #[typetag::serde(name = "echo")]
    #[async_trait]
    impl NodeType for EchoNode {
        fn type_name(&self) -> String {
            "echo".to_string()
        }

        fn schema(&self) -> Schema {
            schemars::schema_for!(EchoNode)
        }

        fn outputs(&self) -> Vec<OutputSpec> {
            vec![OutputSpec::message("echo")]
        }

        fn build_config(&self) -> BuildConfig {
            BuildConfig::new().with("prefix", Field::text(""))
        }

        async fn update_build_config(
            &self,
            update: ConfigUpdate,
            _context: &NodeContext,
        ) -> Result<BuildConfig, NodeError> {
            Ok(update.config)
        }

        async fn output(
            &self,
            port: &str,
            inputs: &Inputs,
            _context: &NodeContext,
        ) -> Result<Message, NodeError> {
            match port {
                "echo" => Ok(Message::new(inputs.text("in").unwrap_or_default())),
                other => Err(NodeError::UnknownOutput(other.to_string())),
            }
        }

        fn clone_box(&self) -> Box<dyn NodeType> {
            Box::new(self.clone())
        }
    }

    #[test]
    fn test_node_debug_output() {
        let node = Node(Box::new(EchoNode));
        assert_eq!(format!("{:?}", node), "Node(EchoNode)");
    }

    #[test]
    fn test_node_error_display() {
        let err = NodeError::InvalidInput("bad".to_string());
        assert_eq!(format!("{}", err), "Invalid input: bad");
    }

    #[test]
    fn node_deserializes_by_type_tag() {
        let node: Node = serde_json::from_value(json!({"echo": null})).unwrap();
        assert_eq!(node.type_name(), "echo");
    }

    #[tokio::test]
    async fn unknown_port_is_an_error() {
        let ctx = NodeContext::new(Settings::default());
        let err = EchoNode
            .output("nope", &Inputs::new(), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, NodeError::UnknownOutput("nope".into()));
    }

    #[tokio::test]
    async fn memoize_runs_once_per_context() {
        let ctx = NodeContext::new(Settings::default());
        let id = InstanceId::default();
        let first = ctx.memoize(&id, || async { Ok("one".to_string()) }).await.unwrap();
        let second = ctx.memoize(&id, || async { Ok("two".to_string()) }).await.unwrap();
        assert_eq!(first, "one");
        assert_eq!(second, "one");

        let fresh = ctx.next_invocation();
        let third = fresh.memoize(&id, || async { Ok("three".to_string()) }).await.unwrap();
        assert_eq!(third, "three");
    }

    #[tokio::test]
    async fn instances_sharing_a_context_keep_their_own_values() {
        let ctx = NodeContext::new(Settings::default());
        let shared = ctx.clone();
        let (a, b) = (InstanceId::default(), InstanceId::default());
        assert_ne!(a, b);

        let first = ctx.memoize(&a, || async { Ok("from a".to_string()) }).await.unwrap();
        let second = shared.memoize(&b, || async { Ok("from b".to_string()) }).await.unwrap();
        assert_eq!(first, "from a");
        assert_eq!(second, "from b");

        // a clone of the context still sees the first instance's value
        let again = shared.memoize(&a, || async { Ok("late".to_string()) }).await.unwrap();
        assert_eq!(again, "from a");
    }

    #[tokio::test]
    async fn failed_memoize_is_retried() {
        let ctx = NodeContext::new(Settings::default());
        let id = InstanceId::default();
        let err = ctx
            .memoize(&id, || async { Err(NodeError::Internal("x".into())) })
            .await;
        assert!(err.is_err());
        let ok = ctx.memoize(&id, || async { Ok("y".to_string()) }).await.unwrap();
        assert_eq!(ok, "y");
    }

    #[test]
    fn degrade_follows_failure_mode() {
        let lenient = NodeContext::new(Settings::default());
        let out = lenient.degrade("{\"error\":\"x\"}".into(), NodeError::Internal("x".into()));
        assert_eq!(out.unwrap(), "{\"error\":\"x\"}");

        let strict = NodeContext::new(Settings {
            failure_mode: crate::config::FailureMode::Strict,
            ..Settings::default()
        });
        let out = strict.degrade(String::new(), NodeError::Internal("x".into()));
        assert_eq!(out.unwrap_err(), NodeError::Internal("x".into()));
    }

    #[test]
    fn inputs_text_ignores_blank() {
        let inputs = Inputs::new().with("a", "  ").with("b", "hi");
        assert_eq!(inputs.text("a"), None);
        assert_eq!(inputs.text("b"), Some("hi".into()));
        assert_eq!(inputs.text("c"), None);
    }
}
