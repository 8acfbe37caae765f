use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::{
    build_config::{BuildConfig, ConfigUpdate, Field},
    endpoint::normalize_or_default,
    message::Message,
    node::{Inputs, InstanceId, NodeContext, NodeError, NodeType, OutputSpec},
    options::{FieldAllowList, OptionPair, OptionSet, resolve_options},
};

/// Owners whose models are offered in the dropdown.
pub const ALLOWED_OWNERS: [&str; 2] = ["openai", "sktax"];
/// Dropdown value shown before the first successful refresh.
pub const MODELS_PLACEHOLDER: &str = "(click Refresh models now)";

pub const CHAT_INPUT: &str = "chat_input";
pub const PROMPT_INPUT: &str = "prompt";
pub const TOOLS_INPUT: &str = "tools";

pub const CHAT_OUTPUT: &str = "chat_output";
pub const TEXT_OUTPUT: &str = "text_output";
pub const MODEL_ID_OUTPUT: &str = "model_id";

const MODEL_FIELD: &str = "model_name";
const REFRESH_FIELDS: [&str; 3] = ["backend_url", "force_https", "refresh_now"];
const RAW_PREVIEW_CHARS: usize = 2000;

/// The hardcoded model list used whenever discovery fails or comes back
/// empty. Order matters: the first id is the default model.
pub fn fallback_models() -> OptionSet {
    OptionSet::defaults(vec![
        OptionPair::new("GPT-4o Mini", "gpt-4o-mini"),
        OptionPair::new("GPT-4o", "gpt-4o"),
        OptionPair::new("text-embedding-3-small", "text-embedding-3-small"),
        OptionPair::new("AX4 Model", "ax4"),
    ])
}

/// A function tool offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments. Defaults to an empty object schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl ToolSpec {
    fn to_descriptor(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            }
        })
    }
}

/// `CoeAgent` lists the backend's models (filtered by owner) in a dropdown and
/// sends the chat input to `/v1/chat/completions` with the chosen model.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CoeAgent {
    /// Backend base URL. Empty means `COE_BACKEND_URL` or the built-in default.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backend_url: String,
    #[serde(default)]
    pub force_https: bool,
    /// Label picked in the model dropdown.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_name: String,
    /// Optional system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default = "enabled")]
    pub enable_tools: bool,
    #[serde(default = "enabled")]
    pub tool_choice_auto: bool,
    /// Tools sent with every request when `enable_tools` is on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,

    /// label -> id map from the last refresh. Not serialized.
    #[serde(skip)]
    #[schemars(skip)]
    models: Arc<RwLock<Option<OptionSet>>>,
    #[serde(skip)]
    #[schemars(skip)]
    instance: InstanceId,
}

fn enabled() -> bool {
    true
}

impl Default for CoeAgent {
    fn default() -> Self {
        Self {
            backend_url: String::new(),
            force_https: false,
            model_name: String::new(),
            prompt: None,
            enable_tools: true,
            tool_choice_auto: true,
            tools: Vec::new(),
            models: Arc::default(),
            instance: InstanceId::default(),
        }
    }
}

impl PartialEq for CoeAgent {
    fn eq(&self, other: &Self) -> bool {
        self.backend_url == other.backend_url
            && self.force_https == other.force_https
            && self.model_name == other.model_name
            && self.prompt == other.prompt
            && self.enable_tools == other.enable_tools
            && self.tool_choice_auto == other.tool_choice_auto
            && self.tools == other.tools
        // the model cache and instance id are runtime state
    }
}

impl CoeAgent {
    pub fn with_model(mut self, label: &str) -> Self {
        self.model_name = label.to_string();
        self
    }

    pub fn with_backend(mut self, base: &str, force_https: bool) -> Self {
        self.backend_url = base.to_string();
        self.force_https = force_https;
        self
    }

    pub fn with_prompt(mut self, prompt: Option<String>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    /// The options currently cached on this instance, if any refresh ran.
    pub async fn cached_models(&self) -> Option<OptionSet> {
        self.models.read().await.clone()
    }

    fn base_url(&self, context: &NodeContext) -> String {
        normalize_or_default(
            &self.backend_url,
            &context.settings().backend_url,
            self.force_https,
        )
    }

    /// Fetches the model list and replaces the cache wholesale. Empty or
    /// failed discovery yields the fallback list; strict mode surfaces the
    /// failure instead.
    #[tracing::instrument(name = "coe_agent_refresh_models", skip(self, context))]
    pub async fn refresh_models(
        &self,
        base: &str,
        context: &NodeContext,
    ) -> Result<OptionSet, NodeError> {
        let set = match fetch_models(base, context).await {
            Ok(set) if !set.is_empty() => {
                info!(count = set.len(), base, "models loaded");
                set
            }
            Ok(_) => {
                warn!(base, "server returned no usable models, using fallback list");
                fallback_models()
            }
            Err(err) if context.is_strict() => return Err(err),
            Err(err) => {
                warn!(error = %err, base, "model fetch failed, using fallback list");
                fallback_models()
            }
        };
        *self.models.write().await = Some(set.clone());
        Ok(set)
    }

    /// Maps the selected label to a model id, refreshing the cache first when
    /// it has never been filled. Unknown labels get the first fallback id.
    async fn resolve_model_id(&self, base: &str, context: &NodeContext) -> Result<String, NodeError> {
        let cached = self.models.read().await.clone();
        let set = match cached {
            Some(set) => set,
            None => self.refresh_models(base, context).await?,
        };
        let label = self.model_name.trim();
        let id = set
            .id_for(label)
            .map(str::to_string)
            .or_else(|| fallback_models().first().map(|p| p.id.clone()))
            .unwrap_or_else(|| label.to_string());
        Ok(id)
    }

    fn tool_descriptors(&self, inputs: &Inputs) -> Vec<Value> {
        if !self.enable_tools {
            return Vec::new();
        }
        let mut tools = self.tools.clone();
        if let Some(value) = inputs.get(TOOLS_INPUT) {
            match serde_json::from_str::<Vec<ToolSpec>>(&value.as_text()) {
                Ok(extra) => tools.extend(extra),
                Err(e) => warn!(error = %e, "ignoring malformed tools input"),
            }
        }
        tools
            .iter()
            .filter(|t| !t.name.trim().is_empty())
            .map(ToolSpec::to_descriptor)
            .collect()
    }

    /// One chat completion. Memoised per instance and invocation context.
    #[tracing::instrument(name = "coe_agent_chat", skip_all)]
    async fn chat(&self, inputs: &Inputs, context: &NodeContext) -> Result<String, NodeError> {
        context
            .memoize(&self.instance, move || async move {
                let base = self.base_url(context);
                let model = self.resolve_model_id(&base, context).await?;
                let prompt = inputs
                    .text(PROMPT_INPUT)
                    .or_else(|| self.prompt.clone())
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty());
                let body = chat_payload(
                    &model,
                    prompt.as_deref(),
                    &inputs.text(CHAT_INPUT).unwrap_or_default(),
                    self.tool_descriptors(inputs),
                    self.tool_choice_auto,
                );

                let url = format!("{base}/v1/chat/completions");
                match context
                    .client()
                    .post_json(&url, &body, context.settings().chat_timeout())
                    .await
                {
                    Ok(resp) => Ok(response_text(&resp)),
                    Err(err) => {
                        error!(error = %err, status = ?err.status(), "chat completion failed");
                        let fallback = json!({
                            "error": "chat_completion_failed",
                            "model": model,
                            "detail": err.to_string(),
                        })
                        .to_string();
                        context.degrade(fallback, err.into())
                    }
                }
            })
            .await
    }

    async fn model_id(&self) -> String {
        let label = self.model_name.trim();
        self.models
            .read()
            .await
            .as_ref()
            .and_then(|set| set.id_for(label))
            .unwrap_or_default()
            .to_string()
    }
}

async fn fetch_models(base: &str, context: &NodeContext) -> Result<OptionSet, NodeError> {
    let url = format!("{base}/v1/models");
    let payload = context
        .client()
        .get_json(&url, context.settings().discovery_timeout())
        .await?;
    let filter = FieldAllowList::new("owned_by", ALLOWED_OWNERS);
    Ok(resolve_options(model_items(&payload), &filter, model_pair))
}

/// Items live under `result.data` or `data`.
fn model_items(payload: &Value) -> &[Value] {
    payload
        .pointer("/result/data")
        .and_then(Value::as_array)
        .filter(|items| !items.is_empty())
        .or_else(|| payload.get("data").and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn model_pair(item: &Value) -> Option<OptionPair> {
    let id = item.get("id").and_then(Value::as_str)?.trim();
    if id.is_empty() {
        return None;
    }
    let label = item
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(id);
    Some(OptionPair::new(label, id))
}

pub fn chat_payload(
    model: &str,
    prompt: Option<&str>,
    chat_input: &str,
    tools: Vec<Value>,
    tool_choice_auto: bool,
) -> Value {
    let mut messages = Vec::new();
    if let Some(prompt) = prompt {
        messages.push(json!({"role": "system", "content": prompt}));
    }
    messages.push(json!({"role": "user", "content": chat_input}));

    let mut body = json!({"model": model, "messages": messages});
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools);
        if tool_choice_auto {
            body["tool_choice"] = json!("auto");
        }
    }
    body
}

/// `choices[0].message.content`, or the raw response cut to 2000 characters
/// when there is no usable content.
pub fn response_text(resp: &Value) -> String {
    match resp.pointer("/choices/0/message/content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => choice_array_to_string(parts),
        _ => resp.to_string().chars().take(RAW_PREVIEW_CHARS).collect(),
    }
}

fn choice_array_to_string(parts: &[Value]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            Value::Object(obj) => obj.get("text").and_then(Value::as_str),
            Value::String(s) => Some(s.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[typetag::serde(name = "coe_agent")]
#[async_trait]
impl NodeType for CoeAgent {
    fn type_name(&self) -> String {
        "coe_agent".to_string()
    }

    fn schema(&self) -> schemars::Schema {
        schemars::schema_for!(CoeAgent)
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![
            OutputSpec::message(CHAT_OUTPUT),
            OutputSpec::text(TEXT_OUTPUT),
            OutputSpec::text(MODEL_ID_OUTPUT),
        ]
    }

    fn build_config(&self) -> BuildConfig {
        BuildConfig::new()
            .with("backend_url", Field::text(self.backend_url.clone()))
            .with("force_https", Field::boolean(self.force_https))
            .with("refresh_now", Field::boolean(false))
            .with(MODEL_FIELD, Field::dropdown(Vec::new(), self.model_name.clone()))
            .with("prompt", Field::text(self.prompt.clone().unwrap_or_default()))
            .with("enable_tools", Field::boolean(self.enable_tools))
            .with("tool_choice_auto", Field::boolean(self.tool_choice_auto))
    }

    #[tracing::instrument(name = "coe_agent_update_build_config", skip_all, fields(field = ?update.field_name))]
    async fn update_build_config(
        &self,
        update: ConfigUpdate,
        context: &NodeContext,
    ) -> Result<BuildConfig, NodeError> {
        let base = normalize_or_default(
            &update.effective_text("backend_url"),
            &context.settings().backend_url,
            update.effective_bool("force_https"),
        );
        let (has_options, current) = match update.config.dropdown(MODEL_FIELD) {
            Some((options, value)) => (!options.is_empty(), value.to_string()),
            None => (false, String::new()),
        };
        let triggered = update
            .field_name
            .as_deref()
            .is_some_and(|name| REFRESH_FIELDS.contains(&name));
        let never_loaded = self.models.read().await.is_none();

        if !(never_loaded || triggered || !has_options || current == MODELS_PLACEHOLDER) {
            return Ok(update.config);
        }

        let set = self.refresh_models(&base, context).await?;
        let labels = set.labels();
        let default = labels.first().cloned().unwrap_or_default();
        let mut config = update.config;
        config.set_dropdown(MODEL_FIELD, labels, &default);
        config.reset_bool("refresh_now");
        Ok(config)
    }

    async fn output(
        &self,
        port: &str,
        inputs: &Inputs,
        context: &NodeContext,
    ) -> Result<Message, NodeError> {
        match port {
            CHAT_OUTPUT => Ok(Message::from_sender(self.chat(inputs, context).await?, "AI")),
            TEXT_OUTPUT => Ok(Message::new(self.chat(inputs, context).await?)),
            MODEL_ID_OUTPUT => Ok(Message::new(self.model_id().await)),
            other => Err(NodeError::UnknownOutput(other.to_string())),
        }
    }

    fn clone_box(&self) -> Box<dyn NodeType> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use serde_json::json;

    #[test]
    fn model_items_prefers_nested_result() {
        let payload = json!({"result": {"data": [{"id": "a"}]}, "data": [{"id": "b"}]});
        assert_eq!(model_items(&payload), &[json!({"id": "a"})]);

        let payload = json!({"result": {"data": []}, "data": [{"id": "b"}]});
        assert_eq!(model_items(&payload), &[json!({"id": "b"})]);

        assert!(model_items(&json!({"other": 1})).is_empty());
    }

    #[test]
    fn model_pair_uses_name_then_id() {
        assert_eq!(
            model_pair(&json!({"id": " m1 ", "name": "Model One"})),
            Some(OptionPair::new("Model One", "m1"))
        );
        assert_eq!(model_pair(&json!({"id": "m2"})), Some(OptionPair::new("m2", "m2")));
        assert_eq!(model_pair(&json!({"id": "  "})), None);
        assert_eq!(model_pair(&json!({"name": "no id"})), None);
    }

    #[test]
    fn payload_includes_system_prompt_and_tools() {
        let tools = vec![
            ToolSpec {
                name: "search".into(),
                description: "web search".into(),
                parameters: None,
            }
            .to_descriptor(),
        ];
        let body = chat_payload("gpt-4o", Some("be brief"), "hi", tools, true);
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "hi"}));
        assert_eq!(body["tools"][0]["function"]["parameters"], json!({"type": "object", "properties": {}}));
        assert_eq!(body["tool_choice"], json!("auto"));
    }

    #[test]
    fn payload_omits_empty_tools_and_choice() {
        let body = chat_payload("gpt-4o", None, "hi", vec![], true);
        assert_eq!(body["messages"].as_array().map(Vec::len), Some(1));
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());

        let tools = vec![json!({"type": "function"})];
        let body = chat_payload("gpt-4o", None, "hi", tools, false);
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn response_text_variants() {
        let resp = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(response_text(&resp), "hello");

        let resp = json!({"choices": [{"message": {"content": [{"text": "a"}, {"text": "b"}]}}]});
        assert_eq!(response_text(&resp), "a\nb");

        let resp = json!({"unexpected": "x".repeat(5000)});
        let text = response_text(&resp);
        assert_eq!(text.chars().count(), 2000);
        assert!(text.starts_with("{\"unexpected\""));
    }

    #[test]
    fn disabled_tools_send_nothing() {
        let agent = CoeAgent {
            enable_tools: false,
            tools: vec![ToolSpec {
                name: "t".into(),
                description: String::new(),
                parameters: None,
            }],
            ..CoeAgent::default()
        };
        assert!(agent.tool_descriptors(&Inputs::new()).is_empty());
    }

    #[test]
    fn tools_input_extends_configured_tools() {
        let agent = CoeAgent::default();
        let inputs = Inputs::new().with(TOOLS_INPUT, r#"[{"name":"calc","description":"math"}]"#);
        let tools = agent.tool_descriptors(&inputs);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["function"]["name"], json!("calc"));
    }

    #[tokio::test]
    async fn unreachable_backend_falls_back_to_defaults() {
        let agent = CoeAgent::default();
        let ctx = NodeContext::new(Settings::default());
        let set = agent.refresh_models("http://127.0.0.1:1", &ctx).await.unwrap();
        assert_eq!(set, fallback_models());
        assert_eq!(agent.cached_models().await, Some(fallback_models()));
    }

    #[tokio::test]
    async fn strict_edit_time_refresh_fails_on_unreachable_backend() {
        let agent = CoeAgent::default().with_backend("http://127.0.0.1:1", false);
        let ctx = NodeContext::new(Settings {
            backend_url: "http://127.0.0.1:1".into(),
            failure_mode: crate::config::FailureMode::Strict,
            ..Settings::default()
        });
        let update = ConfigUpdate::changed(agent.build_config(), "refresh_now", json!(true));
        let err = agent.update_build_config(update, &ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::ConnectionFailed(_)), "{err:?}");
        // no fallback list is cached in strict mode
        assert_eq!(agent.cached_models().await, None);
    }

    #[tokio::test]
    async fn model_id_is_empty_until_resolved() {
        let agent = CoeAgent::default().with_model("GPT-4o");
        assert_eq!(agent.model_id().await, "");
        let ctx = NodeContext::new(Settings::default());
        agent.refresh_models("http://127.0.0.1:1", &ctx).await.unwrap();
        assert_eq!(agent.model_id().await, "gpt-4o");
    }

    #[test]
    fn deserializes_with_defaults() {
        let agent: CoeAgent = serde_yaml_bw::from_str("model_name: GPT-4o\n").unwrap();
        assert!(agent.enable_tools);
        assert!(agent.tool_choice_auto);
        assert_eq!(agent.model_name, "GPT-4o");
    }
}
