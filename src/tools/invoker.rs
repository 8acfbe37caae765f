use async_trait::async_trait;
use reqwest::Method;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::{
    build_config::{BuildConfig, ConfigUpdate, Field},
    endpoint::{TOOLS_PREFIX, join_url},
    http::RawResponse,
    message::{Message, PortValue},
    node::{Inputs, InstanceId, NodeContext, NodeError, NodeType, OutputSpec},
    tools::selection::{Selection, extract_selection},
};

pub const USER_INPUT: &str = "user_input";
pub const SELECTION_INPUT: &str = "selection_json";

pub const CHAT_OUTPUT: &str = "chat_output";
pub const TEXT_OUTPUT: &str = "text_output";
pub const MODEL_ID_OUTPUT: &str = "model_id";

const ALLOWED_METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

/// Upper-cased override if it is one of the supported verbs, POST otherwise.
pub fn parse_method(raw: &str) -> Method {
    let upper = raw.trim().to_uppercase();
    if ALLOWED_METHODS.contains(&upper.as_str()) {
        Method::from_bytes(upper.as_bytes()).unwrap_or(Method::POST)
    } else {
        Method::POST
    }
}

/// GET query parameters: every `params` entry plus `input` unless `params`
/// already sets it.
pub fn query_pairs(payload: &Map<String, Value>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = payload
        .get("params")
        .and_then(Value::as_object)
        .map(|params| {
            params
                .iter()
                .map(|(k, v)| (k.clone(), scalar_text(v)))
                .collect()
        })
        .unwrap_or_default();
    if let Some(input) = payload.get("input") {
        if !pairs.iter().any(|(k, _)| k == "input") {
            pairs.push(("input".to_string(), scalar_text(input)));
        }
    }
    pairs
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// The `request` block echoed in every output.
fn request_info(method: &Method, url: &str, tool: &str, fallback: bool) -> Value {
    let mut info = json!({"method": method.as_str(), "url": url, "tool": tool});
    if fallback {
        info["fallback"] = json!("trailing-slash");
    }
    info
}

/// `{request, response}` when the body is JSON, `{request, response_text}`
/// otherwise.
fn success_text(resp: &RawResponse, request: Value) -> String {
    let body = match resp.json() {
        Ok(json) => json!({"request": request, "response": json}),
        Err(_) => json!({"request": request, "response_text": resp.body}),
    };
    pretty(&body)
}

/// `ToolInvoker` calls the tool described by a selection object with the
/// user's input and optional parameters.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolInvoker {
    /// Static selection used when nothing is connected to `selection_json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_json: Option<Value>,
    /// Extra parameters as a JSON string, e.g. `{"top_k":3}`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub params_json: String,
    #[serde(default = "default_method")]
    pub method_override: String,
    /// Send a GET with `params` and `input` as query parameters.
    #[serde(default)]
    pub force_get_query: bool,

    #[serde(skip)]
    #[schemars(skip)]
    instance: InstanceId,
}

fn default_method() -> String {
    "POST".to_string()
}

impl Default for ToolInvoker {
    fn default() -> Self {
        Self {
            selection_json: None,
            params_json: String::new(),
            method_override: default_method(),
            force_get_query: false,
            instance: InstanceId::default(),
        }
    }
}

impl PartialEq for ToolInvoker {
    fn eq(&self, other: &Self) -> bool {
        self.selection_json == other.selection_json
            && self.params_json == other.params_json
            && self.method_override == other.method_override
            && self.force_get_query == other.force_get_query
    }
}

impl ToolInvoker {
    pub fn with_selection(mut self, selection: Value) -> Self {
        self.selection_json = Some(selection);
        self
    }

    pub fn with_params(mut self, params_json: impl Into<String>) -> Self {
        self.params_json = params_json.into();
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method_override = method.into();
        self
    }

    pub fn with_get_query(mut self, force_get_query: bool) -> Self {
        self.force_get_query = force_get_query;
        self
    }

    fn selection_value(&self, inputs: &Inputs) -> Option<PortValue> {
        inputs
            .get(SELECTION_INPUT)
            .cloned()
            .or_else(|| self.selection_json.clone().map(PortValue::from))
    }

    fn effective_method(&self) -> Method {
        if self.force_get_query {
            Method::GET
        } else {
            parse_method(&self.method_override)
        }
    }

    /// Selection `name`, empty when the selection cannot be read.
    pub fn model_id(&self, inputs: &Inputs) -> String {
        extract_selection(self.selection_value(inputs).as_ref())
            .ok()
            .and_then(|obj| obj.get("name").map(scalar_text))
            .unwrap_or_default()
    }

    /// Performs the call once per instance and invocation context.
    #[tracing::instrument(name = "tool_invoker_invoke", skip_all)]
    async fn invoke(&self, inputs: &Inputs, context: &NodeContext) -> Result<String, NodeError> {
        context
            .memoize(&self.instance, move || async move {
                let selection = match Selection::from_port(self.selection_value(inputs).as_ref()) {
                    Ok(selection) => selection,
                    Err(err) => {
                        return context.degrade(
                            err.to_payload().to_string(),
                            NodeError::InvalidInput(err.to_string()),
                        );
                    }
                };

                let mut payload = Map::new();
                if let Some(text) = inputs.text(USER_INPUT) {
                    payload.insert("input".to_string(), Value::String(text));
                }
                let params = self.params_json.trim();
                if !params.is_empty() {
                    match serde_json::from_str::<Value>(params) {
                        Ok(value) => {
                            payload.insert("params".to_string(), value);
                        }
                        Err(e) => {
                            return context.degrade(
                                json!({"error": "params_json not valid JSON"}).to_string(),
                                NodeError::InvalidInput(format!("params_json: {e}")),
                            );
                        }
                    }
                }

                let method = self.effective_method();
                let url = join_url(&selection.base_url, &selection.url_path, TOOLS_PREFIX);
                call_tool(context, method, &url, &selection.name, payload).await
            })
            .await
    }
}

/// One call, plus exactly one trailing-slash retry on 404.
async fn call_tool(
    context: &NodeContext,
    method: Method,
    url: &str,
    tool: &str,
    payload: Map<String, Value>,
) -> Result<String, NodeError> {
    let query = query_pairs(&payload);
    let body = Value::Object(payload);
    let timeout = context.settings().tool_timeout();
    let client = context.client();

    let first = match client.call(method.clone(), url, &body, &query, timeout).await {
        Ok(resp) => resp,
        Err(err) => {
            let text = pretty(&json!({
                "error": "request_failed",
                "request": request_info(&method, url, tool, false),
                "detail": err.to_string(),
            }));
            return context.degrade(text, err.into());
        }
    };

    if first.is_success() {
        info!(tool, url, status = first.status, "tool call succeeded");
        return Ok(success_text(&first, request_info(&method, url, tool, false)));
    }

    if first.status == 404 && !url.ends_with('/') {
        let retry_url = format!("{url}/");
        warn!(url, %retry_url, "tool returned 404, retrying with trailing slash");
        let second = client
            .call(method.clone(), &retry_url, &body, &query, timeout)
            .await;
        let second_error = match second {
            Ok(resp) if resp.is_success() => {
                return Ok(success_text(&resp, request_info(&method, &retry_url, tool, true)));
            }
            Ok(resp) => format!("{} returned HTTP {}", resp.url, resp.status),
            Err(err) => err.to_string(),
        };
        let text = pretty(&json!({
            "error": "HTTP 404 and trailing-slash fallback failed",
            "first_try": {"method": method.as_str(), "url": url, "status": first.status},
            "second_try": {"url": retry_url, "error": second_error},
        }));
        return context.degrade(
            text,
            NodeError::ExecutionFailed(format!("{url} returned 404 and {second_error}")),
        );
    }

    let detail = format!("{} returned HTTP {}", first.url, first.status);
    let text = pretty(&json!({
        "error": "http_error",
        "status": first.status,
        "request": request_info(&method, url, tool, false),
        "detail": detail,
        "body_preview": first.body,
    }));
    context.degrade(text, NodeError::ExecutionFailed(detail))
}

#[typetag::serde(name = "tool_invoker")]
#[async_trait]
impl NodeType for ToolInvoker {
    fn type_name(&self) -> String {
        "tool_invoker".to_string()
    }

    fn schema(&self) -> schemars::Schema {
        schemars::schema_for!(ToolInvoker)
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
            .with("params_json", Field::text(self.params_json.clone()))
            .with("method_override", Field::text(self.method_override.clone()))
            .with("force_get_query", Field::boolean(self.force_get_query))
    }

    /// Nothing here is dynamic; the config comes back as given.
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
        context: &NodeContext,
    ) -> Result<Message, NodeError> {
        match port {
            CHAT_OUTPUT => Ok(Message::from_sender(self.invoke(inputs, context).await?, "ToolInvoker")),
            TEXT_OUTPUT => Ok(Message::new(self.invoke(inputs, context).await?)),
            MODEL_ID_OUTPUT => Ok(Message::new(self.model_id(inputs))),
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
    use crate::config::{FailureMode, Settings};

    #[test]
    fn method_validation() {
        assert_eq!(parse_method("get"), Method::GET);
        assert_eq!(parse_method(" patch "), Method::PATCH);
        assert_eq!(parse_method("TRACE"), Method::POST);
        assert_eq!(parse_method(""), Method::POST);

        let forced = ToolInvoker {
            method_override: "DELETE".into(),
            force_get_query: true,
            ..ToolInvoker::default()
        };
        assert_eq!(forced.effective_method(), Method::GET);
    }

    #[test]
    fn query_merges_input_unless_params_set_it() {
        let mut payload = Map::new();
        payload.insert("input".into(), json!("hello"));
        payload.insert("params".into(), json!({"top_k": 3, "lang": "ko"}));
        assert_eq!(
            query_pairs(&payload),
            vec![
                ("top_k".to_string(), "3".to_string()),
                ("lang".to_string(), "ko".to_string()),
                ("input".to_string(), "hello".to_string()),
            ]
        );

        payload.insert("params".into(), json!({"input": "override"}));
        assert_eq!(query_pairs(&payload), vec![("input".to_string(), "override".to_string())]);
    }

    #[test]
    fn request_info_marks_fallback() {
        let info = request_info(&Method::POST, "http://h/tools/a/", "a", true);
        assert_eq!(
            info,
            json!({"method": "POST", "url": "http://h/tools/a/", "tool": "a", "fallback": "trailing-slash"})
        );
    }

    #[tokio::test]
    async fn missing_selection_is_an_error_object() {
        let invoker = ToolInvoker::default();
        let ctx = NodeContext::new(Settings::default());
        let msg = invoker.output(CHAT_OUTPUT, &Inputs::new(), &ctx).await.unwrap();
        let body: Value = serde_json::from_str(msg.text()).unwrap();
        assert_eq!(body["error"], json!("selection_json is empty"));
        assert_eq!(msg.sender(), Some("ToolInvoker"));
    }

    #[tokio::test]
    async fn missing_target_reports_selection_and_keeps_model_id() {
        let invoker = ToolInvoker::default();
        let inputs = Inputs::new().with(SELECTION_INPUT, r#"{"name":"search"}"#);
        let ctx = NodeContext::new(Settings::default());
        let msg = invoker.output(TEXT_OUTPUT, &inputs, &ctx).await.unwrap();
        let body: Value = serde_json::from_str(msg.text()).unwrap();
        assert_eq!(body["error"], json!("missing base_url or url_path in selection_json"));
        assert_eq!(body["selection"]["name"], json!("search"));

        let id = invoker.output(MODEL_ID_OUTPUT, &inputs, &ctx).await.unwrap();
        assert_eq!(id.text(), "search");
    }

    #[tokio::test]
    async fn invalid_params_are_reported() {
        let invoker = ToolInvoker {
            params_json: "{not json".into(),
            ..ToolInvoker::default()
        };
        let inputs = Inputs::new().with(
            SELECTION_INPUT,
            r#"{"name":"a","url_path":"/a","base_url":"http://127.0.0.1:1/tools"}"#,
        );
        let ctx = NodeContext::new(Settings::default());
        let msg = invoker.output(TEXT_OUTPUT, &inputs, &ctx).await.unwrap();
        assert_eq!(msg.text(), r#"{"error":"params_json not valid JSON"}"#);
    }

    #[tokio::test]
    async fn strict_mode_surfaces_errors() {
        let invoker = ToolInvoker::default();
        let ctx = NodeContext::new(Settings {
            failure_mode: FailureMode::Strict,
            ..Settings::default()
        });
        let err = invoker
            .output(CHAT_OUTPUT, &Inputs::new(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn unreachable_tool_is_request_failed() {
        let invoker = ToolInvoker::default();
        let inputs = Inputs::new().with(
            SELECTION_INPUT,
            json!({"name": "a", "url_path": "/a", "base_url": "http://127.0.0.1:1/tools"}),
        );
        let ctx = NodeContext::new(Settings::default());
        let msg = invoker.output(TEXT_OUTPUT, &inputs, &ctx).await.unwrap();
        let body: Value = serde_json::from_str(msg.text()).unwrap();
        assert_eq!(body["error"], json!("request_failed"));
        assert_eq!(body["request"]["url"], json!("http://127.0.0.1:1/tools/a"));
    }
}
