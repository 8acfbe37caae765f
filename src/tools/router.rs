use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    build_config::{BuildConfig, ConfigUpdate, Field},
    message::{Message, PortValue, extract_object},
    node::{Inputs, NodeContext, NodeError, NodeType, OutputSpec},
};

pub const TOOL_MESSAGE: &str = "tool_message";

pub const ORIGINAL_MESSAGE: &str = "original_message";
pub const PROMPT_VALUE_MESSAGE: &str = "prompt_value_message";

const KEY_FIELD: &str = "key_for_prompt";
/// Offered when the incoming object has no keys at all.
pub const FALLBACK_KEYS: [&str; 4] = ["name", "url_path", "description", "base_url"];

/// `"name"` when present, otherwise the first key.
pub fn default_key(keys: &[String]) -> String {
    if keys.iter().any(|k| k == "name") {
        "name".to_string()
    } else {
        keys.first().cloned().unwrap_or_default()
    }
}

/// Renders one value of the object as text. Missing keys give an empty
/// string; nested values are serialised as JSON.
pub fn field_text(obj: &Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// `ToolRouter` passes a selection object through unchanged or forwards the
/// value under one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolRouter {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_for_prompt: String,
    /// Compact output for `original_message`; pretty-printed when false.
    #[serde(default = "minify_default")]
    pub minify_original: bool,
}

fn minify_default() -> bool {
    true
}

impl Default for ToolRouter {
    fn default() -> Self {
        Self {
            key_for_prompt: String::new(),
            minify_original: true,
        }
    }
}

impl ToolRouter {
    pub fn with_key(mut self, key: &str) -> Self {
        self.key_for_prompt = key.to_string();
        self
    }

    fn incoming(inputs: &Inputs) -> Map<String, Value> {
        inputs.get(TOOL_MESSAGE).map(extract_object).unwrap_or_default()
    }

    pub fn original_text(&self, obj: &Map<String, Value>) -> Result<String, NodeError> {
        let rendered = if self.minify_original {
            serde_json::to_string(obj)
        } else {
            serde_json::to_string_pretty(obj)
        };
        rendered.map_err(|e| NodeError::Internal(e.to_string()))
    }

    pub fn prompt_value(&self, obj: &Map<String, Value>) -> String {
        let key = match self.key_for_prompt.trim() {
            "" => default_key(&obj.keys().cloned().collect::<Vec<_>>()),
            key => key.to_string(),
        };
        field_text(obj, &key)
    }
}

#[typetag::serde(name = "tool_router")]
#[async_trait]
impl NodeType for ToolRouter {
    fn type_name(&self) -> String {
        "tool_router".to_string()
    }

    fn schema(&self) -> schemars::Schema {
        schemars::schema_for!(ToolRouter)
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![
            OutputSpec::message(ORIGINAL_MESSAGE),
            OutputSpec::message(PROMPT_VALUE_MESSAGE),
        ]
    }

    fn build_config(&self) -> BuildConfig {
        BuildConfig::new()
            .with(TOOL_MESSAGE, Field::text(""))
            .with(KEY_FIELD, Field::dropdown(Vec::new(), self.key_for_prompt.clone()))
            .with("minify_original", Field::boolean(self.minify_original))
    }

    /// Offers the keys of the incoming object, resetting the selection when
    /// the current key disappeared. Purely local, never fails.
    async fn update_build_config(
        &self,
        update: ConfigUpdate,
        _context: &NodeContext,
    ) -> Result<BuildConfig, NodeError> {
        let candidate = if update.is_change_of(TOOL_MESSAGE) {
            PortValue::from(update.field_value.clone())
        } else {
            PortValue::Text(update.config.text(TOOL_MESSAGE).unwrap_or_default().to_string())
        };
        let mut keys: Vec<String> = extract_object(&candidate).keys().cloned().collect();
        if keys.is_empty() {
            keys = FALLBACK_KEYS.iter().map(|k| k.to_string()).collect();
        }
        let default = default_key(&keys);

        let mut config = update.config;
        config.set_dropdown(KEY_FIELD, keys, &default);
        Ok(config)
    }

    async fn output(
        &self,
        port: &str,
        inputs: &Inputs,
        _context: &NodeContext,
    ) -> Result<Message, NodeError> {
        let obj = Self::incoming(inputs);
        match port {
            ORIGINAL_MESSAGE => Ok(Message::from_sender(self.original_text(&obj)?, "AI")),
            PROMPT_VALUE_MESSAGE => Ok(Message::from_sender(self.prompt_value(&obj), "AI")),
            other => Err(NodeError::UnknownOutput(other.to_string())),
        }
    }

    fn clone_box(&self) -> Box<dyn NodeType> {
        Box::new(self.clone())
    }
}
