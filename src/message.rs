use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The message passed between nodes: a text body plus an optional structured
/// `data` object.
#[derive(Debug, Clone, PartialEq, JsonSchema, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    #[serde(default = "Message::new_id")]
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
}

impl Message {
    fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Self::new_id(),
            session_id: None,
            text: text.into(),
            data: None,
            sender: None,
        }
    }

    pub fn from_sender(text: impl Into<String>, sender: &str) -> Self {
        Self::new(text).with_sender(sender)
    }

    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn id(&self) -> String {
        self.id.clone()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn data(&self) -> Option<&Map<String, Value>> {
        self.data.as_ref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }
}

/// A value arriving on an input port. Upstream nodes send `Message`s, users
/// type `Text`, and anything else is kept as raw `Json`.
#[derive(Debug, Clone, PartialEq, JsonSchema, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Message(Message),
    Text(String),
    Json(Value),
}

impl From<Message> for PortValue {
    fn from(msg: Message) -> Self {
        PortValue::Message(msg)
    }
}

impl From<&str> for PortValue {
    fn from(text: &str) -> Self {
        PortValue::Text(text.to_string())
    }
}

impl From<String> for PortValue {
    fn from(text: String) -> Self {
        PortValue::Text(text)
    }
}

impl From<Value> for PortValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => PortValue::Text(s),
            other => serde_json::from_value::<Message>(other.clone())
                .map(PortValue::Message)
                .unwrap_or(PortValue::Json(other)),
        }
    }
}

impl PortValue {
    /// Best plain-text rendering: message text (or `data.text`), strings as
    /// is, numbers via `to_string`, objects and arrays as JSON.
    pub fn as_text(&self) -> String {
        match self {
            PortValue::Message(msg) => {
                if !msg.text().is_empty() {
                    return msg.text().to_string();
                }
                msg.data()
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            }
            PortValue::Text(text) => text.clone(),
            PortValue::Json(Value::Null) => String::new(),
            PortValue::Json(Value::String(s)) => s.clone(),
            PortValue::Json(Value::Number(n)) => n.to_string(),
            PortValue::Json(Value::Bool(b)) => b.to_string(),
            PortValue::Json(other) => other.to_string(),
        }
    }
}

/// Parses `text` as a JSON object. Arrays and scalars are rejected.
pub fn parse_object(text: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("expected a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}

/// Pulls a JSON object out of a message-like value. Tried in order: the
/// message text parsed as JSON, the message `data` object, a raw string
/// parsed as JSON, a raw mapping. Non-JSON text ends up as `{"value": text}`.
pub fn extract_object(value: &PortValue) -> Map<String, Value> {
    match value {
        PortValue::Message(msg) => {
            let text = msg.text().trim();
            if !text.is_empty() {
                return parse_object(text).unwrap_or_else(|_| wrap_value(msg.text()));
            }
            msg.data().cloned().unwrap_or_default()
        }
        PortValue::Text(text) | PortValue::Json(Value::String(text)) => {
            if text.trim().is_empty() {
                return Map::new();
            }
            parse_object(text).unwrap_or_else(|_| wrap_value(text))
        }
        PortValue::Json(Value::Object(map)) => map.clone(),
        PortValue::Json(_) => Map::new(),
    }
}

fn wrap_value(text: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("value".to_string(), Value::String(text.to_string()));
    map
}
