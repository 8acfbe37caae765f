//! The record handed from the tool picker, through the router, to the
//! invoker, and the lenient extraction of it from whatever arrives on a port.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::message::PortValue;

/// Which tool to call and where it is mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Selection {
    pub name: String,
    pub url_path: String,
    #[serde(default)]
    pub description: String,
    /// Base the path is joined to, already including the `/tools` mount.
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SelectionError {
    /// The input could not be read as a JSON object at all.
    #[error("{message}")]
    Unreadable { message: String, raw_type: &'static str },
    /// An object arrived but it cannot be called.
    #[error("missing base_url or url_path in selection_json")]
    MissingTarget { selection: Map<String, Value> },
    #[error("missing name in selection_json")]
    MissingName { selection: Map<String, Value> },
}

impl SelectionError {
    fn unreadable(message: impl Into<String>, raw_type: &'static str) -> Self {
        SelectionError::Unreadable {
            message: message.into(),
            raw_type,
        }
    }

    /// The JSON object the invoker prints for this failure.
    pub fn to_payload(&self) -> Value {
        match self {
            SelectionError::Unreadable { message, raw_type } => {
                serde_json::json!({"error": message, "raw_type": raw_type})
            }
            SelectionError::MissingTarget { selection }
            | SelectionError::MissingName { selection } => serde_json::json!({
                "error": self.to_string(),
                "selection": selection,
            }),
        }
    }
}

impl TryFrom<Map<String, Value>> for Selection {
    type Error = SelectionError;

    fn try_from(obj: Map<String, Value>) -> Result<Self, Self::Error> {
        let base_url = string_field(&obj, "base_url");
        let url_path = string_field(&obj, "url_path");
        if base_url.is_empty() || url_path.is_empty() {
            return Err(SelectionError::MissingTarget { selection: obj });
        }
        let name = string_field(&obj, "name");
        if name.is_empty() {
            return Err(SelectionError::MissingName { selection: obj });
        }
        Ok(Selection {
            name,
            url_path,
            description: string_field(&obj, "description"),
            base_url,
        })
    }
}

impl Selection {
    /// Extracts and validates a selection from a port value.
    pub fn from_port(value: Option<&PortValue>) -> Result<Self, SelectionError> {
        Selection::try_from(extract_selection(value)?)
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        None | Some(Value::Null) => String::new(),
        Some(other) => other.to_string(),
    }
}

fn parse_selection_str(text: &str) -> Result<Map<String, Value>, SelectionError> {
    let text = if text.trim().is_empty() { "{}" } else { text };
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(SelectionError::unreadable(
            "selection_json must be a JSON object",
            "text",
        )),
        Err(e) => Err(SelectionError::unreadable(format!("invalid JSON: {e}"), "text")),
    }
}

/// Pulls the selection object out of a port value. For messages the text is
/// tried first, then `data` when it already looks like a selection, then a
/// JSON string in `data.text`.
pub fn extract_selection(value: Option<&PortValue>) -> Result<Map<String, Value>, SelectionError> {
    let Some(value) = value else {
        return Err(SelectionError::unreadable("selection_json is empty", "none"));
    };
    match value {
        PortValue::Message(msg) => {
            if !msg.text().trim().is_empty() {
                if let Ok(obj) = parse_selection_str(msg.text()) {
                    return Ok(obj);
                }
            }
            if let Some(data) = msg.data() {
                let looks_like_selection = ["base_url", "url_path", "name"]
                    .iter()
                    .any(|k| data.get(*k).is_some_and(is_truthy));
                if looks_like_selection {
                    return Ok(data.clone());
                }
                if let Some(inner) = data.get("text").and_then(Value::as_str) {
                    if !inner.trim().is_empty() {
                        if let Ok(obj) = parse_selection_str(inner) {
                            return Ok(obj);
                        }
                    }
                }
            }
            Err(SelectionError::unreadable(
                "Message does not contain valid selection JSON",
                "message",
            ))
        }
        PortValue::Text(text) | PortValue::Json(Value::String(text)) => parse_selection_str(text),
        PortValue::Json(Value::Object(map)) => Ok(map.clone()),
        PortValue::Json(other) => Err(SelectionError::unreadable(
            "selection_json must be Message, JSON string, or object",
            json_type(other),
        )),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(_) => true,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "text",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
