//! Typed edit-time configuration exchanged between a node and whatever UI
//! renders it. A node receives a [`ConfigUpdate`] by value and hands back the
//! new [`BuildConfig`].

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One rendered input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Field {
    Text { value: String },
    Bool { value: bool },
    Dropdown { options: Vec<String>, value: String },
}

impl Field {
    pub fn text(value: impl Into<String>) -> Self {
        Field::Text { value: value.into() }
    }

    pub fn boolean(value: bool) -> Self {
        Field::Bool { value }
    }

    pub fn dropdown(options: Vec<String>, value: impl Into<String>) -> Self {
        Field::Dropdown {
            options,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct BuildConfig {
    fields: BTreeMap<String, Field>,
}

impl BuildConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, field: Field) -> Self {
        self.fields.insert(name.to_string(), field);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(Field::Text { value }) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        match self.fields.get(name) {
            Some(Field::Bool { value }) => Some(*value),
            _ => None,
        }
    }

    /// `(options, value)` of a dropdown.
    pub fn dropdown(&self, name: &str) -> Option<(&[String], &str)> {
        match self.fields.get(name) {
            Some(Field::Dropdown { options, value }) => Some((options.as_slice(), value.as_str())),
            _ => None,
        }
    }

    /// Only touches fields that exist.
    pub fn reset_bool(&mut self, name: &str) {
        if let Some(Field::Bool { value }) = self.fields.get_mut(name) {
            *value = false;
        }
    }

    /// Replaces the dropdown options and, when the current value is empty or
    /// no longer offered, selects `default`.
    pub fn set_dropdown(&mut self, name: &str, options: Vec<String>, default: &str) {
        let current = match self.fields.get(name) {
            Some(Field::Dropdown { value, .. }) => value.clone(),
            _ => String::new(),
        };
        let value = if current.is_empty() || !options.contains(&current) {
            default.to_string()
        } else {
            current
        };
        self.fields
            .insert(name.to_string(), Field::Dropdown { options, value });
    }
}

/// A request to recompute a node's build config after `field_name` changed
/// to `field_value`. `field_name == None` means the initial render.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigUpdate {
    pub config: BuildConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    #[serde(default)]
    pub field_value: Value,
}

impl ConfigUpdate {
    pub fn initial(config: BuildConfig) -> Self {
        Self {
            config,
            field_name: None,
            field_value: Value::Null,
        }
    }

    pub fn changed(config: BuildConfig, field_name: &str, field_value: Value) -> Self {
        Self {
            config,
            field_name: Some(field_name.to_string()),
            field_value,
        }
    }

    pub fn is_change_of(&self, name: &str) -> bool {
        self.field_name.as_deref() == Some(name)
    }

    /// The text value of `name`, taking the pending change into account.
    pub fn effective_text(&self, name: &str) -> String {
        if self.is_change_of(name) {
            return match &self.field_value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
        }
        self.config.text(name).unwrap_or_default().to_string()
    }

    /// The boolean value of `name`, taking the pending change into account.
    pub fn effective_bool(&self, name: &str) -> bool {
        if self.is_change_of(name) {
            return match &self.field_value {
                Value::Bool(b) => *b,
                Value::String(s) => matches!(s.as_str(), "true" | "1" | "yes"),
                _ => false,
            };
        }
        self.config.boolean(name).unwrap_or(false)
    }
}
