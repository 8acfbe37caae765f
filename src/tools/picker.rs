use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    build_config::{BuildConfig, ConfigUpdate, Field},
    endpoint::{TOOLS_PREFIX, normalize_base, normalize_or_default},
    message::Message,
    node::{Inputs, InstanceId, NodeContext, NodeError, NodeType, OutputSpec},
    options::{AcceptAll, OptionPair, OptionSet, OptionSource, resolve_options},
    tools::selection::Selection,
};

/// Dropdown value shown before the first successful refresh.
pub const TOOLS_PLACEHOLDER: &str = "(click Refresh tools now)";

pub const PICKED_TOOL: &str = "picked_tool";
pub const PICKED_TOOL_TEXT: &str = "picked_tool_text";

const TOOL_FIELD: &str = "selected_tool";
const REFRESH_FIELDS: [&str; 3] = ["backend_base_url", "force_https", "refresh_now"];

/// One entry of the `/tools` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ToolEntry {
    pub name: String,
    pub url_path: String,
    pub description: String,
}

impl ToolEntry {
    fn from_value(item: &Value) -> Option<Self> {
        let field = |key: &str| {
            item.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string()
        };
        let entry = ToolEntry {
            name: field("name"),
            url_path: field("url_path"),
            description: field("description"),
        };
        (!entry.name.is_empty() || !entry.url_path.is_empty()).then_some(entry)
    }

    /// What the dropdown shows: the name, or the path for unnamed tools.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.url_path
        } else {
            &self.name
        }
    }

    fn matches(&self, selected: &str) -> bool {
        let lower = selected.to_lowercase();
        let name = self.name.trim();
        let path = self.url_path.trim();
        selected == name
            || selected == path
            || lower == name.to_lowercase()
            || lower == path.to_lowercase()
    }
}

/// The listing may be `{tools: [...]}`, a bare array or a single tool.
/// Entries come back in dropdown order; a repeated label keeps its last entry.
pub fn normalize_tools(payload: &Value) -> Vec<ToolEntry> {
    let items: Vec<Value> = match payload {
        Value::Object(obj) if obj.contains_key("tools") => obj
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    let entries: Vec<ToolEntry> = items.iter().filter_map(ToolEntry::from_value).collect();
    let resolved = resolve_options(&items, &AcceptAll, |item| {
        ToolEntry::from_value(item).map(|t| OptionPair::new(t.label(), t.url_path.clone()))
    });
    resolved
        .pairs()
        .iter()
        .filter_map(|pair| {
            entries
                .iter()
                .rev()
                .find(|t| t.label() == pair.label && t.url_path == pair.id)
                .cloned()
        })
        .collect()
}

/// Exact or case-insensitive match on name or path. An empty or unknown
/// selection gets the first tool.
pub fn pick_match<'a>(tools: &'a [ToolEntry], selected: &str) -> Option<&'a ToolEntry> {
    let selected = selected.trim();
    if selected.is_empty() {
        return tools.first();
    }
    tools
        .iter()
        .find(|t| t.matches(selected))
        .or_else(|| tools.first())
}

pub async fn fetch_tools(base: &str, context: &NodeContext) -> Result<Vec<ToolEntry>, NodeError> {
    let url = format!("{base}{TOOLS_PREFIX}");
    let payload = context
        .client()
        .get_json(&url, context.settings().discovery_timeout())
        .await?;
    Ok(normalize_tools(&payload))
}

/// `ToolPicker` lists the tools published under `{base}/tools` and emits the
/// chosen one as a selection JSON object.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolPicker {
    /// Tool server base URL. Unset means `COE_TOOLS_URL`; an explicit empty
    /// string is reported as an error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_base_url: Option<String>,
    #[serde(default)]
    pub force_https: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selected_tool: String,

    #[serde(skip)]
    #[schemars(skip)]
    tools: Arc<RwLock<Option<Vec<ToolEntry>>>>,
    #[serde(skip)]
    #[schemars(skip)]
    instance: InstanceId,
}

impl Default for ToolPicker {
    fn default() -> Self {
        Self {
            backend_base_url: None,
            force_https: false,
            selected_tool: String::new(),
            tools: Arc::default(),
            instance: InstanceId::default(),
        }
    }
}

impl PartialEq for ToolPicker {
    fn eq(&self, other: &Self) -> bool {
        self.backend_base_url == other.backend_base_url
            && self.force_https == other.force_https
            && self.selected_tool == other.selected_tool
    }
}

impl ToolPicker {
    pub fn new(base: &str, selected: &str) -> Self {
        Self {
            backend_base_url: Some(base.to_string()),
            selected_tool: selected.to_string(),
            ..Self::default()
        }
    }

    pub fn with_force_https(mut self, force_https: bool) -> Self {
        self.force_https = force_https;
        self
    }

    fn base_url(&self, context: &NodeContext) -> String {
        let raw = self
            .backend_base_url
            .as_deref()
            .unwrap_or(&context.settings().tools_url);
        normalize_base(raw, self.force_https)
    }

    /// The dropdown options for a listing: labels, de-duplicated and sorted.
    pub fn options_for(tools: &[ToolEntry]) -> OptionSet {
        let pairs = tools
            .iter()
            .map(|t| OptionPair::new(t.label(), t.url_path.clone()))
            .collect();
        OptionSet::from_pairs(pairs, OptionSource::Remote)
    }

    pub async fn cached_tools(&self) -> Option<Vec<ToolEntry>> {
        self.tools.read().await.clone()
    }

    #[tracing::instrument(name = "tool_picker_refresh", skip(self, context))]
    pub async fn refresh_tools(
        &self,
        base: &str,
        context: &NodeContext,
    ) -> Result<Vec<ToolEntry>, NodeError> {
        let tools = fetch_tools(base, context).await?;
        info!(count = tools.len(), base, "tools loaded");
        *self.tools.write().await = Some(tools.clone());
        Ok(tools)
    }

    /// Selection JSON for the configured tool, or an error object.
    #[tracing::instrument(name = "tool_picker_pick", skip_all)]
    async fn pick(&self, context: &NodeContext) -> Result<String, NodeError> {
        context
            .memoize(&self.instance, move || async move {
                let base = self.base_url(context);
                if base.is_empty() {
                    return context.degrade(
                        json!({"error": "base_url is empty"}).to_string(),
                        NodeError::InvalidInput("base_url is empty".into()),
                    );
                }

                let cached = self.tools.read().await.clone().filter(|t| !t.is_empty());
                let tools = match cached {
                    Some(tools) => tools,
                    None => match self.refresh_tools(&base, context).await {
                        Ok(tools) => tools,
                        Err(err) => {
                            let fallback = json!({
                                "error": "failed to fetch tools",
                                "detail": err.to_string(),
                            });
                            return context.degrade(fallback.to_string(), err);
                        }
                    },
                };

                let Some(entry) = pick_match(&tools, &self.selected_tool) else {
                    let fallback = json!({"error": "tool not found", "selected": self.selected_tool});
                    return context.degrade(
                        fallback.to_string(),
                        NodeError::ExecutionFailed(format!("no tools listed under {base}")),
                    );
                };
                let selection = Selection {
                    name: entry.name.clone(),
                    url_path: entry.url_path.clone(),
                    description: entry.description.clone(),
                    base_url: format!("{base}{TOOLS_PREFIX}"),
                };
                serde_json::to_string(&selection).map_err(|e| NodeError::Internal(e.to_string()))
            })
            .await
    }
}

#[typetag::serde(name = "tool_picker")]
#[async_trait]
impl NodeType for ToolPicker {
    fn type_name(&self) -> String {
        "tool_picker".to_string()
    }

    fn schema(&self) -> schemars::Schema {
        schemars::schema_for!(ToolPicker)
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![
            OutputSpec::message(PICKED_TOOL),
            OutputSpec::text(PICKED_TOOL_TEXT),
        ]
    }

    fn build_config(&self) -> BuildConfig {
        BuildConfig::new()
            .with(
                "backend_base_url",
                Field::text(self.backend_base_url.clone().unwrap_or_default()),
            )
            .with(TOOL_FIELD, Field::dropdown(Vec::new(), self.selected_tool.clone()))
            .with("refresh_now", Field::boolean(false))
            .with("force_https", Field::boolean(self.force_https))
    }

    #[tracing::instrument(name = "tool_picker_update_build_config", skip_all, fields(field = ?update.field_name))]
    async fn update_build_config(
        &self,
        update: ConfigUpdate,
        context: &NodeContext,
    ) -> Result<BuildConfig, NodeError> {
        let base = normalize_or_default(
            &update.effective_text("backend_base_url"),
            &context.settings().tools_url,
            update.effective_bool("force_https"),
        );
        let (has_options, current) = match update.config.dropdown(TOOL_FIELD) {
            Some((options, value)) => (!options.is_empty(), value.to_string()),
            None => (false, String::new()),
        };
        let triggered = update
            .field_name
            .as_deref()
            .is_some_and(|name| REFRESH_FIELDS.contains(&name));
        let never_loaded = self.tools.read().await.is_none();
        let should_refresh = never_loaded || triggered || !has_options || current == TOOLS_PLACEHOLDER;

        if !should_refresh || base.is_empty() {
            return Ok(update.config);
        }

        let mut config = update.config;
        match self.refresh_tools(&base, context).await {
            Ok(tools) => {
                let labels = Self::options_for(&tools).labels();
                let default = labels.first().cloned().unwrap_or_default();
                config.set_dropdown(TOOL_FIELD, labels, &default);
            }
            Err(err) if context.is_strict() => return Err(err),
            Err(err) => {
                warn!(error = %err, base, "tool fetch failed, clearing options");
                config.set_dropdown(TOOL_FIELD, Vec::new(), "");
            }
        }
        config.reset_bool("refresh_now");
        Ok(config)
    }

    async fn output(
        &self,
        port: &str,
        _inputs: &Inputs,
        context: &NodeContext,
    ) -> Result<Message, NodeError> {
        match port {
            PICKED_TOOL => Ok(Message::from_sender(self.pick(context).await?, "ToolPicker")),
            PICKED_TOOL_TEXT => Ok(Message::new(self.pick(context).await?)),
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

    fn entry(name: &str, path: &str) -> ToolEntry {
        ToolEntry {
            name: name.into(),
            url_path: path.into(),
            description: String::new(),
        }
    }

    #[test]
    fn normalize_accepts_all_listing_shapes() {
        let wrapped = json!({"tools": [{"name": "b", "url_path": "/b"}, {"name": "A", "url_path": "/a"}]});
        let tools = normalize_tools(&wrapped);
        assert_eq!(tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(), vec!["A", "b"]);

        let bare = json!([{"url_path": "/only-path"}, {"description": "skipped"}, 5]);
        let tools = normalize_tools(&bare);
        assert_eq!(tools, vec![entry("", "/only-path")]);
        assert_eq!(tools[0].label(), "/only-path");

        let single = json!({"name": "solo", "url_path": "/solo"});
        assert_eq!(normalize_tools(&single), vec![entry("solo", "/solo")]);

        assert!(normalize_tools(&json!({"tools": null})).is_empty());
    }

    #[test]
    fn listing_goes_through_the_option_resolver() {
        let listing = json!({"tools": [
            {"name": "search", "url_path": "/search-v1", "description": "old"},
            {"name": "Zeta", "url_path": "/zeta"},
            "junk",
            {"name": "search", "url_path": "/search-v2", "description": "new"},
            {"name": "alpha", "url_path": "/alpha"}
        ]});
        let tools = normalize_tools(&listing);
        let labels: Vec<&str> = tools.iter().map(ToolEntry::label).collect();
        assert_eq!(labels, vec!["alpha", "search", "Zeta"]);
        assert_eq!(tools[1].url_path, "/search-v2");
        assert_eq!(tools[1].description, "new");
        assert_eq!(ToolPicker::options_for(&tools).labels(), labels);
    }

    #[test]
    fn pick_match_rules() {
        let tools = vec![entry("Search", "/search"), entry("sub_graph", "/sub_graph")];
        assert_eq!(pick_match(&tools, "sub_graph").map(|t| t.name.as_str()), Some("sub_graph"));
        assert_eq!(pick_match(&tools, "SEARCH").map(|t| t.name.as_str()), Some("Search"));
        assert_eq!(pick_match(&tools, "/sub_graph").map(|t| t.name.as_str()), Some("sub_graph"));
        assert_eq!(pick_match(&tools, "").map(|t| t.name.as_str()), Some("Search"));
        assert_eq!(pick_match(&tools, "missing").map(|t| t.name.as_str()), Some("Search"));
        assert!(pick_match(&[], "x").is_none());
    }

    #[tokio::test]
    async fn empty_base_is_reported() {
        let picker = ToolPicker::new("   ", "");
        let ctx = NodeContext::new(Settings::default());
        let msg = picker.output(PICKED_TOOL_TEXT, &Inputs::new(), &ctx).await.unwrap();
        assert_eq!(msg.text(), r#"{"error":"base_url is empty"}"#);
    }

    #[tokio::test]
    async fn unreachable_server_is_reported_in_lenient_mode() {
        let picker = ToolPicker::new("http://127.0.0.1:1", "");
        let ctx = NodeContext::new(Settings::default());
        let msg = picker.output(PICKED_TOOL, &Inputs::new(), &ctx).await.unwrap();
        let body: Value = serde_json::from_str(msg.text()).unwrap();
        assert_eq!(body["error"], json!("failed to fetch tools"));
        assert_eq!(msg.sender(), Some("ToolPicker"));
    }

    #[tokio::test]
    async fn fetch_failure_clears_options_at_edit_time() {
        let picker = ToolPicker::new("http://127.0.0.1:1", "");
        let ctx = NodeContext::new(Settings::default());
        let config = picker
            .build_config()
            .with(TOOL_FIELD, Field::dropdown(vec!["stale".into()], "stale"));
        let update = ConfigUpdate::changed(config, "refresh_now", json!(true));
        let config = picker.update_build_config(update, &ctx).await.unwrap();
        assert_eq!(config.dropdown(TOOL_FIELD), Some((&[][..], "")));
        assert_eq!(config.boolean("refresh_now"), Some(false));
    }

    #[tokio::test]
    async fn strict_edit_time_refresh_fails_on_unreachable_server() {
        let picker = ToolPicker::new("http://127.0.0.1:1", "");
        let ctx = NodeContext::new(Settings {
            tools_url: "http://127.0.0.1:1".into(),
            failure_mode: crate::config::FailureMode::Strict,
            ..Settings::default()
        });
        let config = picker
            .build_config()
            .with(TOOL_FIELD, Field::dropdown(vec!["stale".into()], "stale"));
        let update = ConfigUpdate::changed(config, "refresh_now", json!(true));
        let err = picker.update_build_config(update, &ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::ConnectionFailed(_)), "{err:?}");
        assert_eq!(picker.cached_tools().await, None);
    }
}
