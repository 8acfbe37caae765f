use std::{env, path::PathBuf, str::FromStr, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::endpoint::{DOCKER_GATEWAY, DOCKER_HOST, HostRewrite};

pub const BACKEND_URL_KEY: &str = "COE_BACKEND_URL";
pub const TOOLS_URL_KEY: &str = "COE_TOOLS_URL";
pub const API_KEY_KEY: &str = "COE_API_KEY";
pub const FAILURE_MODE_KEY: &str = "COE_FAILURE_MODE";
pub const DISCOVERY_TIMEOUT_KEY: &str = "COE_DISCOVERY_TIMEOUT_SECS";
pub const CHAT_TIMEOUT_KEY: &str = "COE_CHAT_TIMEOUT_SECS";
pub const TOOL_TIMEOUT_KEY: &str = "COE_TOOL_TIMEOUT_SECS";
pub const FALLBACK_HOST_KEY: &str = "COE_FALLBACK_HOST";
pub const FALLBACK_TARGET_KEY: &str = "COE_FALLBACK_TARGET";

pub const DEFAULT_BACKEND_URL: &str = "http://host.docker.internal:8000";
pub const DEFAULT_TOOLS_URL: &str = "http://greatcoe.cafe24.com:8080";

/// A read-only source of `COE_*` values. Serialisable so a node host can
/// persist which source it was given.
#[typetag::serde]
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn describe(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.describe())
    }
}

/// The process environment, after loading an optional `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: Option<PathBuf>,
}

impl EnvConfigManager {
    /// Loads `env_file` (or `./.env` when none is given) into the process
    /// environment. Variables already set win over the file.
    pub fn new(env_file: Option<PathBuf>) -> Box<Self> {
        match &env_file {
            Some(path) => match dotenvy::from_path(path) {
                Ok(()) => info!(path = %path.display(), "loaded env file"),
                Err(e) => error!(path = %path.display(), error = %e, "could not load env file"),
            },
            None => {
                if let Ok(path) = dotenvy::dotenv() {
                    debug!(path = %path.display(), "loaded .env");
                }
            }
        }
        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        match &self.env_file {
            Some(path) => format!("env (+{})", path.display()),
            None => "env".to_string(),
        }
    }
}

/// Fixed key/value pairs, for tests and embedding hosts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    values: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::default()
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Box::new(Self { values })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        format!("map ({} keys)", self.values.len())
    }
}

/// Whether failures degrade into informative output (`Lenient`) or surface
/// as errors to the caller (`Strict`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    #[default]
    Lenient,
    Strict,
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lenient" | "" => Ok(FailureMode::Lenient),
            "strict" => Ok(FailureMode::Strict),
            other => Err(format!("unknown failure mode `{other}`")),
        }
    }
}

/// Everything the nodes read from the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Settings {
    pub backend_url: String,
    pub tools_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub failure_mode: FailureMode,
    pub discovery_timeout_secs: u64,
    pub chat_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub host_rewrite: HostRewrite,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            tools_url: DEFAULT_TOOLS_URL.to_string(),
            api_key: None,
            failure_mode: FailureMode::Lenient,
            discovery_timeout_secs: 8,
            chat_timeout_secs: 30,
            tool_timeout_secs: 15,
            host_rewrite: HostRewrite::default(),
        }
    }
}

impl Settings {
    pub async fn load(config: &ConfigManager) -> Self {
        let defaults = Settings::default();
        let text = |value: Option<String>, default: String| {
            value
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
        };

        let failure_mode = match config.0.get(FAILURE_MODE_KEY).await {
            Some(raw) => raw.parse().unwrap_or_else(|e: String| {
                warn!("{e}; using lenient");
                FailureMode::Lenient
            }),
            None => defaults.failure_mode,
        };

        Settings {
            backend_url: text(config.0.get(BACKEND_URL_KEY).await, defaults.backend_url),
            tools_url: text(config.0.get(TOOLS_URL_KEY).await, defaults.tools_url),
            api_key: config.0.get(API_KEY_KEY).await.filter(|k| !k.trim().is_empty()),
            failure_mode,
            discovery_timeout_secs: secs(config, DISCOVERY_TIMEOUT_KEY, defaults.discovery_timeout_secs).await,
            chat_timeout_secs: secs(config, CHAT_TIMEOUT_KEY, defaults.chat_timeout_secs).await,
            tool_timeout_secs: secs(config, TOOL_TIMEOUT_KEY, defaults.tool_timeout_secs).await,
            host_rewrite: HostRewrite::new(
                text(config.0.get(FALLBACK_HOST_KEY).await, DOCKER_HOST.to_string()),
                text(config.0.get(FALLBACK_TARGET_KEY).await, DOCKER_GATEWAY.to_string()),
            ),
        }
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn chat_timeout(&self) -> Duration {
        Duration::from_secs(self.chat_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn is_strict(&self) -> bool {
        self.failure_mode == FailureMode::Strict
    }
}

/// Positive whole seconds. Zero would make every request time out at once,
/// so it falls back to the default like any other bad value.
async fn secs(config: &ConfigManager, key: &str, default: u64) -> u64 {
    match config.0.get(key).await {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => secs,
            _ => {
                warn!(key, %raw, "not a positive number of seconds, using {default}");
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn map_source_returns_only_given_keys() {
        let mgr = MapConfigManager::from_pairs([("a", "1"), ("b", "2")]);
        assert_eq!(mgr.get("a").await, Some("1".to_string()));
        assert_eq!(mgr.get("c").await, None);
        assert_eq!(ConfigManager(mgr).0.describe(), "map (2 keys)");
    }

    #[tokio::test]
    async fn env_file_is_loaded_into_the_environment() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "COE_TEST_ONLY_KEY=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(Some(env_path));
        assert_eq!(mgr.get("COE_TEST_ONLY_KEY").await, Some("abc123".to_string()));
        assert!(mgr.describe().starts_with("env (+"));
    }

    #[test]
    fn config_manager_round_trips_through_its_type_tag() {
        let cfg = ConfigManager(MapConfigManager::from_pairs([(BACKEND_URL_KEY, "http://b")]));
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("MapConfigManager"));
        let back: ConfigManager = serde_json::from_str(&json).unwrap();
        assert_eq!(back.0.describe(), "map (1 keys)");
    }

    #[tokio::test]
    async fn settings_defaults_when_nothing_is_set() {
        let cfg = ConfigManager(MapConfigManager::new());
        let settings = Settings::load(&cfg).await;
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.backend_url, "http://host.docker.internal:8000");
        assert_eq!(settings.discovery_timeout(), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn settings_read_overrides() {
        let cfg = ConfigManager(MapConfigManager::from_pairs([
            (BACKEND_URL_KEY, " http://backend:9000/ "),
            (FAILURE_MODE_KEY, "STRICT"),
            (CHAT_TIMEOUT_KEY, "5"),
            (TOOL_TIMEOUT_KEY, "soon"),
            (API_KEY_KEY, "  "),
        ]));
        let settings = Settings::load(&cfg).await;
        assert_eq!(settings.backend_url, "http://backend:9000");
        assert!(settings.is_strict());
        assert_eq!(settings.chat_timeout_secs, 5);
        assert_eq!(settings.tool_timeout_secs, 15);
        assert_eq!(settings.api_key, None);
    }

    #[tokio::test]
    async fn zero_timeouts_fall_back_to_defaults() {
        let cfg = ConfigManager(MapConfigManager::from_pairs([
            (CHAT_TIMEOUT_KEY, "0"),
            (DISCOVERY_TIMEOUT_KEY, " 0 "),
            (TOOL_TIMEOUT_KEY, "-3"),
        ]));
        let settings = Settings::load(&cfg).await;
        let defaults = Settings::default();
        assert_eq!(settings.chat_timeout_secs, defaults.chat_timeout_secs);
        assert_eq!(settings.discovery_timeout_secs, defaults.discovery_timeout_secs);
        assert_eq!(settings.tool_timeout_secs, defaults.tool_timeout_secs);
        assert!(!settings.chat_timeout().is_zero());
    }

    #[test]
    fn failure_mode_parses() {
        assert_eq!("strict".parse::<FailureMode>(), Ok(FailureMode::Strict));
        assert_eq!("".parse::<FailureMode>(), Ok(FailureMode::Lenient));
        assert!("loud".parse::<FailureMode>().is_err());
    }
}
