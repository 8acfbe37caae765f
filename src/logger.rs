use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Plain-text log, rotated daily.
pub const LOG_FILE: &str = "coe-nodes.log";
/// Newline-delimited JSON, one line per remote call (`target = "request"`).
pub const EVENT_FILE: &str = "coe-nodes-requests.json";

/// Noisy HTTP internals are capped regardless of the chosen level.
const QUIET_DEPENDENCIES: &str = "hyper=warn,hyper_util=warn,reqwest=warn,h2=warn,httpmock=warn";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive. Falls back to `RUST_LOG`, then `info`.
    pub log_level: Option<String>,
    /// When set, rolling text and JSON request logs are written here.
    pub log_dir: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(log_level: Option<String>, log_dir: Option<PathBuf>) -> Self {
        Self { log_level, log_dir }
    }

    pub fn level(&self) -> String {
        self.log_level
            .clone()
            .or_else(|| std::env::var("RUST_LOG").ok())
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| "info".to_string())
    }
}

fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(format!("{level},{QUIET_DEPENDENCIES}"))
        .unwrap_or_else(|_| EnvFilter::new(format!("info,{QUIET_DEPENDENCIES}")))
}

/// Installs the global subscriber: stderr always, plus daily rolling files
/// when a log directory is configured. Returns `false` when a subscriber was
/// already installed, which is not an error.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<bool> {
    let level = config.level();

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(level_filter(&level));

    let (text_layer, request_layer) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let text = fmt::layer()
                .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE))
                .with_ansi(false)
                .with_filter(level_filter(&level));
            let requests = fmt::layer()
                .json()
                .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, EVENT_FILE))
                .with_target(true)
                .with_filter(EnvFilter::new("request=info"));
            (Some(text), Some(requests))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(text_layer)
        .with(request_layer)
        .try_init()
        .is_ok();
    Ok(installed)
}
