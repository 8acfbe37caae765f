use std::{fs, path::PathBuf};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use coe_nodes::{
    agent::{CoeAgent, coe},
    build_config::ConfigUpdate,
    config::{ConfigManager, EnvConfigManager, FailureMode, Settings},
    endpoint::{normalize_base, normalize_or_default, validate_base},
    logger::{LogConfig, init_tracing},
    message::PortValue,
    node::{Inputs, Node, NodeContext, NodeType},
    schema::write_schema,
    tools::{ToolInvoker, ToolPicker, ToolRouter, invoker, picker, router},
};
use serde_json::{Value, json};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "coe-nodes",
    about = "Discover remote models and tools and invoke them",
    version
)]
struct Cli {
    /// Log level directive (e.g. error, warn, info, debug, trace). Defaults to RUST_LOG, then info
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory for rolling text logs and the JSON request log
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// .env file to load settings from. Default: ./.env when present
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Fail on remote errors instead of printing an error object
    #[arg(long, global = true)]
    strict: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Refresh the model list and print label -> id
    Models(BackendArgs),

    /// Send one chat message through the model picker
    Chat(ChatArgs),

    /// List the tools published by a tool server
    Tools(ToolServerArgs),

    /// Print the selection JSON for one tool
    Pick(PickArgs),

    /// Print both router outputs for a JSON message
    Route(RouteArgs),

    /// Call the tool described by a selection
    Invoke(InvokeArgs),

    /// Run a node defined in a YAML file
    Run(RunArgs),

    /// Emit JSON-Schema for every node
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct BackendArgs {
    /// Backend base URL. Default: COE_BACKEND_URL
    #[arg(long, default_value = "", value_parser = base_url_arg)]
    backend_url: String,
    #[arg(long)]
    force_https: bool,
}

#[derive(Args, Debug)]
struct ChatArgs {
    /// Message sent as the user turn
    message: String,
    /// Model label as shown in the dropdown
    #[arg(long, default_value = "")]
    model: String,
    /// Optional system prompt
    #[arg(long)]
    prompt: Option<String>,
    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Args, Debug)]
struct ToolServerArgs {
    /// Tool server base URL. Default: COE_TOOLS_URL
    #[arg(long, default_value = "", value_parser = base_url_arg)]
    base_url: String,
    #[arg(long)]
    force_https: bool,
}

#[derive(Args, Debug)]
struct PickArgs {
    /// Tool name or url path. Default: the first tool
    #[arg(long, default_value = "")]
    tool: String,
    #[command(flatten)]
    server: ToolServerArgs,
}

#[derive(Args, Debug)]
struct RouteArgs {
    /// JSON object (or any text) as produced by the tool picker
    message: String,
    /// Key forwarded on prompt_value_message. Default: name, else the first key
    #[arg(long, default_value = "")]
    key: String,
    /// Pretty-print original_message
    #[arg(long)]
    pretty: bool,
}

#[derive(Args, Debug)]
struct InvokeArgs {
    /// Selection JSON with base_url, url_path and name
    #[arg(long)]
    selection: String,
    /// User input sent as `input`
    #[arg(long)]
    input: Option<String>,
    /// Extra parameters as a JSON string
    #[arg(long, default_value = "")]
    params: String,
    #[arg(long, default_value = "POST")]
    method: String,
    /// Send GET with query parameters
    #[arg(long)]
    get_query: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// YAML file holding one node, e.g. `tool_picker: {selected_tool: search}`
    file: PathBuf,
    /// Output port to read. Default: every output in declaration order
    #[arg(long)]
    output: Option<String>,
    /// Input port value as `port=value`. JSON values are parsed
    #[arg(long = "input", value_parser = parse_input)]
    inputs: Vec<(String, String)>,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Output directory
    #[arg(long, default_value = "schemas")]
    out: PathBuf,
}

fn parse_input(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((port, value)) if !port.trim().is_empty() => {
            Ok((port.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected port=value, got `{raw}`")),
    }
}

/// Empty means "use the configured default"; anything else must be an
/// absolute http(s) URL.
fn base_url_arg(raw: &str) -> Result<String, String> {
    let base = normalize_base(raw, false);
    if base.is_empty() {
        return Ok(base);
    }
    validate_base(&base).map(|_| base)
}

fn port_value(raw: &str) -> PortValue {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => PortValue::from(value),
        _ => PortValue::Text(raw.to_string()),
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&LogConfig::new(cli.log_level.clone(), cli.log_dir.clone()))?;

    let config = ConfigManager(EnvConfigManager::new(cli.env_file.clone()));
    let mut settings = Settings::load(&config).await;
    if cli.strict {
        settings.failure_mode = FailureMode::Strict;
    }
    info!(backend = %settings.backend_url, tools = %settings.tools_url, mode = ?settings.failure_mode, "settings loaded");
    let context = NodeContext::new(settings);

    match cli.command {
        Commands::Models(args) => {
            let agent = CoeAgent::default().with_backend(&args.backend_url, args.force_https);
            let update = ConfigUpdate::initial(agent.build_config());
            let config = agent.update_build_config(update, &context).await?;
            let models = agent
                .cached_models()
                .await
                .context("model refresh did not populate the cache")?;
            for pair in models.pairs() {
                println!("{}\t{}", pair.label, pair.id);
            }
            if let Some((_, selected)) = config.dropdown("model_name") {
                info!(selected, source = ?models.source(), "model list refreshed");
            }
        }
        Commands::Chat(args) => {
            let agent = CoeAgent::default()
                .with_backend(&args.backend.backend_url, args.backend.force_https)
                .with_prompt(args.prompt)
                .with_model(&args.model);
            let inputs = Inputs::new().with(coe::CHAT_INPUT, args.message);
            let reply = agent.output(coe::CHAT_OUTPUT, &inputs, &context).await?;
            let model_id = agent.output(coe::MODEL_ID_OUTPUT, &inputs, &context).await?;
            info!(model_id = model_id.text(), "chat finished");
            println!("{}", reply.text());
        }
        Commands::Tools(args) => {
            let picker = ToolPicker::default().with_force_https(args.force_https);
            let base = normalize_or_default(
                &args.base_url,
                &context.settings().tools_url,
                args.force_https,
            );
            for tool in picker.refresh_tools(&base, &context).await? {
                println!("{}\t{}\t{}", tool.label(), tool.url_path, tool.description);
            }
        }
        Commands::Pick(args) => {
            let base = normalize_or_default(
                &args.server.base_url,
                &context.settings().tools_url,
                args.server.force_https,
            );
            let picker = ToolPicker::new(&base, &args.tool);
            let picked = picker
                .output(picker::PICKED_TOOL_TEXT, &Inputs::new(), &context)
                .await?;
            println!("{}", picked.text());
        }
        Commands::Route(args) => {
            let router = ToolRouter {
                minify_original: !args.pretty,
                ..ToolRouter::default()
            }
            .with_key(&args.key);
            let inputs = Inputs::new().with(router::TOOL_MESSAGE, port_value(&args.message));
            for port in [router::ORIGINAL_MESSAGE, router::PROMPT_VALUE_MESSAGE] {
                let msg = router.output(port, &inputs, &context).await?;
                println!("{port}: {}", msg.text());
            }
        }
        Commands::Invoke(args) => {
            let invoker = ToolInvoker::default()
                .with_selection(json!(args.selection))
                .with_params(args.params)
                .with_method(args.method)
                .with_get_query(args.get_query);
            let mut inputs = Inputs::new();
            if let Some(input) = args.input {
                inputs.insert(invoker::USER_INPUT, input);
            }
            let result = invoker.output(invoker::CHAT_OUTPUT, &inputs, &context).await?;
            println!("{}", result.text());
        }
        Commands::Run(args) => {
            let raw = fs::read_to_string(&args.file)
                .with_context(|| format!("could not read {}", args.file.display()))?;
            let node: Node = serde_yaml_bw::from_str(&raw)
                .with_context(|| format!("{} is not a valid node definition", args.file.display()))?;

            let mut inputs = Inputs::new();
            for (port, value) in &args.inputs {
                inputs.insert(port, port_value(value));
            }

            let ports: Vec<String> = match args.output {
                Some(port) => vec![port],
                None => node.outputs().into_iter().map(|o| o.name).collect(),
            };
            if ports.is_empty() {
                bail!("node `{}` declares no outputs", node.type_name());
            }
            for port in ports {
                match node.output(&port, &inputs, &context).await {
                    Ok(msg) => println!("{port}: {}", msg.text()),
                    Err(err) => {
                        error!(%err, port = %port, "output failed");
                        return Err(err.into());
                    }
                }
            }
        }
        Commands::Schema(args) => {
            let written = write_schema(&args.out)?;
            println!("{} schemas written to {}", written.len(), args.out.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_input_splits_on_first_equals() {
        assert_eq!(
            parse_input("params={\"a\":\"b=c\"}"),
            Ok(("params".to_string(), "{\"a\":\"b=c\"}".to_string()))
        );
        assert!(parse_input("novalue").is_err());
        assert!(parse_input("=x").is_err());
    }

    #[test]
    fn port_value_parses_structured_json_only() {
        assert!(matches!(port_value("{\"name\":\"a\"}"), PortValue::Json(_)));
        assert!(matches!(port_value("{\"text\":\"hi\"}"), PortValue::Message(_)));
        assert_eq!(port_value("42"), PortValue::Text("42".into()));
        assert_eq!(port_value("hello"), PortValue::Text("hello".into()));
    }

    #[test]
    fn base_url_args_are_validated() {
        assert_eq!(base_url_arg(""), Ok(String::new()));
        assert_eq!(base_url_arg(" http://h:8000/ "), Ok("http://h:8000".to_string()));
        assert!(base_url_arg("h:8000/v1").is_err());
        assert!(Cli::try_parse_from(["coe-nodes", "models", "--backend-url", "ftp://h"]).is_err());
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["coe-nodes", "route", "{}", "--strict", "--key", "name"]).unwrap();
        assert!(cli.strict);
        assert!(matches!(cli.command, Commands::Route(RouteArgs { ref key, .. }) if key == "name"));
    }
}
