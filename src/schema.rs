use std::{fs, path::Path};

use anyhow::Error;
use schemars::schema_for;
use tracing::info;

use crate::{
    agent::CoeAgent,
    build_config::ConfigUpdate,
    config::Settings,
    node::{Node, NodeError},
    tools::{Selection, ToolInvoker, ToolPicker, ToolRouter},
};

/// One instance of every node type the crate registers.
pub fn all_nodes() -> Vec<Node> {
    vec![
        Node(Box::new(CoeAgent::default())),
        Node(Box::new(ToolPicker::default())),
        Node(Box::new(ToolRouter::default())),
        Node(Box::new(ToolInvoker::default())),
    ]
}

/// Writes `node-<type>.schema.json` for every node plus the shared records
/// into `out_dir`. Returns the written file names.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir)?;
    let mut written = Vec::new();

    for node in all_nodes() {
        let filename = format!("node-{}.schema.json", node.type_name());
        fs::write(
            out_dir.join(&filename),
            serde_json::to_string_pretty(&node.schema())?,
        )?;
        written.push(filename);
    }

    let shared = [
        ("selection.schema.json", serde_json::to_string_pretty(&schema_for!(Selection))?),
        ("build-config-update.schema.json", serde_json::to_string_pretty(&schema_for!(ConfigUpdate))?),
        ("node-error.schema.json", serde_json::to_string_pretty(&schema_for!(NodeError))?),
        ("settings.schema.json", serde_json::to_string_pretty(&schema_for!(Settings))?),
    ];
    for (filename, json) in shared {
        fs::write(out_dir.join(filename), json)?;
        written.push(filename.to_string());
    }

    info!(count = written.len(), dir = %out_dir.display(), "schemas written");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_one_file_per_node_and_record() {
        let dir = tempdir().unwrap();
        let files = write_schema(dir.path()).unwrap();
        assert_eq!(files.len(), 8);
        assert!(dir.path().join("node-coe_agent.schema.json").exists());
        assert!(dir.path().join("node-tool_invoker.schema.json").exists());

        let raw = fs::read_to_string(dir.path().join("node-tool_picker.schema.json")).unwrap();
        assert!(raw.contains("backend_base_url"));
        assert!(!raw.contains("\"tools\""));
    }
}
