//! Result metadata reported alongside `storing`
//!
//! Each save path is evaluated against `{<nodeName>: result}`; arrays report
//! their length, everything else its type name as the worker's metadata
//! consumers know it, where `null` counts as an `object`. Paths that do not
//! resolve are skipped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::select_path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMetadata {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
}

pub fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "object",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn create_metadata(node_name: &str, data: &Value, save_paths: &[String]) -> Map<String, Value> {
    let mut metadata = Map::new();
    if save_paths.is_empty() {
        return metadata;
    }
    let mut root = Map::new();
    root.insert(node_name.to_string(), data.clone());
    let root = Value::Object(root);

    for path in save_paths {
        let Some(value) = select_path(&root, path) else {
            continue;
        };
        let entry = match value {
            Value::Array(items) => PathMetadata {
                kind: "array".to_string(),
                size: Some(items.len()),
            },
            other => PathMetadata {
                kind: json_type(other).to_string(),
                size: None,
            },
        };
        if let Ok(entry) = serde_json::to_value(entry) {
            metadata.insert(path.clone(), entry);
        }
    }
    metadata
}
