//! Task context: the execution record received with `initialize`

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::storage::StorageRef;

/// Pipeline kind of the task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    #[default]
    Batch,
    Stream,
}

/// State type of a stream node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
    Stateful,
    Stateless,
}

/// An explicit `null` reads like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// `info` section of the task context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    /// Paths extracted from the result for metadata reporting
    #[serde(default, deserialize_with = "null_as_default")]
    pub save_paths: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Message handed to a stateless algorithm for one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInput {
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// The authoritative execution record of one task
///
/// Unknown fields sent by the worker are kept in `extra` and survive the
/// round trip to the algorithm untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub kind: PipelineKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_type: Option<StateType>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub childs: Vec<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, deserialize_with = "null_as_default")]
    pub info: TaskInfo,
    /// `"$$<key>"` references in `input` point into this map
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub storage: HashMap<String, StorageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_input: Option<StreamInput>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskContext {
    pub fn is_stream(&self) -> bool {
        self.kind == PipelineKind::Stream
    }

    /// Stateless stream nodes are driven through the stateless adapter
    pub fn is_stateless_stream(&self) -> bool {
        self.is_stream() && self.state_type == Some(StateType::Stateless)
    }

    /// Copy of this context carrying one inbound stream message
    pub fn with_stream_input(&self, message: Value, origin: Option<String>) -> Self {
        Self {
            stream_input: Some(StreamInput { message, origin }),
            ..self.clone()
        }
    }
}

/// Payload of the `stop` command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOptions {
    #[serde(default)]
    pub force_stop: bool,
}

/// Payload of the `exit` command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitOptions {
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
