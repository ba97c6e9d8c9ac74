//! Remote execution broker
//!
//! Lets a running algorithm start another algorithm or a sub-pipeline and
//! await its result. Each call is sent fire-and-forget over the worker
//! channel with a fresh id; the matching completion command settles it.
//! Results that were too large to inline are fetched from the producing
//! peer or from storage before the caller sees them.

mod tickets;

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub use tickets::{ExecutionTicket, TicketRegistry};

use crate::storage::{DataAdapter, StorageError, StorageLink};
use crate::streaming::{InputListener, StreamingError, StreamingManager};
use crate::transport::{OutgoingCommand, OutgoingMessage, TransportError, WorkerChannel};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("{0}")]
    Remote(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Streaming(#[from] StreamingError),

    #[error("execution {0} was dropped before completing")]
    Cancelled(String),
}

/// Payload of `executionDone`/`executionError` and the sub-pipeline variants
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_pipeline_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl Completion {
    fn error_message(error: &Value) -> String {
        match error {
            Value::String(message) => message.clone(),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
            other => other.to_string(),
        }
    }
}

pub struct RemoteExecutionBroker {
    channel: Arc<dyn WorkerChannel>,
    tickets: TicketRegistry,
    /// Present in indirect storage mode only
    data: Option<Arc<DataAdapter>>,
    streaming: Arc<StreamingManager>,
    job_id: RwLock<Option<String>>,
}

impl RemoteExecutionBroker {
    pub fn new(
        channel: Arc<dyn WorkerChannel>,
        data: Option<Arc<DataAdapter>>,
        streaming: Arc<StreamingManager>,
    ) -> Self {
        Self {
            channel,
            tickets: TicketRegistry::new(),
            data,
            streaming,
            job_id: RwLock::new(None),
        }
    }

    pub fn set_job_id(&self, job_id: &str) {
        if let Ok(mut current) = self.job_id.write() {
            *current = Some(job_id.to_string());
        }
    }

    pub fn job_id(&self) -> Option<String> {
        self.job_id.read().ok().and_then(|j| j.clone())
    }

    pub fn pending(&self) -> usize {
        self.tickets.pending()
    }

    /// Run another algorithm on `input`.
    ///
    /// In indirect mode each input element is stored first and travels as a
    /// `"$$<id>"` reference.
    pub async fn invoke_algorithm(
        &self,
        algorithm_name: &str,
        input: Vec<Value>,
        include_result: bool,
    ) -> Result<Value, BrokerError> {
        let payload = match &self.data {
            Some(data) => {
                let job_id = self.job_id().unwrap_or_default();
                let mut storage = Map::new();
                let mut storage_input = Vec::with_capacity(input.len());
                for value in &input {
                    let key = uuid::Uuid::new_v4().to_string();
                    let info = data.put_value(&job_id, &key, value).await?;
                    let link = serde_json::to_value(StorageLink::from_info(info))
                        .map_err(|e| StorageError::Encoding(e.to_string()))?;
                    storage.insert(key.clone(), link);
                    storage_input.push(json!(format!("$${}", key)));
                }
                json!({
                    "algorithmName": algorithm_name,
                    "storageInput": storage_input,
                    "storage": storage,
                })
            }
            None => json!({
                "algorithmName": algorithm_name,
                "input": input,
            }),
        };
        self.call(OutgoingCommand::StartAlgorithmExecution, "execId", payload, include_result)
            .await
    }

    pub async fn invoke_stored_sub_pipeline(
        &self,
        name: &str,
        flow_input: Value,
        include_result: bool,
    ) -> Result<Value, BrokerError> {
        let payload = json!({
            "subPipeline": { "name": name, "flowInput": flow_input },
        });
        self.call(OutgoingCommand::StartStoredSubPipeline, "subPipelineId", payload, include_result)
            .await
    }

    pub async fn invoke_raw_sub_pipeline(
        &self,
        name: &str,
        nodes: Value,
        flow_input: Value,
        options: Value,
        webhooks: Value,
        include_result: bool,
    ) -> Result<Value, BrokerError> {
        let payload = json!({
            "subPipeline": {
                "name": name,
                "nodes": nodes,
                "flowInput": flow_input,
                "options": options,
                "webhooks": webhooks,
            },
        });
        self.call(OutgoingCommand::StartRawSubPipeline, "subPipelineId", payload, include_result)
            .await
    }

    async fn call(
        &self,
        command: OutgoingCommand,
        id_field: &str,
        mut payload: Value,
        include_result: bool,
    ) -> Result<Value, BrokerError> {
        let (exec_id, settled) = self.tickets.issue(include_result);
        payload[id_field] = json!(exec_id);
        payload["includeResult"] = json!(include_result);

        tracing::info!(exec_id = %exec_id, command = command.as_str(), "remote call issued");
        if let Err(e) = self.channel.send(OutgoingMessage::with_data(command, payload)) {
            self.tickets.take(&exec_id);
            return Err(e.into());
        }
        settled
            .await
            .unwrap_or_else(|_| Err(BrokerError::Cancelled(exec_id)))
    }

    pub async fn on_execution_done(&self, completion: Completion) {
        match completion.exec_id.clone() {
            Some(exec_id) => self.complete(&exec_id, completion).await,
            None => tracing::warn!("execution completion without execId"),
        }
    }

    pub async fn on_sub_pipeline_done(&self, completion: Completion) {
        match completion.sub_pipeline_id.clone() {
            Some(id) => self.complete(&id, completion).await,
            None => tracing::warn!("sub-pipeline completion without subPipelineId"),
        }
    }

    async fn complete(&self, exec_id: &str, completion: Completion) {
        let Some(ticket) = self.tickets.take(exec_id) else {
            tracing::debug!(exec_id, "completion for unknown or settled call ignored");
            return;
        };
        let result = self.resolve(ticket.include_result, completion).await;
        if let Err(e) = &result {
            tracing::warn!(exec_id, error = %e, "remote call failed");
        }
        if !ticket.settle(result) {
            tracing::debug!(exec_id, "caller no longer waiting");
        }
    }

    async fn resolve(&self, include_result: bool, completion: Completion) -> Result<Value, BrokerError> {
        if let Some(error) = &completion.error {
            return Err(BrokerError::Remote(Completion::error_message(error)));
        }
        if !include_result {
            return Ok(Value::Null);
        }
        let response = completion.response.unwrap_or(Value::Null);
        match (&self.data, response.get("storageInfo")) {
            (Some(data), Some(storage_info)) => Ok(data.resolve_result(storage_info).await?),
            _ => Ok(response),
        }
    }

    pub fn streaming(&self) -> &Arc<StreamingManager> {
        &self.streaming
    }

    pub fn register_input_listener(&self, listener: InputListener) {
        self.streaming.register_input_listener(listener);
    }

    pub fn start_message_listening(&self) {
        self.streaming.start_message_listening();
    }

    pub fn send_message(&self, message: Value, flow_name: Option<&str>) -> Result<(), BrokerError> {
        Ok(self.streaming.send_message(message, flow_name)?)
    }

    pub async fn stop_streaming(&self, force: bool) {
        self.streaming.stop_streaming(force).await;
    }
}
