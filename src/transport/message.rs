//! Worker command envelopes
//!
//! Every frame exchanged with the worker is `{command, data}`; outgoing error
//! reports carry `error` at the top level instead of `data`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::Completion;
use crate::core::context::{ExitOptions, StopOptions, TaskContext};
use crate::core::error::{ErrorReport, RunnerError};
use crate::streaming::StreamMessage;

/// Raw frame received from the worker
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub command: String,
    #[serde(default)]
    pub data: Value,
}

/// Commands the runner understands
#[derive(Debug, Clone)]
pub enum IncomingCommand {
    Initialize(Box<TaskContext>),
    Start,
    Stop(StopOptions),
    Exit(ExitOptions),
    /// `executionDone` and `executionError`
    ExecutionDone(Completion),
    /// `subPipelineDone`, `subPipelineError` and `subPipelineStopped`
    SubPipelineDone(Completion),
    StreamingInMessage(StreamMessage),
    Unknown(String),
}

impl IncomingMessage {
    pub fn parse(self) -> Result<IncomingCommand, RunnerError> {
        let command = self.command;
        let data = self.data;
        let parsed = match command.as_str() {
            "initialize" => IncomingCommand::Initialize(Box::new(payload(&command, data)?)),
            "start" => IncomingCommand::Start,
            "stop" => IncomingCommand::Stop(payload_or_default(&command, data)?),
            "exit" => IncomingCommand::Exit(payload_or_default(&command, data)?),
            "executionDone" | "executionError" => {
                IncomingCommand::ExecutionDone(payload(&command, data)?)
            }
            "subPipelineDone" | "subPipelineError" | "subPipelineStopped" => {
                IncomingCommand::SubPipelineDone(payload(&command, data)?)
            }
            "streamingInMessage" => IncomingCommand::StreamingInMessage(payload(&command, data)?),
            _ => IncomingCommand::Unknown(command),
        };
        Ok(parsed)
    }
}

fn payload<T: DeserializeOwned>(command: &str, data: Value) -> Result<T, RunnerError> {
    serde_json::from_value(data).map_err(|e| RunnerError::InvalidPayload {
        command: command.to_string(),
        reason: e.to_string(),
    })
}

/// `stop` and `exit` may arrive without data
fn payload_or_default<T: DeserializeOwned + Default>(command: &str, data: Value) -> Result<T, RunnerError> {
    if data.is_null() {
        return Ok(T::default());
    }
    payload(command, data)
}

/// Commands sent to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutgoingCommand {
    Initialized,
    Started,
    Stopping,
    Stopped,
    Storing,
    Done,
    ErrorMessage,
    ServingStatus,
    StartAlgorithmExecution,
    StartStoredSubPipeline,
    StartRawSubPipeline,
    StreamingInMessageDone,
    StreamingOutMessage,
}

impl OutgoingCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutgoingCommand::Initialized => "initialized",
            OutgoingCommand::Started => "started",
            OutgoingCommand::Stopping => "stopping",
            OutgoingCommand::Stopped => "stopped",
            OutgoingCommand::Storing => "storing",
            OutgoingCommand::Done => "done",
            OutgoingCommand::ErrorMessage => "errorMessage",
            OutgoingCommand::ServingStatus => "servingStatus",
            OutgoingCommand::StartAlgorithmExecution => "startAlgorithmExecution",
            OutgoingCommand::StartStoredSubPipeline => "startStoredSubPipeline",
            OutgoingCommand::StartRawSubPipeline => "startRawSubPipeline",
            OutgoingCommand::StreamingInMessageDone => "streamingInMessageDone",
            OutgoingCommand::StreamingOutMessage => "streamingOutMessage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub command: OutgoingCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl OutgoingMessage {
    pub fn new(command: OutgoingCommand) -> Self {
        Self {
            command,
            data: None,
            error: None,
        }
    }

    pub fn with_data(command: OutgoingCommand, data: Value) -> Self {
        Self {
            command,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(report: ErrorReport) -> Self {
        Self {
            command: OutgoingCommand::ErrorMessage,
            data: None,
            error: Some(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn incoming(value: Value) -> IncomingCommand {
        serde_json::from_value::<IncomingMessage>(value)
            .unwrap()
            .parse()
            .unwrap()
    }

    #[test]
    fn test_parse_lifecycle_commands() {
        assert!(matches!(incoming(json!({"command": "start"})), IncomingCommand::Start));
        assert!(matches!(
            incoming(json!({"command": "stop", "data": {"forceStop": true}})),
            IncomingCommand::Stop(StopOptions { force_stop: true })
        ));
        assert!(matches!(
            incoming(json!({"command": "exit"})),
            IncomingCommand::Exit(ExitOptions { exit_code: None, .. })
        ));
        match incoming(json!({"command": "initialize", "data": {"jobId": "j", "taskId": "t"}})) {
            IncomingCommand::Initialize(ctx) => assert_eq!(ctx.task_id, "t"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_completions_share_handlers() {
        match incoming(json!({"command": "executionError", "data": {"execId": "4", "error": "bad"}})) {
            IncomingCommand::ExecutionDone(c) => {
                assert_eq!(c.exec_id.as_deref(), Some("4"));
                assert_eq!(c.error, Some(json!("bad")));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            incoming(json!({"command": "subPipelineStopped", "data": {"subPipelineId": "2"}})),
            IncomingCommand::SubPipelineDone(_)
        ));
    }

    #[test]
    fn test_unknown_and_invalid() {
        assert!(matches!(
            incoming(json!({"command": "serviceDiscoveryUpdate", "data": []})),
            IncomingCommand::Unknown(ref c) if c == "serviceDiscoveryUpdate"
        ));
        let bad: IncomingMessage =
            serde_json::from_value(json!({"command": "stop", "data": {"forceStop": "yes"}})).unwrap();
        assert!(matches!(bad.parse(), Err(RunnerError::InvalidPayload { .. })));
    }

    #[test]
    fn test_outgoing_wire_shape() {
        let done = OutgoingMessage::new(OutgoingCommand::Done);
        assert_eq!(serde_json::to_value(&done).unwrap(), json!({"command": "done"}));

        let err = OutgoingMessage::error(ErrorReport::failed("boom", None));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"command": "errorMessage", "error": {"code": "Failed", "message": "boom"}})
        );
        assert_eq!(
            serde_json::to_value(OutgoingCommand::StartRawSubPipeline).unwrap(),
            json!(OutgoingCommand::StartRawSubPipeline.as_str())
        );
    }
}
