//! Task lifecycle: context, state, errors, shutdown and the controller

pub mod builder;
pub mod context;
pub mod controller;
pub mod error;
pub mod shutdown;
pub mod state;

pub use builder::RunnerBuilder;
pub use context::{ExitOptions, PipelineKind, StateType, StopOptions, TaskContext, TaskInfo};
pub use controller::{ControllerTimings, TaskController};
pub use error::{ErrorReport, RunnerError};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::TaskState;
