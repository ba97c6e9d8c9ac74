//! Task lifecycle state
//!
//! `Uninitialized -> Initialized -> Started -> (Stopping* -> Stopped | Done) -> Exited`.
//! `Stopping` may be entered from `Started` at any time, `Exited` from anywhere.

use serde::Serialize;

/// Lifecycle phase of the task process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Uninitialized,
    Initialized,
    Started,
    Stopping,
    Stopped,
    Done,
    Exited,
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Uninitialized
    }
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Exited)
    }

    /// Whether moving from `self` to `next` follows the lifecycle
    pub fn can_transition(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (*self, next) {
            (Exited, _) => false,
            (_, Exited) => true,
            // a worker may re-initialize a process that finished a previous task
            (_, Initialized) => true,
            (Initialized, Started) => true,
            (Started | Stopping | Initialized, Stopping) => true,
            (Started | Stopping | Initialized, Stopped) => true,
            (Started, Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Uninitialized => "uninitialized",
            TaskState::Initialized => "initialized",
            TaskState::Started => "started",
            TaskState::Stopping => "stopping",
            TaskState::Stopped => "stopped",
            TaskState::Done => "done",
            TaskState::Exited => "exited",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = TaskState::default();
        for next in [TaskState::Initialized, TaskState::Started, TaskState::Done, TaskState::Exited] {
            assert!(state.can_transition(next), "{} -> {}", state, next);
            state = next;
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn test_stopping_is_reentrant() {
        assert!(TaskState::Started.can_transition(TaskState::Stopping));
        assert!(TaskState::Stopping.can_transition(TaskState::Stopping));
        assert!(TaskState::Stopping.can_transition(TaskState::Stopped));
    }

    #[test]
    fn test_exit_reachable_from_everywhere_and_terminal() {
        for state in [
            TaskState::Uninitialized,
            TaskState::Initialized,
            TaskState::Started,
            TaskState::Stopping,
            TaskState::Stopped,
            TaskState::Done,
        ] {
            assert!(state.can_transition(TaskState::Exited));
        }
        assert!(!TaskState::Exited.can_transition(TaskState::Initialized));
    }

    #[test]
    fn test_cannot_start_uninitialized() {
        assert!(!TaskState::Uninitialized.can_transition(TaskState::Started));
        assert!(!TaskState::Done.can_transition(TaskState::Started));
    }
}
