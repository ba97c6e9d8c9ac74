//! Recording worker channel (tests and local runs without a worker)
//!
//! Keeps every outgoing message in order and lets callers wait until a given
//! command has been sent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use super::message::{OutgoingCommand, OutgoingMessage};
use super::{TransportError, WorkerChannel};

#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<OutgoingMessage>>,
    notify: Notify,
    closed: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<OutgoingMessage> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn commands(&self) -> Vec<OutgoingCommand> {
        self.messages().into_iter().map(|m| m.command).collect()
    }

    /// Messages of one command, in send order
    pub fn of(&self, command: OutgoingCommand) -> Vec<OutgoingMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.command == command)
            .collect()
    }

    /// Make every following send fail as if the worker went away
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Wait until `count` messages of `command` were sent; false on timeout
    pub async fn wait_for(&self, command: OutgoingCommand, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.of(command).len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

impl WorkerChannel for RecordingChannel {
    fn send(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        match self.sent.lock() {
            Ok(mut sent) => sent.push(message),
            Err(poisoned) => poisoned.into_inner().push(message),
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
