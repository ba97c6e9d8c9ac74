//! Outstanding remote calls
//!
//! Id allocation and registration happen under one lock, so a completion
//! can never observe an id whose ticket is not registered yet. A ticket is
//! taken out of the registry before its completion is processed; a second
//! completion for the same id finds nothing.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;

use super::BrokerError;

pub type TicketResult = Result<Value, BrokerError>;

pub struct ExecutionTicket {
    pub exec_id: String,
    pub include_result: bool,
    resolve: oneshot::Sender<TicketResult>,
}

impl ExecutionTicket {
    /// Hand the outcome to the caller; false if the caller stopped waiting
    pub fn settle(self, result: TicketResult) -> bool {
        self.resolve.send(result).is_ok()
    }
}

#[derive(Default)]
struct Inner {
    last_id: u64,
    pending: HashMap<String, ExecutionTicket>,
}

#[derive(Default)]
pub struct TicketRegistry {
    inner: Mutex<Inner>,
}

impl TicketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id and register its ticket
    pub fn issue(&self, include_result: bool) -> (String, oneshot::Receiver<TicketResult>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.last_id += 1;
        let exec_id = inner.last_id.to_string();
        inner.pending.insert(
            exec_id.clone(),
            ExecutionTicket {
                exec_id: exec_id.clone(),
                include_result,
                resolve: tx,
            },
        );
        (exec_id, rx)
    }

    pub fn take(&self, exec_id: &str) -> Option<ExecutionTicket> {
        match self.inner.lock() {
            Ok(mut inner) => inner.pending.remove(exec_id),
            Err(poisoned) => poisoned.into_inner().pending.remove(exec_id),
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().map(|i| i.pending.len()).unwrap_or(0)
    }
}
