//! Streaming interface of stream nodes
//!
//! Inbound messages are relayed by the worker (`streamingInMessage`) and
//! handed to the registered input listener. Outbound messages go through a
//! `FlowRouter`; the default router relays them back to the worker, which
//! owns the flow graph and delivers them downstream.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;

use crate::transport::{OutgoingCommand, OutgoingMessage, TransportError, WorkerChannel};

#[derive(Error, Debug)]
pub enum StreamingError {
    #[error("failed to route streaming message: {0}")]
    Route(#[from] TransportError),

    #[error("no input listener registered")]
    NoListener,

    #[error("input listener panicked")]
    ListenerPanicked,
}

/// Payload of `streamingInMessage`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_message_id: Option<String>,
}

/// Decides where an outbound message goes
pub trait FlowRouter: Send + Sync {
    fn route(
        &self,
        message: Value,
        flow_name: Option<&str>,
        send_message_id: Option<&str>,
    ) -> Result<(), StreamingError>;
}

/// Relays every outbound message to the worker as `streamingOutMessage`
pub struct WorkerRelayRouter {
    channel: Arc<dyn WorkerChannel>,
}

impl WorkerRelayRouter {
    pub fn new(channel: Arc<dyn WorkerChannel>) -> Self {
        Self { channel }
    }
}

impl FlowRouter for WorkerRelayRouter {
    fn route(
        &self,
        message: Value,
        flow_name: Option<&str>,
        send_message_id: Option<&str>,
    ) -> Result<(), StreamingError> {
        let mut data = json!({ "message": message });
        if let Some(flow_name) = flow_name {
            data["flowName"] = json!(flow_name);
        }
        if let Some(id) = send_message_id {
            data["sendMessageId"] = json!(id);
        }
        self.channel
            .send(OutgoingMessage::with_data(OutgoingCommand::StreamingOutMessage, data))?;
        Ok(())
    }
}

/// Sends results produced for one inbound message
#[derive(Clone)]
pub struct MessageSender {
    router: Arc<dyn FlowRouter>,
    send_message_id: Option<String>,
}

impl MessageSender {
    pub fn send(&self, message: Value, flow_name: Option<&str>) -> Result<(), StreamingError> {
        self.router
            .route(message, flow_name, self.send_message_id.as_deref())
    }
}

/// One inbound message as seen by the input listener
#[derive(Clone)]
pub struct InboundMessage {
    pub payload: Value,
    pub origin: Option<String>,
    pub sender: MessageSender,
}

pub type InputListener = Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct StreamingManager {
    router: Arc<dyn FlowRouter>,
    listener: RwLock<Option<InputListener>>,
    listening: AtomicBool,
    in_flight: watch::Sender<usize>,
}

impl StreamingManager {
    pub fn new(router: Arc<dyn FlowRouter>) -> Self {
        let (in_flight, _) = watch::channel(0usize);
        Self {
            router,
            listener: RwLock::new(None),
            listening: AtomicBool::new(false),
            in_flight,
        }
    }

    pub fn register_input_listener(&self, listener: InputListener) {
        if let Ok(mut current) = self.listener.write() {
            *current = Some(listener);
        }
    }

    pub fn start_message_listening(&self) {
        self.listening.store(true, Ordering::SeqCst);
        tracing::debug!("message listening started");
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Deliver one inbound message and wait for its listener to finish
    pub async fn on_message(&self, message: StreamMessage) -> Result<(), StreamingError> {
        if !self.is_listening() {
            tracing::warn!(origin = ?message.origin, "dropping stream message, not listening");
            return Ok(());
        }
        let listener = self
            .listener
            .read()
            .ok()
            .and_then(|l| l.clone())
            .ok_or(StreamingError::NoListener)?;

        let inbound = InboundMessage {
            payload: message.payload,
            origin: message.origin,
            sender: MessageSender {
                router: Arc::clone(&self.router),
                send_message_id: message.send_message_id,
            },
        };
        let _in_flight = InFlight::enter(&self.in_flight);
        AssertUnwindSafe(listener(inbound))
            .catch_unwind()
            .await
            .map_err(|_| StreamingError::ListenerPanicked)
    }

    /// Send a message on behalf of the algorithm (stateful streams)
    pub fn send_message(&self, message: Value, flow_name: Option<&str>) -> Result<(), StreamingError> {
        self.router.route(message, flow_name, None)
    }

    /// Stop listening; a non-forced stop also waits for in-flight messages
    pub async fn stop_streaming(&self, force: bool) {
        self.listening.store(false, Ordering::SeqCst);
        if force {
            tracing::info!("streaming stopped without draining");
            return;
        }
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
        tracing::info!("streaming drained and stopped");
    }
}

/// Counts one delivery until dropped, also when the listener unwinds or
/// the delivery is cancelled
struct InFlight<'a>(&'a watch::Sender<usize>);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a watch::Sender<usize>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Captured(Mutex<Vec<(Value, Option<String>, Option<String>)>>);

    impl FlowRouter for Captured {
        fn route(&self, message: Value, flow: Option<&str>, id: Option<&str>) -> Result<(), StreamingError> {
            self.0
                .lock()
                .unwrap()
                .push((message, flow.map(str::to_string), id.map(str::to_string)));
            Ok(())
        }
    }

    fn message(payload: Value, id: &str) -> StreamMessage {
        StreamMessage {
            payload,
            origin: Some("upstream".to_string()),
            send_message_id: Some(id.to_string()),
        }
    }

    #[tokio::test]
    async fn test_listener_replies_carry_message_id() {
        let router = Arc::new(Captured::default());
        let manager = StreamingManager::new(router.clone());
        manager.register_input_listener(Arc::new(|inbound: InboundMessage| {
            async move {
                let _ = inbound.sender.send(inbound.payload, Some("main"));
            }
            .boxed()
        }));
        manager.start_message_listening();
        manager.on_message(message(json!(1), "m-1")).await.unwrap();

        let routed = router.0.lock().unwrap();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0], (json!(1), Some("main".to_string()), Some("m-1".to_string())));
    }

    #[tokio::test]
    async fn test_not_listening_drops_message() {
        let router = Arc::new(Captured::default());
        let manager = StreamingManager::new(router.clone());
        manager.on_message(message(json!(1), "m-1")).await.unwrap();
        assert!(router.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_draining_stop_waits_for_in_flight() {
        let manager = Arc::new(StreamingManager::new(Arc::new(Captured::default())));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        manager.register_input_listener(Arc::new(move |_inbound: InboundMessage| {
            let release_rx = Arc::clone(&release_rx);
            async move {
                if let Some(rx) = release_rx.lock().await.take() {
                    let _ = rx.await;
                }
            }
            .boxed()
        }));
        manager.start_message_listening();

        let delivering = Arc::clone(&manager);
        let delivery = tokio::spawn(async move { delivering.on_message(message(json!(1), "m-1")).await });
        while manager.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let stopping = Arc::clone(&manager);
        let stop = tokio::spawn(async move { stopping.stop_streaming(false).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stop.is_finished());

        release_tx.send(()).unwrap();
        delivery.await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(1), stop).await.unwrap().unwrap();
        assert!(!manager.is_listening());
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_block_drain() {
        let manager = StreamingManager::new(Arc::new(Captured::default()));
        manager.register_input_listener(Arc::new(|inbound: InboundMessage| {
            async move {
                if inbound.payload == json!("boom") {
                    panic!("listener failed");
                }
            }
            .boxed()
        }));
        manager.start_message_listening();

        let err = manager.on_message(message(json!("boom"), "m-1")).await.unwrap_err();
        assert!(matches!(err, StreamingError::ListenerPanicked));
        assert_eq!(manager.in_flight(), 0);

        tokio::time::timeout(Duration::from_millis(200), manager.stop_streaming(false))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_delivery_releases_in_flight() {
        let manager = Arc::new(StreamingManager::new(Arc::new(Captured::default())));
        manager.register_input_listener(Arc::new(|_inbound: InboundMessage| {
            futures_util::future::pending::<()>().boxed()
        }));
        manager.start_message_listening();

        let delivering = Arc::clone(&manager);
        let delivery = tokio::spawn(async move { delivering.on_message(message(json!(1), "m-1")).await });
        while manager.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        delivery.abort();
        let _ = delivery.await;
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_forced_stop_returns_immediately() {
        let manager = StreamingManager::new(Arc::new(Captured::default()));
        manager.start_message_listening();
        tokio::time::timeout(Duration::from_millis(100), manager.stop_streaming(true))
            .await
            .unwrap();
        assert!(!manager.is_listening());
    }
}
