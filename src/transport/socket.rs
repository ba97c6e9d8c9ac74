//! WebSocket connection to the worker
//!
//! The connection task owns the socket; callers only see an unbounded queue
//! of outgoing messages and a stream of `SocketEvent`s. Abnormal closes and
//! refused connections are retried after the reconnect interval, a normal
//! close (1000) ends the task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::message::{IncomingMessage, OutgoingCommand, OutgoingMessage};
use super::{TransportError, WorkerChannel};
use crate::config::{SocketConfig, StorageMode};

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

#[derive(Debug)]
pub enum SocketEvent {
    Connected,
    /// The worker closed the connection normally; no reconnect follows
    Disconnected(Option<u16>),
    Message(IncomingMessage),
}

/// Limits how often a noisy command is logged
#[derive(Debug)]
pub struct LogThrottle {
    delays: HashMap<OutgoingCommand, Duration>,
    last: HashMap<OutgoingCommand, Instant>,
}

impl LogThrottle {
    pub fn new() -> Self {
        let mut delays = HashMap::new();
        delays.insert(OutgoingCommand::Stopping, Duration::from_secs(10));
        Self {
            delays,
            last: HashMap::new(),
        }
    }

    pub fn should_log(&mut self, command: OutgoingCommand, now: Instant) -> bool {
        let Some(delay) = self.delays.get(&command) else {
            return true;
        };
        match self.last.get(&command) {
            Some(last) if now.duration_since(*last) <= *delay => false,
            _ => {
                self.last.insert(command, now);
                true
            }
        }
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WorkerSocket {
    url: String,
    outgoing: mpsc::UnboundedSender<OutgoingMessage>,
    /// Messages queued but not yet written to the socket
    unsent: Arc<watch::Sender<usize>>,
    throttle: Mutex<LogThrottle>,
}

impl WorkerSocket {
    /// `url` if configured, otherwise `{protocol}://{host}:{port}`, always
    /// followed by the encoding and storage mode query
    pub fn create_url(socket: &SocketConfig, storage_mode: StorageMode) -> String {
        let base = match &socket.url {
            Some(url) => url.clone(),
            None => format!("{}://{}:{}", socket.protocol, socket.host, socket.port),
        };
        format!(
            "{}?encoding={}&storage={}",
            base,
            socket.encoding,
            storage_mode.as_str()
        )
    }

    /// Start the connection task
    pub fn connect(
        url: String,
        reconnect_interval: Duration,
        max_payload: Option<usize>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SocketEvent>) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (unsent, _) = watch::channel(0usize);
        let unsent = Arc::new(unsent);

        tracing::info!("trying to connect to {}", url);
        let connection = Connection {
            url: url.clone(),
            reconnect_interval,
            max_payload,
            unsent: Arc::clone(&unsent),
        };
        tokio::spawn(connection.run(outgoing_rx, event_tx));

        let socket = Arc::new(Self {
            url,
            outgoing: outgoing_tx,
            unsent,
            throttle: Mutex::new(LogThrottle::new()),
        });
        (socket, event_rx)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wait until every queued message was written; false on timeout
    pub async fn flush(&self, timeout: Duration) -> bool {
        let mut rx = self.unsent.subscribe();
        tokio::time::timeout(timeout, async move {
            let _ = rx.wait_for(|n| *n == 0).await;
        })
        .await
        .is_ok()
    }
}

impl WorkerChannel for WorkerSocket {
    fn send(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        let log = self
            .throttle
            .lock()
            .map(|mut t| t.should_log(message.command, Instant::now()))
            .unwrap_or(true);
        if log {
            tracing::info!(command = message.command.as_str(), "sending message to worker");
        }
        self.unsent.send_modify(|n| *n += 1);
        self.outgoing.send(message).map_err(|_| {
            self.unsent.send_modify(|n| *n = n.saturating_sub(1));
            TransportError::Closed
        })
    }
}

struct Connection {
    url: String,
    reconnect_interval: Duration,
    max_payload: Option<usize>,
    unsent: Arc<watch::Sender<usize>>,
}

impl Connection {
    async fn run(
        self,
        mut outgoing: mpsc::UnboundedReceiver<OutgoingMessage>,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) {
        // A frame whose write failed is resent first after reconnecting
        let mut pending: Option<String> = None;

        loop {
            if events.is_closed() {
                return;
            }
            let mut config = WebSocketConfig::default();
            if let Some(max) = self.max_payload {
                config.max_message_size = Some(max);
            }

            let ws = match tokio_tungstenite::connect_async_with_config(self.url.as_str(), Some(config), false).await {
                Ok((ws, _)) => ws,
                Err(e) => {
                    let error = TransportError::Connect {
                        url: self.url.clone(),
                        message: e.to_string(),
                    };
                    tracing::debug!("{}, retrying", error);
                    tokio::time::sleep(self.reconnect_interval).await;
                    continue;
                }
            };
            tracing::debug!("connected to {}", self.url);
            let _ = events.send(SocketEvent::Connected);

            let (mut sink, mut stream) = ws.split();
            if let Some(text) = pending.take() {
                if let Err(e) = sink.send(WsMessage::Text(text.clone())).await {
                    tracing::warn!("resend after reconnect failed: {}", e);
                    pending = Some(text);
                    tokio::time::sleep(self.reconnect_interval).await;
                    continue;
                }
                self.written();
            }

            let close_code = loop {
                tokio::select! {
                    message = outgoing.recv() => match message {
                        Some(message) => {
                            let text = match serde_json::to_string(&message) {
                                Ok(text) => text,
                                Err(e) => {
                                    let error = TransportError::Encode {
                                        command: message.command.as_str().to_string(),
                                        message: e.to_string(),
                                    };
                                    tracing::error!("{}", error);
                                    self.written();
                                    continue;
                                }
                            };
                            if let Err(e) = sink.send(WsMessage::Text(text.clone())).await {
                                tracing::warn!("send to worker failed: {}", e);
                                pending = Some(text);
                                break None;
                            }
                            self.written();
                        }
                        None => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            return;
                        }
                    },
                    frame = stream.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => self.forward(text.as_bytes(), &events),
                        Some(Ok(WsMessage::Binary(bytes))) => self.forward(&bytes, &events),
                        Some(Ok(WsMessage::Close(frame))) => break frame.map(|f| u16::from(f.code)),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!("worker connection error: {}", e);
                            break None;
                        }
                        None => break None,
                    },
                }
            };

            match close_code {
                Some(CLOSE_NORMAL) => {
                    tracing::debug!("disconnected from {}", self.url);
                    let _ = events.send(SocketEvent::Disconnected(close_code));
                    return;
                }
                Some(CLOSE_TRY_AGAIN_LATER) => {
                    tracing::info!("Another client is already connected for debug");
                }
                _ => {}
            }
            tokio::time::sleep(self.reconnect_interval).await;
        }
    }

    fn written(&self) {
        self.unsent.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn forward(&self, frame: &[u8], events: &mpsc::UnboundedSender<SocketEvent>) {
        match serde_json::from_slice::<IncomingMessage>(frame) {
            Ok(message) => {
                tracing::info!(command = %message.command, "got message from worker");
                let _ = events.send(SocketEvent::Message(message));
            }
            Err(e) => tracing::warn!("dropping undecodable worker frame: {}", e),
        }
    }
}
