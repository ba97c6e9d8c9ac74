//! Peer data cache
//!
//! A small request/reply responder that serves the most recent task output
//! to sibling tasks before (or instead of) a round trip through storage.
//! One live `SendingState` per process; replacing it and answering a request
//! both go through the same lock, so a reply never straddles a swap.

mod client;
pub mod protocol;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

pub use client::PeerClient;
use protocol::{Discovery, PeerReply, PeerRequest};

use crate::storage::{codec, select_path};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to bind peer cache on {address}: {message}")]
    Bind { address: String, message: String },

    #[error("peer io error with {address}: {message}")]
    Io { address: String, message: String },

    #[error("peer {0} did not answer in time")]
    Timeout(String),

    #[error("peer protocol error: {0}")]
    Protocol(String),
}

/// The single output the cache is prepared to serve
#[derive(Debug, Clone)]
struct SendingState {
    task_id: String,
    payload: Bytes,
    header: Bytes,
    size: usize,
}

pub struct PeerDataCache {
    state: Mutex<Option<SendingState>>,
    discovery: Discovery,
    local_addr: SocketAddr,
    token: CancellationToken,
    closed: AtomicBool,
    in_flight: watch::Sender<usize>,
    parent_span: Mutex<Option<tracing::Span>>,
}

impl PeerDataCache {
    /// Bind the responder and start accepting peers.
    ///
    /// `host` is also the address advertised to peers in `storing`; a port of
    /// 0 picks a free port.
    pub async fn bind(host: &str, port: u16) -> Result<Arc<Self>, CacheError> {
        let address = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&address).await.map_err(|e| CacheError::Bind {
            address: address.clone(),
            message: e.to_string(),
        })?;
        let local_addr = listener.local_addr().map_err(|e| CacheError::Bind {
            address: address.clone(),
            message: e.to_string(),
        })?;
        let (in_flight, _) = watch::channel(0usize);

        let cache = Arc::new(Self {
            state: Mutex::new(None),
            discovery: Discovery::new(host, local_addr.port()),
            local_addr,
            token: CancellationToken::new(),
            closed: AtomicBool::new(false),
            in_flight,
            parent_span: Mutex::new(None),
        });
        tracing::info!("Peer cache listening on {}", local_addr);

        let server = Arc::clone(&cache);
        tokio::spawn(async move { server.accept_loop(listener).await });
        Ok(cache)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let cache = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = cache.handle_connection(stream).await {
                                tracing::debug!("Peer connection {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Peer cache accept error: {}", e),
                },
            }
        }
        tracing::debug!("Peer cache accept loop stopped");
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), std::io::Error> {
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        loop {
            let frame = tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                frame = framed.next() => match frame {
                    Some(frame) => frame?,
                    None => return Ok(()),
                },
            };

            self.in_flight.send_modify(|n| *n += 1);
            let reply = match serde_json::from_slice::<PeerRequest>(&frame) {
                Ok(request) => self.create_reply(&request),
                Err(e) => PeerReply::malformed(e.to_string()),
            };
            let sent = match serde_json::to_vec(&reply) {
                Ok(body) => framed.send(Bytes::from(body)).await,
                Err(e) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            };
            self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
            sent?;
        }
    }

    /// Answer one peer request against a snapshot of the live state
    pub fn create_reply(&self, request: &PeerRequest) -> PeerReply {
        let parent = self
            .parent_span
            .lock()
            .ok()
            .and_then(|span| span.as_ref().and_then(|s| s.id()));
        let span = tracing::debug_span!(parent: parent, "cache.reply", task_id = %request.task_id);
        let _entered = span.enter();

        let snapshot = match self.state.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let state = match snapshot {
            Some(state) if state.task_id == request.task_id => state,
            other => {
                let current = other.as_ref().map(|s| s.task_id.as_str());
                return PeerReply::not_available(current);
            }
        };

        let data = match codec::decode(&state.header, &state.payload) {
            Ok(data) => data,
            Err(e) => return PeerReply::malformed(e.to_string()),
        };
        match request.data_path.as_deref() {
            None | Some("") => PeerReply::success(data),
            Some(path) => match select_path(&data, path) {
                Some(value) => PeerReply::success(value.clone()),
                None => PeerReply::no_such_data_path(path),
            },
        }
    }

    /// Replace the live state; false once the cache is closed
    pub fn set_sending_state(&self, task_id: &str, payload: Bytes, size: usize, header: Bytes) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let next = SendingState {
            task_id: task_id.to_string(),
            payload,
            header,
            size,
        };
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracing::debug!(task_id, size = next.size, "serving new result");
        *state = Some(next);
        true
    }

    /// Drop the live state; later requests are answered as not available
    pub fn end_sending_state(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = None;
        }
    }

    /// Whether a result is currently held for peers
    pub fn is_serving(&self) -> bool {
        self.state.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Resolve once no reply is being produced or written
    pub async fn wait_till_serving_is_done(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stop accepting peers and drop the live state; idempotent
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.end_sending_state();
        self.token.cancel();
        tracing::info!("Peer cache on {} closed", self.local_addr);
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Address peers are told to fetch from, sent with `storing`
    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Bound listener address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Replies are recorded under this span until cleared
    pub fn set_parent_span(&self, span: Option<tracing::Span>) {
        if let Ok(mut parent) = self.parent_span.lock() {
            *parent = span;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn offer(cache: &PeerDataCache, task_id: &str, value: serde_json::Value) -> bool {
        let encoded = codec::encode(&value).unwrap();
        let size = encoded.size();
        cache.set_sending_state(task_id, encoded.payload, size, encoded.header)
    }

    fn request(task_id: &str, data_path: Option<&str>) -> PeerRequest {
        PeerRequest {
            task_id: task_id.to_string(),
            data_path: data_path.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_latest_state_wins() {
        let cache = PeerDataCache::bind("127.0.0.1", 0).await.unwrap();
        assert!(offer(&cache, "task-a", json!({"v": "a"})));
        assert!(offer(&cache, "task-b", json!({"v": "b"})));

        assert_eq!(
            cache.create_reply(&request("task-a", None)),
            PeerReply::not_available(Some("task-b"))
        );
        assert_eq!(
            cache.create_reply(&request("task-b", None)),
            PeerReply::success(json!({"v": "b"}))
        );
        cache.close();
    }

    #[tokio::test]
    async fn test_data_path_selection() {
        let cache = PeerDataCache::bind("127.0.0.1", 0).await.unwrap();
        offer(&cache, "task-a", json!({"data": {"engine": [1, 2]}}));
        assert_eq!(
            cache.create_reply(&request("task-a", Some("data.engine.1"))),
            PeerReply::success(json!(2))
        );
        assert_eq!(
            cache.create_reply(&request("task-a", Some("data.missing"))),
            PeerReply::no_such_data_path("data.missing")
        );
        cache.close();
    }

    #[tokio::test]
    async fn test_serving_flag_and_close() {
        let cache = PeerDataCache::bind("127.0.0.1", 0).await.unwrap();
        assert!(!cache.is_serving());
        offer(&cache, "task-a", json!(1));
        assert!(cache.is_serving());
        cache.end_sending_state();
        cache.end_sending_state();
        assert!(!cache.is_serving());

        cache.close();
        cache.close();
        assert!(cache.is_closed());
        assert!(!offer(&cache, "task-b", json!(2)));
        tokio::time::timeout(Duration::from_secs(1), cache.wait_till_serving_is_done())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_client_round_trip_over_tcp() {
        let cache = PeerDataCache::bind("127.0.0.1", 0).await.unwrap();
        offer(&cache, "task-a", json!([3, 2, 1]));

        let client = PeerClient::new(Duration::from_secs(2));
        let reply = client
            .request(cache.discovery(), &request("task-a", None))
            .await
            .unwrap();
        assert_eq!(reply, PeerReply::success(json!([3, 2, 1])));

        let reply = client
            .request(cache.discovery(), &request("other", None))
            .await
            .unwrap();
        assert!(matches!(reply.outcome(), protocol::PeerOutcome::NotAvailable(_)));
        cache.close();
    }
}
