//! Peer cache client: one connection per request

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::protocol::{Discovery, PeerReply, PeerRequest};
use super::CacheError;

#[derive(Debug, Clone)]
pub struct PeerClient {
    timeout: Duration,
}

impl PeerClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send one request and wait for its reply, bounded by the client timeout
    pub async fn request(
        &self,
        discovery: &Discovery,
        request: &PeerRequest,
    ) -> Result<PeerReply, CacheError> {
        let address = discovery.address();
        match tokio::time::timeout(self.timeout, Self::exchange(&address, request)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(address)),
        }
    }

    async fn exchange(address: &str, request: &PeerRequest) -> Result<PeerReply, CacheError> {
        let stream = TcpStream::connect(address).await.map_err(|e| CacheError::Io {
            address: address.to_string(),
            message: e.to_string(),
        })?;
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        let body = serde_json::to_vec(request).map_err(|e| CacheError::Protocol(e.to_string()))?;
        framed.send(Bytes::from(body)).await.map_err(|e| CacheError::Io {
            address: address.to_string(),
            message: e.to_string(),
        })?;

        let frame = match framed.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                return Err(CacheError::Io {
                    address: address.to_string(),
                    message: e.to_string(),
                })
            }
            None => return Err(CacheError::Protocol(format!("{} closed without a reply", address))),
        };
        serde_json::from_slice(&frame).map_err(|e| CacheError::Protocol(e.to_string()))
    }
}
