//! Worker transport
//!
//! - `message`: `{command, data}` envelopes and their parsing
//! - `socket`: the reconnecting WebSocket connection to the worker
//! - `WorkerChannel`: the send side every component writes through
//! - `RecordingChannel`: in-memory channel for tests

pub mod message;
mod recording;
mod socket;

use thiserror::Error;

pub use message::{IncomingCommand, IncomingMessage, OutgoingCommand, OutgoingMessage};
pub use recording::RecordingChannel;
pub use socket::{LogThrottle, SocketEvent, WorkerSocket};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("worker channel is closed")]
    Closed,

    #[error("failed to encode {command} message: {message}")]
    Encode { command: String, message: String },

    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },
}

/// Send side of the worker connection.
///
/// Sending never blocks; messages are queued until the connection can take
/// them and are kept across reconnects.
pub trait WorkerChannel: Send + Sync {
    fn send(&self, message: OutgoingMessage) -> Result<(), TransportError>;
}
