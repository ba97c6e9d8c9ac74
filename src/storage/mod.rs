//! Durable storage access
//!
//! - `ObjectStore`: the storage backend seam (filesystem and memory stores)
//! - `DataAdapter`: result placement, input resolution and peer-or-storage reads
//! - `codec`: header + payload encoding of values

mod adapter;
pub mod codec;
mod fs;
mod memory;
pub mod metadata;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use adapter::{DataAdapter, ResultLocation, StoragePlacement};
pub use codec::EncodedPayload;
pub use fs::FsStore;
pub use memory::MemoryStore;

use crate::cache::protocol::Discovery;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage io error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("unresolved storage reference {0}")]
    MissingReference(String),

    #[error("storage link {0} has neither storageInfo nor a reachable peer")]
    Unreachable(String),
}

/// Location of one stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// One or many descriptors
///
/// `Many` is listed first: untagged matching is ordered and a struct would
/// otherwise also accept a JSON array positionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

/// A `storage` map entry referenced from task input as `"$$<key>"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageLink {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_info: Option<OneOrMany<StorageInfo>>,
    /// Producer that may still serve the value from its peer cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<Discovery>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<String>,
    /// Dot separated sub-path into the fetched value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl StorageLink {
    pub fn from_info(info: StorageInfo) -> Self {
        Self {
            storage_info: Some(OneOrMany::One(info)),
            discovery: None,
            tasks: Vec::new(),
            path: None,
            index: None,
        }
    }
}

/// Storage map value: a single link or a batch of links
pub type StorageRef = OneOrMany<StorageLink>;

/// Storage backend
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, header: &[u8], payload: Bytes) -> Result<(), StorageError>;

    /// Returns `(header, payload)`
    async fn get(&self, path: &str) -> Result<(Bytes, Bytes), StorageError>;
}

/// Navigate a dot separated path; numeric segments index arrays
pub fn select_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
