//! Data adapter: where results go and where inputs come from
//!
//! Inputs referencing other tasks' results (`"$$<key>"`) are resolved against
//! the context's storage map, preferring the producing peer's cache when the
//! link names one. Results are written under `{jobId}/{taskId}`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::codec::{self, EncodedPayload};
use super::metadata::create_metadata;
use super::{select_path, ObjectStore, OneOrMany, StorageError, StorageInfo, StorageLink, StorageRef};
use crate::cache::protocol::{Discovery, PeerOutcome, PeerRequest};
use crate::cache::PeerClient;
use crate::core::context::TaskContext;

const REFERENCE_PREFIX: &str = "$$";

/// Where a remote result lives: a peer cache, durable storage, or both
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_info: Option<StorageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<Discovery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Sub-path into the stored value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Placement of one task result, reported in `storing`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePlacement {
    pub storage_info: StorageInfo,
    pub metadata: Map<String, Value>,
}

#[derive(Default)]
struct ReadCache {
    links: Option<Vec<String>>,
    entries: HashMap<String, Value>,
}

pub struct DataAdapter {
    store: Arc<dyn ObjectStore>,
    peers: PeerClient,
    enable_cache: bool,
    read_cache: Mutex<ReadCache>,
}

impl DataAdapter {
    pub fn new(store: Arc<dyn ObjectStore>, peers: PeerClient, enable_cache: bool) -> Self {
        Self {
            store,
            peers,
            enable_cache,
            read_cache: Mutex::new(ReadCache::default()),
        }
    }

    pub fn create_path(job_id: &str, task_id: &str) -> String {
        format!("{}/{}", job_id, task_id)
    }

    /// Encoded result plus its placement and save-path metadata
    pub fn create_storage_info(
        ctx: &TaskContext,
        result: &Value,
        encoded: &EncodedPayload,
    ) -> StoragePlacement {
        StoragePlacement {
            storage_info: StorageInfo {
                path: Self::create_path(&ctx.job_id, &ctx.task_id),
                size: Some(encoded.size() as u64),
            },
            metadata: create_metadata(&ctx.node_name, result, &ctx.info.save_paths),
        }
    }

    pub async fn set_data(
        &self,
        job_id: &str,
        task_id: &str,
        encoded: &EncodedPayload,
    ) -> Result<StorageInfo, StorageError> {
        let path = Self::create_path(job_id, task_id);
        self.store
            .put(&path, &encoded.header, encoded.payload.clone())
            .await?;
        tracing::debug!(path = %path, size = encoded.size(), "result stored");
        Ok(StorageInfo {
            path,
            size: Some(encoded.size() as u64),
        })
    }

    /// Store a value under `{jobId}/{key}` (algorithm call inputs)
    pub async fn put_value(&self, job_id: &str, key: &str, value: &Value) -> Result<StorageInfo, StorageError> {
        let encoded = codec::encode(value)?;
        self.set_data(job_id, key, &encoded).await
    }

    pub async fn get_from_storage(&self, info: &StorageInfo) -> Result<Value, StorageError> {
        if self.enable_cache {
            if let Some(hit) = self.cached(&info.path) {
                return Ok(hit);
            }
        }
        let (header, payload) = self.store.get(&info.path).await?;
        let value = codec::decode(&header, &payload)?;
        if self.enable_cache {
            if let Ok(mut cache) = self.read_cache.lock() {
                cache.entries.insert(info.path.clone(), value.clone());
            }
        }
        Ok(value)
    }

    fn cached(&self, path: &str) -> Option<Value> {
        self.read_cache
            .lock()
            .ok()
            .and_then(|cache| cache.entries.get(path).cloned())
    }

    async fn get_from_peer(
        &self,
        discovery: &Discovery,
        task_id: &str,
        data_path: Option<&str>,
    ) -> Option<Value> {
        let request = PeerRequest {
            task_id: task_id.to_string(),
            data_path: data_path.map(str::to_string),
        };
        match self.peers.request(discovery, &request).await {
            Ok(reply) => match reply.outcome() {
                PeerOutcome::Success(value) => Some(value),
                PeerOutcome::NotAvailable(reason) | PeerOutcome::NoSuchDataPath(reason) => {
                    tracing::debug!(peer = %discovery, task_id, reason = %reason, "peer cannot serve, using storage");
                    None
                }
                PeerOutcome::Malformed => {
                    tracing::warn!(peer = %discovery, task_id, "malformed peer reply, using storage");
                    None
                }
            },
            Err(e) => {
                tracing::debug!(peer = %discovery, task_id, error = %e, "peer fetch failed, using storage");
                None
            }
        }
    }

    /// Fetch a remote result, peer first when it names one
    pub async fn get_from_peer_or_storage(&self, location: &ResultLocation) -> Result<Value, StorageError> {
        if let (Some(discovery), Some(task_id)) = (&location.discovery, &location.task_id) {
            if let Some(value) = self
                .get_from_peer(discovery, task_id, location.path.as_deref())
                .await
            {
                return Ok(value);
            }
        }
        let info = location
            .storage_info
            .as_ref()
            .ok_or_else(|| StorageError::Unreachable(location.task_id.clone().unwrap_or_default()))?;
        let value = self.get_from_storage(info).await?;
        Ok(apply_path(value, location.path.as_deref()))
    }

    /// Resolve the `storageInfo` of a completion: one location or a batch,
    /// then expand elements marked as big data
    pub async fn resolve_result(&self, storage_info: &Value) -> Result<Value, StorageError> {
        let value = match storage_info {
            Value::Array(items) => {
                let locations = items
                    .iter()
                    .map(|item| serde_json::from_value::<ResultLocation>(item.clone()))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| StorageError::Encoding(e.to_string()))?;
                let fetched = join_all(locations.iter().map(|l| self.get_from_peer_or_storage(l))).await;
                Value::Array(fetched.into_iter().collect::<Result<Vec<_>, _>>()?)
            }
            other => {
                let location: ResultLocation = serde_json::from_value(other.clone())
                    .map_err(|e| StorageError::Encoding(e.to_string()))?;
                self.get_from_peer_or_storage(&location).await?
            }
        };
        self.expand_big_data(value).await
    }

    /// Elements of the form `{info: {path, isBigData: true}}` are fetched
    /// individually; other elements are kept as they are
    async fn expand_big_data(&self, value: Value) -> Result<Value, StorageError> {
        let Value::Array(items) = value else {
            return Ok(value);
        };
        if !items.iter().any(|item| big_data_path(item).is_some()) {
            return Ok(Value::Array(items));
        }
        let resolved = join_all(items.into_iter().map(|item| async move {
            match big_data_path(&item) {
                Some(path) => {
                    let info = StorageInfo { path, size: None };
                    self.get_from_storage(&info).await
                }
                None => Ok(item),
            }
        }))
        .await;
        Ok(Value::Array(resolved.into_iter().collect::<Result<Vec<_>, _>>()?))
    }

    /// Replace every `"$$<key>"` string in the task input with its value
    pub async fn resolve_input(&self, ctx: &TaskContext) -> Result<Value, StorageError> {
        self.reset_cache_on_new_links(&ctx.storage);

        let mut references = Vec::new();
        collect_references(&ctx.input, String::new(), &mut references);
        if references.is_empty() {
            return Ok(ctx.input.clone());
        }

        let fetched = join_all(references.iter().map(|(_, key)| async move {
            let link = ctx
                .storage
                .get(key)
                .ok_or_else(|| StorageError::MissingReference(key.clone()))?;
            self.resolve_ref(key, link).await
        }))
        .await;

        let mut input = ctx.input.clone();
        for ((pointer, _), value) in references.iter().zip(fetched) {
            let value = value?;
            if let Some(slot) = input.pointer_mut(pointer) {
                *slot = value;
            }
        }
        Ok(input)
    }

    async fn resolve_ref(&self, key: &str, link: &StorageRef) -> Result<Value, StorageError> {
        match link {
            OneOrMany::One(link) => self.resolve_link(key, link).await,
            OneOrMany::Many(links) => {
                let values = join_all(links.iter().map(|l| self.resolve_link(key, l))).await;
                Ok(Value::Array(values.into_iter().collect::<Result<Vec<_>, _>>()?))
            }
        }
    }

    async fn resolve_link(&self, key: &str, link: &StorageLink) -> Result<Value, StorageError> {
        if let Some(discovery) = &link.discovery {
            if let Some(value) = self.resolve_from_peer(discovery, link).await {
                return Ok(apply_index(value, link.index));
            }
        }
        match &link.storage_info {
            Some(OneOrMany::One(info)) => {
                let value = self.get_from_storage(info).await?;
                Ok(apply_index(apply_path(value, link.path.as_deref()), link.index))
            }
            Some(OneOrMany::Many(infos)) => {
                let values = join_all(infos.iter().map(|info| self.get_from_storage(info))).await;
                let values = values
                    .into_iter()
                    .map(|v| v.map(|v| apply_path(v, link.path.as_deref())))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(values))
            }
            None => Err(StorageError::Unreachable(key.to_string())),
        }
    }

    /// All tasks must be served for the peer path to win
    async fn resolve_from_peer(&self, discovery: &Discovery, link: &StorageLink) -> Option<Value> {
        if link.tasks.is_empty() {
            return None;
        }
        let fetched = join_all(
            link.tasks
                .iter()
                .map(|task| self.get_from_peer(discovery, task, link.path.as_deref())),
        )
        .await;
        let values = fetched.into_iter().collect::<Option<Vec<_>>>()?;
        if values.len() == 1 && !matches!(link.storage_info, Some(OneOrMany::Many(_))) {
            values.into_iter().next()
        } else {
            Some(Value::Array(values))
        }
    }

    fn reset_cache_on_new_links(&self, storage: &HashMap<String, StorageRef>) {
        let mut links: Vec<String> = storage
            .values()
            .flat_map(|r| match r {
                OneOrMany::One(link) => vec![link],
                OneOrMany::Many(links) => links.iter().collect(),
            })
            .flat_map(|link| match &link.storage_info {
                Some(OneOrMany::One(info)) => vec![info.path.clone()],
                Some(OneOrMany::Many(infos)) => infos.iter().map(|i| i.path.clone()).collect(),
                None => Vec::new(),
            })
            .collect();
        links.sort();

        if let Ok(mut cache) = self.read_cache.lock() {
            if cache.links.as_ref() != Some(&links) {
                cache.entries.clear();
                cache.links = Some(links);
            }
        }
    }
}

fn apply_path(value: Value, path: Option<&str>) -> Value {
    match path {
        Some(path) => select_path(&value, path).cloned().unwrap_or(Value::Null),
        None => value,
    }
}

fn apply_index(value: Value, index: Option<usize>) -> Value {
    match (index, value) {
        (Some(i), Value::Array(mut items)) if i < items.len() => items.swap_remove(i),
        (Some(_), _) => Value::Null,
        (None, value) => value,
    }
}

fn big_data_path(item: &Value) -> Option<String> {
    let info = item.get("info")?;
    if info.get("isBigData").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    info.get("path").and_then(Value::as_str).map(str::to_string)
}

/// Collect `(json pointer, key)` for every reference string in `value`
fn collect_references(value: &Value, pointer: String, out: &mut Vec<(String, String)>) {
    match value {
        Value::String(s) => {
            if let Some(key) = s.strip_prefix(REFERENCE_PREFIX) {
                out.push((pointer, key.to_string()));
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_references(item, format!("{}/{}", pointer, i), out);
            }
        }
        Value::Object(map) => {
            for (k, item) in map {
                let escaped = k.replace('~', "~0").replace('/', "~1");
                collect_references(item, format!("{}/{}", pointer, escaped), out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn adapter(store: Arc<MemoryStore>) -> DataAdapter {
        DataAdapter::new(store, PeerClient::new(Duration::from_millis(200)), false)
    }

    fn context(input: Value, storage: Value) -> TaskContext {
        serde_json::from_value(json!({
            "jobId": "job-1",
            "taskId": "task-1",
            "nodeName": "green",
            "input": input,
            "storage": storage
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_input_replaces_references() {
        let store = Arc::new(MemoryStore::new());
        let data = adapter(store.clone());
        data.put_value("job-1", "a", &json!({"result": [5, 6, 7]})).await.unwrap();
        data.put_value("job-1", "b", &json!("plain")).await.unwrap();

        let ctx = context(
            json!(["$$first", {"nested": "$$second"}, 42, "$$third"]),
            json!({
                "first": {"storageInfo": {"path": "job-1/a"}, "path": "result"},
                "second": {"storageInfo": {"path": "job-1/b"}},
                "third": {"storageInfo": {"path": "job-1/a"}, "path": "result", "index": 2}
            }),
        );
        let input = data.resolve_input(&ctx).await.unwrap();
        assert_eq!(input, json!([[5, 6, 7], {"nested": "plain"}, 42, 7]));
    }

    #[tokio::test]
    async fn test_resolve_input_batch_storage_info() {
        let store = Arc::new(MemoryStore::new());
        let data = adapter(store.clone());
        data.put_value("job-1", "a", &json!({"v": 1})).await.unwrap();
        data.put_value("job-1", "b", &json!({"v": 2})).await.unwrap();

        let ctx = context(
            json!(["$$batch"]),
            json!({"batch": {"storageInfo": [{"path": "job-1/a"}, {"path": "job-1/b"}], "path": "v"}}),
        );
        assert_eq!(data.resolve_input(&ctx).await.unwrap(), json!([[1, 2]]));
    }

    #[tokio::test]
    async fn test_missing_reference_is_an_error() {
        let data = adapter(Arc::new(MemoryStore::new()));
        let ctx = context(json!(["$$nope"]), json!({}));
        assert!(matches!(
            data.resolve_input(&ctx).await,
            Err(StorageError::MissingReference(key)) if key == "nope"
        ));
    }

    #[tokio::test]
    async fn test_unreachable_peer_falls_back_to_storage() {
        let store = Arc::new(MemoryStore::new());
        let data = adapter(store.clone());
        data.put_value("job-1", "p", &json!([1, 2])).await.unwrap();

        let location: ResultLocation = serde_json::from_value(json!({
            "discovery": {"host": "127.0.0.1", "port": 1},
            "taskId": "producer",
            "storageInfo": {"path": "job-1/p"}
        }))
        .unwrap();
        assert_eq!(data.get_from_peer_or_storage(&location).await.unwrap(), json!([1, 2]));
    }

    #[tokio::test]
    async fn test_resolve_result_batch_and_big_data() {
        let store = Arc::new(MemoryStore::new());
        let data = adapter(store.clone());
        data.put_value("job-1", "r1", &json!("one")).await.unwrap();
        data.put_value("job-1", "big", &json!({"huge": true})).await.unwrap();
        data.put_value(
            "job-1",
            "r2",
            &json!([{"info": {"path": "job-1/big", "isBigData": true}}, 3]),
        )
        .await
        .unwrap();

        let batch = data
            .resolve_result(&json!([
                {"storageInfo": {"path": "job-1/r1"}},
                {"storageInfo": {"path": "job-1/r1"}}
            ]))
            .await
            .unwrap();
        assert_eq!(batch, json!(["one", "one"]));

        let expanded = data
            .resolve_result(&json!({"storageInfo": {"path": "job-1/r2"}}))
            .await
            .unwrap();
        assert_eq!(expanded, json!([{"huge": true}, 3]));
    }

    #[tokio::test]
    async fn test_set_data_and_placement() {
        let store = Arc::new(MemoryStore::new());
        let data = adapter(store.clone());
        let mut ctx = context(json!([]), json!({}));
        ctx.info.save_paths = vec!["green".to_string()];

        let result = json!([1, 2, 3]);
        let encoded = codec::encode(&result).unwrap();
        let placement = DataAdapter::create_storage_info(&ctx, &result, &encoded);
        assert_eq!(placement.storage_info.path, "job-1/task-1");
        assert_eq!(placement.metadata["green"], json!({"type": "array", "size": 3}));

        let info = data.set_data("job-1", "task-1", &encoded).await.unwrap();
        assert_eq!(info, placement.storage_info);
        assert!(store.contains("job-1/task-1").await);
        assert_eq!(data.get_from_storage(&info).await.unwrap(), result);
    }

    #[tokio::test]
    async fn test_read_cache_reset_when_links_change() {
        let store = Arc::new(MemoryStore::new());
        let data = DataAdapter::new(store.clone(), PeerClient::new(Duration::from_millis(200)), true);
        data.put_value("job-1", "a", &json!(1)).await.unwrap();

        let ctx = context(json!("$$x"), json!({"x": {"storageInfo": {"path": "job-1/a"}}}));
        assert_eq!(data.resolve_input(&ctx).await.unwrap(), json!(1));

        // same links: stale cached value is served
        data.put_value("job-1", "a", &json!(2)).await.unwrap();
        assert_eq!(data.resolve_input(&ctx).await.unwrap(), json!(1));

        data.put_value("job-1", "b", &json!(3)).await.unwrap();
        let ctx = context(
            json!(["$$x", "$$y"]),
            json!({
                "x": {"storageInfo": {"path": "job-1/a"}},
                "y": {"storageInfo": {"path": "job-1/b"}}
            }),
        );
        assert_eq!(data.resolve_input(&ctx).await.unwrap(), json!([2, 3]));
    }
}
