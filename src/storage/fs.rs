//! Filesystem object store
//!
//! Each object is one file under the base directory:
//! `[u32 header length (big endian)][header][payload]`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{ObjectStore, StorageError};

pub struct FsStore {
    base_directory: PathBuf,
}

impl FsStore {
    pub fn new(base_directory: impl AsRef<Path>) -> Self {
        Self {
            base_directory: base_directory.as_ref().to_path_buf(),
        }
    }

    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    fn full_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                std::path::Component::ParentDir | std::path::Component::RootDir | std::path::Component::Prefix(_)
            )
        });
        if escapes {
            return Err(StorageError::Io {
                path: path.to_string(),
                message: "path escapes the storage directory".to_string(),
            });
        }
        Ok(self.base_directory.join(relative))
    }
}

fn io_error(path: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(path.to_string())
    } else {
        StorageError::Io {
            path: path.to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn put(&self, path: &str, header: &[u8], payload: Bytes) -> Result<(), StorageError> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }
        let mut buf = BytesMut::with_capacity(4 + header.len() + payload.len());
        buf.put_u32(header.len() as u32);
        buf.put_slice(header);
        buf.put_slice(&payload);
        tokio::fs::write(&full, &buf).await.map_err(|e| io_error(path, e))
    }

    async fn get(&self, path: &str) -> Result<(Bytes, Bytes), StorageError> {
        let full = self.full_path(path)?;
        let raw = tokio::fs::read(&full).await.map_err(|e| io_error(path, e))?;
        let mut raw = Bytes::from(raw);
        if raw.len() < 4 {
            return Err(StorageError::Encoding(format!("{} is truncated", path)));
        }
        let header_len = raw.get_u32() as usize;
        if raw.len() < header_len {
            return Err(StorageError::Encoding(format!("{} is truncated", path)));
        }
        let header = raw.split_to(header_len);
        Ok((header, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_nested_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        store
            .put("job-1/task-1", b"ARJ1", Bytes::from_static(b"[1,2,3]"))
            .await
            .unwrap();
        let (header, payload) = store.get("job-1/task-1").await.unwrap();
        assert_eq!(&header[..], b"ARJ1");
        assert_eq!(&payload[..], b"[1,2,3]");
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        let err = store.get("job-1/none").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        let err = store
            .put("../outside", b"", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
    }
}
