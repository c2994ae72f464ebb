//! `object_store` wrapper with optional key prefix.

use std::path::Path as FsPath;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, ObjectStoreExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::StorageError;
use crate::config::{S3Config, StorageBackendConfig, StorageConfig, StorageKind, non_empty};

/// A listed object, keyed relative to the storage prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

impl ObjectInfo {
    /// Last path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

#[derive(Clone)]
pub struct Storage {
    kind: StorageKind,
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl Storage {
    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    pub fn kind_str(&self) -> &'static str {
        self.kind.as_str()
    }

    pub async fn new(cfg: StorageConfig) -> Result<Self, StorageError> {
        let (kind, store) = match cfg.backend {
            StorageBackendConfig::S3(s3) => (StorageKind::S3, Arc::new(build_s3(s3)?) as _),
            StorageBackendConfig::Filesystem { root } => {
                ensure_dir(&root)?;
                let fs = object_store::local::LocalFileSystem::new_with_prefix(&root)?;
                (StorageKind::Filesystem, Arc::new(fs) as _)
            }
            StorageBackendConfig::Memory => {
                let mem = object_store::memory::InMemory::new();
                (StorageKind::Memory, Arc::new(mem) as _)
            }
        };

        let prefix = cfg
            .prefix
            .and_then(non_empty)
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());

        tracing::info!(backend = kind.as_str(), prefix = ?prefix, "Object storage ready");

        Ok(Self {
            kind,
            store,
            prefix,
        })
    }

    pub async fn from_env() -> Result<Self, StorageError> {
        Self::new(StorageConfig::from_env()?).await
    }

    fn to_path(&self, key: &str) -> Result<Path, StorageError> {
        let key = key.trim_matches('/');
        if key.is_empty() {
            return Err(StorageError::InvalidKey(
                "object key must not be empty".to_string(),
            ));
        }

        let joined = match self.prefix.as_deref() {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        };

        Ok(Path::from(joined))
    }

    fn to_info(&self, meta: ObjectMeta) -> ObjectInfo {
        let location = meta.location.as_ref();
        let key = match self.prefix.as_deref() {
            Some(prefix) => location
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(location),
            None => location,
        };
        ObjectInfo {
            key: key.to_string(),
            size: meta.size,
            last_modified: meta.last_modified,
        }
    }

    pub async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        let path = self.to_path(key)?;
        self.store
            .put(&path, object_store::PutPayload::from(bytes))
            .await?;
        Ok(())
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.to_path(key)?;
        match self.store.get(&path).await {
            Ok(res) => Ok(res.bytes().await?),
            Err(object_store::Error::NotFound { .. }) => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete an object; deleting a missing key is not an error.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.to_path(key)?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)?;
        self.put_bytes(key, Bytes::from(bytes)).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, StorageError> {
        let bytes = self.get_bytes(key).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// List every object under `prefix`, recursively.
    ///
    /// Prefixes match whole path segments: `jobs/job-1` lists
    /// `jobs/job-1/...` but not `jobs/job-10.json`.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let path = self.to_path(prefix)?;
        let metas: Vec<ObjectMeta> = self.store.list(Some(&path)).try_collect().await?;
        Ok(metas.into_iter().map(|m| self.to_info(m)).collect())
    }

    /// Reachability check: fetch at most one listing entry.
    pub async fn ping(&self) -> Result<(), StorageError> {
        let root = self.prefix.as_deref().map(Path::from);
        match self.store.list(root.as_ref()).next().await {
            Some(Err(e)) => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn ensure_dir(root: &FsPath) -> Result<(), StorageError> {
    std::fs::create_dir_all(root)?;
    Ok(())
}

fn build_s3(cfg: S3Config) -> Result<object_store::aws::AmazonS3, StorageError> {
    let mut builder = object_store::aws::AmazonS3Builder::new()
        .with_bucket_name(cfg.bucket)
        .with_region(cfg.region)
        .with_virtual_hosted_style_request(cfg.virtual_hosted_style)
        .with_allow_http(cfg.allow_http);

    if let Some(endpoint) = cfg.endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    if let Some(access_key_id) = cfg.access_key_id {
        builder = builder.with_access_key_id(access_key_id);
    }
    if let Some(secret_access_key) = cfg.secret_access_key {
        builder = builder.with_secret_access_key(secret_access_key);
    }
    if let Some(session_token) = cfg.session_token {
        builder = builder.with_token(session_token);
    }

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;

    #[tokio::test]
    async fn in_memory_round_trip() -> Result<(), StorageError> {
        let storage = Storage::new(StorageConfig::memory()).await?;
        storage.put_bytes("hello.txt", Bytes::from("hi")).await?;
        let got = storage.get_bytes("hello.txt").await?;
        assert_eq!(got, Bytes::from("hi"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_object_is_not_found() -> Result<(), StorageError> {
        let storage = Storage::new(StorageConfig::memory()).await?;
        let got = storage.get_bytes("nope.json").await;
        assert!(matches!(got, Err(StorageError::NotFound(key)) if key == "nope.json"));
        storage.delete("nope.json").await?;
        Ok(())
    }

    #[tokio::test]
    async fn listing_is_segment_scoped_and_prefix_relative() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let storage =
            Storage::new(StorageConfig::filesystem(dir.path()).with_prefix("tenant-a/")).await?;

        storage.put_json("jobs/job-1.json", &serde_json::json!({ "a": 1 })).await?;
        storage.put_bytes("jobs/job-1/completed/x.marker", Bytes::from("1")).await?;
        storage.put_bytes("jobs/job-10.json", Bytes::from("{}")).await?;

        let mut under_parent = storage.list("jobs/job-1").await?;
        under_parent.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(under_parent.len(), 1);
        assert_eq!(under_parent[0].key, "jobs/job-1/completed/x.marker");
        assert_eq!(under_parent[0].file_name(), "x.marker");

        let all = storage.list("jobs").await?;
        assert_eq!(all.len(), 3);

        let value: serde_json::Value = storage.get_json("jobs/job-1.json").await?;
        assert_eq!(value["a"], 1);
        storage.ping().await?;
        Ok(())
    }

    #[tokio::test]
    async fn empty_key_is_rejected() -> Result<(), StorageError> {
        let storage = Storage::new(StorageConfig::memory()).await?;
        let got = storage.put_bytes("/", Bytes::from("x")).await;
        assert!(matches!(got, Err(StorageError::InvalidKey(_))));
        Ok(())
    }
}
