//! Object storage contract used by durable orchestrator state.
//!
//! Execution records are small JSON documents. Durable registries keep them in
//! object storage and rely on conditional writes for optimistic concurrency:
//! every write names the version it read, and a stale version is rejected
//! instead of overwriting a concurrent writer.
//!
//! The version token is an opaque `String` so backends can use whatever they
//! natively expose (a numeric generation, an `ETag`, a version ID).

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object version token for CAS operations.
    pub version: String,
}

/// Storage backend trait for object storage.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads entire object.
    ///
    /// Returns `Error::NotFound` if object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with optional precondition.
    ///
    /// Never returns an error for a precondition failure; that is a normal
    /// [`WriteResult::PreconditionFailed`] result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Lists objects with the given prefix, in arbitrary order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production. Versions are
/// numeric generations rendered as strings.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            version: self.version.to_string(),
        }
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(poison_err)?;
        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(poison_err)?;
        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(poison_err)?;
        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(poison_err)?;
        Ok(objects.get(path).map(|obj| obj.meta(path)))
    }
}

/// Storage backend over an [`ObjectStore`] (GCS in production).
///
/// Version tokens join the store's entity tag and object version (the GCS
/// generation) as `{e_tag}#{version}`, so conditional updates hand the store
/// whichever of the two it checks.
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBackend {
    /// Wraps an existing object store.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Connects to a GCS bucket using ambient credentials.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the client cannot be configured.
    pub fn gcs(bucket: &str) -> Result<Self> {
        let store = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| {
                Error::storage_with_source(format!("failed to configure GCS bucket {bucket}"), e)
            })?;
        Ok(Self::new(Arc::new(store)))
    }

    /// Creates a backend over a process-local store. Contents die with the process.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// Selects a store from a location string.
    ///
    /// `memory://` is process-local; `gs://bucket` or a bare bucket name is GCS.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for any other scheme, or a storage
    /// error if the GCS client cannot be configured.
    pub fn from_bucket(location: &str) -> Result<Self> {
        let location = location.trim();
        if location == "memory://" {
            return Ok(Self::in_memory());
        }
        let bucket = location
            .strip_prefix("gs://")
            .unwrap_or(location)
            .trim_end_matches('/');
        if bucket.is_empty() || bucket.contains("://") || bucket.contains('/') {
            return Err(Error::InvalidInput(format!(
                "unsupported storage location: {location}"
            )));
        }
        Self::gcs(bucket)
    }
}

fn version_token(e_tag: Option<&str>, version: Option<&str>) -> String {
    format!(
        "{}#{}",
        e_tag.unwrap_or_default(),
        version.unwrap_or_default()
    )
}

fn update_version(token: &str) -> UpdateVersion {
    let (e_tag, version) = token.rsplit_once('#').unwrap_or((token, ""));
    let present = |s: &str| (!s.is_empty()).then(|| s.to_string());
    UpdateVersion {
        e_tag: present(e_tag),
        version: present(version),
    }
}

fn convert_meta(meta: &object_store::ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        path: meta.location.to_string(),
        version: version_token(meta.e_tag.as_deref(), meta.version.as_deref()),
    }
}

fn store_error(path: &str, err: object_store::Error) -> Error {
    match err {
        object_store::Error::NotFound { .. } => {
            Error::NotFound(format!("object not found: {path}"))
        }
        other => Error::storage_with_source(format!("object store request for {path} failed"), other),
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let result = self
            .store
            .get(&Path::from(path))
            .await
            .map_err(|e| store_error(path, e))?;
        result.bytes().await.map_err(|e| store_error(path, e))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mode = match &precondition {
            WritePrecondition::DoesNotExist => PutMode::Create,
            WritePrecondition::MatchesVersion(token) => PutMode::Update(update_version(token)),
            WritePrecondition::None => PutMode::Overwrite,
        };
        let options = PutOptions {
            mode,
            ..PutOptions::default()
        };

        match self
            .store
            .put_opts(&Path::from(path), PutPayload::from(data), options)
            .await
        {
            Ok(result) => Ok(WriteResult::Success {
                version: version_token(result.e_tag.as_deref(), result.version.as_deref()),
            }),
            Err(
                object_store::Error::AlreadyExists { .. }
                | object_store::Error::Precondition { .. }
                | object_store::Error::NotFound { .. },
            ) => {
                let current_version = self
                    .head(path)
                    .await?
                    .map_or_else(String::new, |meta| meta.version);
                Ok(WriteResult::PreconditionFailed { current_version })
            }
            Err(e) => Err(store_error(path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects: Vec<object_store::ObjectMeta> = self
            .store
            .list(Some(&Path::from(prefix)))
            .try_collect()
            .await
            .map_err(|e| store_error(prefix, e))?;
        Ok(objects
            .iter()
            .map(convert_meta)
            .filter(|meta| meta.path.starts_with(prefix))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        match self.store.head(&Path::from(path)).await {
            Ok(meta) => Ok(Some(convert_meta(&meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(store_error(path, e)),
        }
    }
}
