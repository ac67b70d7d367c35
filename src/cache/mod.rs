use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod disk;
pub mod kv;
pub mod noop;

pub use disk::DiskCache;
pub use kv::KvCache;
pub use noop::NoopCache;

/// Envelope stored alongside every cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etag: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache entry not found")]
    NotFound,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The narrow capability the proxy engine needs: the local disk backend and
/// the cluster KV client both satisfy it.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<(Bytes, Metadata), CacheError>;

    async fn put(&self, key: &str, metadata: Metadata, blob: Bytes) -> Result<(), CacheError>;
}
