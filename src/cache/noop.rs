use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::{Cache, CacheError, Metadata};

/// Default sink used when no disk cache is configured: lookups miss and
/// stores discard their payload.
#[derive(Debug, Default)]
pub struct NoopCache;

impl NoopCache {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Cache for NoopCache {
    async fn get(&self, _key: &str) -> Result<(Bytes, Metadata), CacheError> {
        Err(CacheError::NotFound)
    }

    async fn put(&self, _key: &str, _metadata: Metadata, _blob: Bytes) -> Result<(), CacheError> {
        Ok(())
    }
}
