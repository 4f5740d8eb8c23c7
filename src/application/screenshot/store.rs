use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid snapshot key `{0}`")]
    InvalidKey(String),
    #[error("snapshot `{key}` disappeared before it could be read")]
    Missing { key: String },
    #[error("snapshot store failed on `{key}`: {message}")]
    Backend { key: String, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn backend(key: &str, err: impl std::fmt::Display) -> Self {
        Self::Backend {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

/// Key-addressed blob storage for rendered snapshots.
///
/// Keys are slash-separated paths produced by the fingerprint builder.
/// Entries are never deleted by the pipeline.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Missing keys report `false`, never an error.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Read a key previously reported as present. A key that vanished in the
    /// meantime is [`StoreError::Missing`].
    async fn read(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Store `bytes` under `key`. Rewriting identical bytes is a no-op in effect.
    async fn write(&self, key: &str, bytes: Bytes) -> Result<(), StoreError>;
}
