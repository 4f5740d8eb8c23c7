//! Snapshot store backends.

use std::{
    io::{ErrorKind, Write},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use object_store::{
    ObjectStore, PutMode, PutOptions, aws::AmazonS3Builder, memory::InMemory,
    path::Path as ObjectPath,
};
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::{debug, instrument};

use crate::application::screenshot::{SnapshotStore, StoreError};
use crate::config::S3Settings;

use super::error::InfraError;

/// Snapshots stored as files below a root directory.
#[derive(Debug)]
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    /// Initialise storage rooted at the provided directory, creating it if necessary.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative.is_absolute()
            || relative.components().any(|component| {
                matches!(
                    component,
                    Component::ParentDir | Component::Prefix(_) | Component::RootDir
                )
            })
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let absolute = self.resolve(key)?;
        Ok(fs::try_exists(&absolute).await?)
    }

    async fn read(&self, key: &str) -> Result<Bytes, StoreError> {
        let absolute = self.resolve(key)?;
        match fs::read(&absolute).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::Missing {
                key: key.to_string(),
            }),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn write(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        let absolute = self.resolve(key)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await?;
        }

        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
            let mut staged = NamedTempFile::new_in(&root)?;
            staged.write_all(&bytes)?;
            staged.flush()?;
            match staged.persist_noclobber(&absolute) {
                Ok(_) => Ok(()),
                // Entries are immutable; another writer already stored this key.
                Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(()),
                Err(err) => Err(err.error),
            }
        })
        .await
        .map_err(|err| StoreError::backend(key, err))??;

        debug!(
            target = "infra::snapshots::fs",
            key = %key,
            "Snapshot written"
        );
        Ok(())
    }
}

/// Snapshots stored in an object store bucket (S3-compatible, or in memory).
pub struct ObjectSnapshotStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ObjectSnapshotStore {
    pub fn s3(settings: &S3Settings) -> Result<Self, InfraError> {
        let mut builder = AmazonS3Builder::new()
            .with_endpoint(&settings.endpoint)
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region);

        if let Some(key_id) = settings.access_key_id.as_ref() {
            builder = builder.with_access_key_id(key_id);
        }
        if let Some(secret) = settings.secret_access_key.as_ref() {
            builder = builder.with_secret_access_key(secret);
        }
        if settings.allow_http {
            builder = builder.with_allow_http(true);
        }

        let store = builder
            .build()
            .map_err(|err| InfraError::storage(format!("failed to create S3 client: {err}")))?;

        Ok(Self {
            store: Arc::new(store),
            bucket: settings.bucket.clone(),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
            bucket: "memory".to_string(),
        }
    }

    fn location(key: &str) -> Result<ObjectPath, StoreError> {
        ObjectPath::parse(key).map_err(|_| StoreError::InvalidKey(key.to_string()))
    }
}

#[async_trait]
impl SnapshotStore for ObjectSnapshotStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let location = Self::location(key)?;
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(StoreError::backend(key, err)),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn read(&self, key: &str) -> Result<Bytes, StoreError> {
        let location = Self::location(key)?;
        let result = match self.store.get(&location).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(StoreError::Missing {
                    key: key.to_string(),
                });
            }
            Err(err) => return Err(StoreError::backend(key, err)),
        };

        let bytes = result
            .bytes()
            .await
            .map_err(|err| StoreError::backend(key, err))?;
        debug!(size = bytes.len(), "Read snapshot");
        Ok(bytes)
    }

    #[instrument(skip(self, bytes), fields(bucket = %self.bucket, size = bytes.len()))]
    async fn write(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        let location = Self::location(key)?;
        let options = PutOptions {
            mode: PutMode::Create,
            ..PutOptions::default()
        };
        match self.store.put_opts(&location, bytes.into(), options).await {
            Ok(_) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. }) => {
                debug!("Snapshot already stored, keeping the existing entry");
                Ok(())
            }
            Err(err) => Err(StoreError::backend(key, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY: &str = "screenshots/v7/deploy-a/c1/abc.png";

    #[tokio::test]
    async fn fs_store_reports_missing_keys_as_absent() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsSnapshotStore::new(dir.path().to_path_buf()).expect("store");

        assert!(!store.exists(KEY).await.expect("exists"));
        assert!(matches!(
            store.read(KEY).await,
            Err(StoreError::Missing { .. })
        ));
    }

    #[tokio::test]
    async fn fs_store_writes_nested_keys() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsSnapshotStore::new(dir.path().to_path_buf()).expect("store");

        store
            .write(KEY, Bytes::from_static(b"png"))
            .await
            .expect("write");

        assert!(store.exists(KEY).await.expect("exists"));
        assert_eq!(store.read(KEY).await.expect("read"), Bytes::from_static(b"png"));
        assert!(dir.path().join(KEY).is_file());
    }

    #[tokio::test]
    async fn fs_store_never_overwrites_an_entry() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsSnapshotStore::new(dir.path().to_path_buf()).expect("store");

        store
            .write(KEY, Bytes::from_static(b"first"))
            .await
            .expect("first write");
        store
            .write(KEY, Bytes::from_static(b"first"))
            .await
            .expect("repeat write is accepted");
        store
            .write(KEY, Bytes::from_static(b"second"))
            .await
            .expect("conflicting write is absorbed");

        assert_eq!(store.read(KEY).await.expect("read"), Bytes::from_static(b"first"));
        let leftovers = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_file())
            .count();
        assert_eq!(leftovers, 0, "staged temp files must be cleaned up");
    }

    #[tokio::test]
    async fn fs_store_rejects_escaping_keys() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsSnapshotStore::new(dir.path().to_path_buf()).expect("store");

        for key in ["../outside.png", "/etc/passwd", ""] {
            assert!(matches!(
                store.exists(key).await,
                Err(StoreError::InvalidKey(_))
            ));
        }
    }

    #[tokio::test]
    async fn object_store_round_trips_through_memory() {
        let store = ObjectSnapshotStore::in_memory();

        assert!(!store.exists(KEY).await.expect("exists"));
        assert!(matches!(
            store.read(KEY).await,
            Err(StoreError::Missing { .. })
        ));

        store
            .write(KEY, Bytes::from_static(b"png"))
            .await
            .expect("write");
        assert!(store.exists(KEY).await.expect("exists"));
        assert_eq!(store.read(KEY).await.expect("read"), Bytes::from_static(b"png"));
    }

    #[tokio::test]
    async fn object_store_never_overwrites_an_entry() {
        let store = ObjectSnapshotStore::in_memory();

        store
            .write(KEY, Bytes::from_static(b"first"))
            .await
            .expect("first write");
        store
            .write(KEY, Bytes::from_static(b"second"))
            .await
            .expect("conflicting write is absorbed");

        assert_eq!(store.read(KEY).await.expect("read"), Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn object_store_rejects_malformed_keys() {
        let store = ObjectSnapshotStore::in_memory();
        assert!(matches!(
            store.exists("screenshots//c1.png").await,
            Err(StoreError::InvalidKey(_))
        ));
    }
}
