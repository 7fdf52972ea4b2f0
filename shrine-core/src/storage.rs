//! Content-addressed file storage.
//!
//! Every key maps to `root/transform(key)`. The default transform is the hex SHA-1 of the
//! key, so the root is a flat directory of 40-character file names. There is no index:
//! presence is checked by recomputing the path.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maps a logical key to a path relative to the storage root. Must be deterministic.
pub type PathTransform = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Hex SHA-1 of the key (default).
pub fn sha1_transform(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hex SHA-256 of the key.
pub fn sha256_transform(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct Storage {
    root: PathBuf,
    transform: PathTransform,
}

impl Storage {
    /// Storage under `root` with the default SHA-1 transform. The directory is created lazily
    /// on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_transform(root, Arc::new(sha1_transform))
    }

    pub fn with_transform(root: impl Into<PathBuf>, transform: PathTransform) -> Self {
        Self {
            root: root.into(),
            transform,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn full_path(&self, key: &str) -> PathBuf {
        self.root.join((self.transform)(key))
    }

    /// Create or truncate the entry for `key` and copy `reader` into it. Returns bytes written.
    pub async fn write<R>(&self, key: &str, reader: &mut R) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path = self.full_path(key);
        // Transforms may yield nested paths; create_dir_all is a no-op when present.
        let dir = path.parent().unwrap_or(self.root.as_path());
        fs::create_dir_all(dir)
            .await
            .map_err(|source| StorageError::io(dir, source))?;

        let mut file = fs::File::create(&path)
            .await
            .map_err(|source| StorageError::io(&path, source))?;
        let size = tokio::io::copy(reader, &mut file)
            .await
            .map_err(|source| StorageError::io(&path, source))?;
        file.sync_all()
            .await
            .map_err(|source| StorageError::io(&path, source))?;

        tracing::debug!(key, size, path = %path.display(), "wrote entry");
        Ok(size)
    }

    /// Whole-file read.
    pub async fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.full_path(key);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|source| StorageError::for_key(key, &path, source))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|source| StorageError::io(&path, source))?;
        Ok(buf)
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.full_path(key);
        fs::remove_file(&path)
            .await
            .map_err(|source| StorageError::for_key(key, &path, source))
    }

    pub async fn has(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.full_path(key);
        fs::try_exists(&path)
            .await
            .map_err(|source| StorageError::io(&path, source))
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("root", &self.root).finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn for_key(key: &str, path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::io(path, source)
        }
    }
}
