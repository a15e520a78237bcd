//! File storage abstraction

use async_trait::async_trait;
use mailflow_common::config::StorageConfig;
use mailflow_common::types::EmailAddress;
use mailflow_common::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// File storage trait
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Store a file and return its path
    async fn store(&self, path: &str, data: &[u8]) -> Result<String>;

    /// Read a file
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete a file
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a file exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file size
    async fn size(&self, path: &str) -> Result<u64>;
}

/// Local filesystem storage
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new local storage instance from config
    pub fn new(config: &StorageConfig) -> Result<Self> {
        Self::from_path(&config.path)
    }

    /// Create a new local storage instance from a path
    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| Error::Storage(format!("Failed to create storage directory: {}", e)))?;

        info!(path = %path.display(), "Initialized local file storage");

        Ok(Self {
            base_path: path.to_path_buf(),
        })
    }

    /// Resolve a relative path inside the base directory, rejecting
    /// traversal attempts
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        if path.contains("..") {
            return Err(Error::Storage(
                "Path traversal detected: '..' is not allowed".to_string(),
            ));
        }

        if path.starts_with('/') || path.starts_with('\\') {
            return Err(Error::Storage("Absolute paths are not allowed".to_string()));
        }

        Ok(self.base_path.join(path))
    }

    async fn ensure_parent_exists(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileStorage for LocalStorage {
    async fn store(&self, path: &str, data: &[u8]) -> Result<String> {
        let full_path = self.full_path(path)?;
        self.ensure_parent_exists(&full_path).await?;

        let mut file = fs::File::create(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create file: {}", e)))?;

        file.write_all(data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write file: {}", e)))?;

        debug!(path = %path, size = data.len(), "Stored file");

        Ok(path.to_string())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;

        let mut file = fs::File::open(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to open file: {}", e)))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read file: {}", e)))?;

        debug!(path = %path, size = data.len(), "Read file");

        Ok(data)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;

        fs::remove_file(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to delete file: {}", e)))?;

        debug!(path = %path, "Deleted file");

        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path)?;
        Ok(full_path.exists())
    }

    async fn size(&self, path: &str) -> Result<u64> {
        let full_path = self.full_path(path)?;

        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to get file metadata: {}", e)))?;

        Ok(metadata.len())
    }
}

/// Per-recipient message layout over a [`FileStorage`]
pub struct MessageStore {
    storage: Arc<dyn FileStorage>,
}

impl MessageStore {
    /// Create a new message store
    pub fn new(storage: Arc<dyn FileStorage>) -> Self {
        Self { storage }
    }

    /// Storage path for a recipient's copy of a message
    pub fn path_for(recipient: &EmailAddress, mail_name: &str) -> String {
        format!("{}/{}/{}.eml", recipient.domain, recipient.local, mail_name)
    }

    /// Store a recipient's copy of a message
    pub async fn store_message(
        &self,
        recipient: &EmailAddress,
        mail_name: &str,
        data: &[u8],
    ) -> Result<String> {
        let path = Self::path_for(recipient, mail_name);
        self.storage.store(&path, data).await
    }

    /// Read a stored message
    pub async fn read_message(&self, recipient: &EmailAddress, mail_name: &str) -> Result<Vec<u8>> {
        self.storage
            .read(&Self::path_for(recipient, mail_name))
            .await
    }

    /// Whether a recipient's copy exists
    pub async fn message_exists(&self, recipient: &EmailAddress, mail_name: &str) -> Result<bool> {
        self.storage
            .exists(&Self::path_for(recipient, mail_name))
            .await
    }

    /// Archive a raw message under an arbitrary repository directory
    pub async fn archive(&self, repository: &str, mail_name: &str, data: &[u8]) -> Result<String> {
        let repository = repository.trim_matches('/');
        let path = format!("{}/{}.eml", repository, mail_name);
        self.storage.store(&path, data).await
    }
}
