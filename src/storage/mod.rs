//! Storage boundary
//!
//! The command handlers only see the [`FileSystem`] trait; the bundled
//! [`LocalFileSystem`] maps virtual paths below a root directory.

pub mod filesystem;
pub mod validation;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::StorageError;

pub use filesystem::LocalFileSystem;

pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;
pub type FileWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Metadata for one file or directory.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
}

impl FileEntry {
    /// `ls -l` style line used by `LIST`.
    pub fn long_listing(&self) -> String {
        let mode = if self.is_dir { "drwxr-xr-x" } else { "-rw-r--r--" };
        let date = self
            .modified
            .map(|t| t.format("%b %d %H:%M").to_string())
            .unwrap_or_else(|| "Jan 01 00:00".to_string());
        format!("{} 1 ftp ftp {:>12} {} {}", mode, self.size, date, self.name)
    }

    /// `MDTM` timestamp.
    pub fn mdtm(&self) -> Option<String> {
        self.modified.map(|t| t.format("%Y%m%d%H%M%S").to_string())
    }
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn metadata(&self, path: &str) -> Result<FileEntry, StorageError>;

    /// Entries of a directory, or the entry itself for a plain file.
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>, StorageError>;

    async fn open_read(&self, path: &str, offset: u64) -> Result<FileReader, StorageError>;

    async fn open_write(
        &self,
        path: &str,
        offset: u64,
        append: bool,
        create_parents: bool,
    ) -> Result<FileWriter, StorageError>;

    async fn make_dir(&self, path: &str) -> Result<(), StorageError>;

    async fn remove_dir(&self, path: &str) -> Result<(), StorageError>;

    async fn remove_file(&self, path: &str) -> Result<(), StorageError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Creates `path` as an empty file, truncating it if it exists.
    async fn create_empty(&self, path: &str) -> Result<(), StorageError>;
}
