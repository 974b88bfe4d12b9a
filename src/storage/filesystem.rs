//! File system operations
//!
//! Local-disk implementation of [`FileSystem`] rooted at `server_root`.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncSeekExt;

use super::{FileEntry, FileReader, FileSystem, FileWriter};
use crate::error::StorageError;

/// Maps virtual paths onto a directory on the local disk.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Real path for a virtual one, refusing anything that is not a plain
    /// descending path.
    fn real_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn entry(name: String, meta: &std::fs::Metadata) -> FileEntry {
        FileEntry {
            name,
            size: meta.len(),
            is_dir: meta.is_dir(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        }
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn metadata(&self, path: &str) -> Result<FileEntry, StorageError> {
        let real = self.real_path(path)?;
        let meta = fs::metadata(&real)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        let name = super::validation::file_name(path).to_string();
        Ok(Self::entry(name, &meta))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>, StorageError> {
        let real = self.real_path(path)?;
        let meta = fs::metadata(&real)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        if !meta.is_dir() {
            let name = super::validation::file_name(path).to_string();
            return Ok(vec![Self::entry(name, &meta)]);
        }

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&real)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| StorageError::from_io(path, e))?
        {
            match item.metadata().await {
                Ok(meta) => entries.push(Self::entry(
                    item.file_name().to_string_lossy().into_owned(),
                    &meta,
                )),
                Err(e) => debug!("Skipping {:?} in listing: {}", item.path(), e),
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<FileReader, StorageError> {
        let real = self.real_path(path)?;
        let meta = fs::metadata(&real)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        if !meta.is_file() {
            return Err(StorageError::NotAFile(path.to_string()));
        }

        let mut file = fs::File::open(&real)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(file))
    }

    async fn open_write(
        &self,
        path: &str,
        offset: u64,
        append: bool,
        create_parents: bool,
    ) -> Result<FileWriter, StorageError> {
        let real = self.real_path(path)?;
        if create_parents {
            if let Some(parent) = real.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::from_io(path, e))?;
            }
        }

        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else if offset > 0 {
            options.write(true);
        } else {
            options.write(true).truncate(true);
        }

        let mut file = options
            .open(&real)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        if !append && offset > 0 {
            file.set_len(offset).await?;
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(file))
    }

    async fn make_dir(&self, path: &str) -> Result<(), StorageError> {
        let real = self.real_path(path)?;
        fs::create_dir(&real)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), StorageError> {
        let real = self.real_path(path)?;
        let meta = fs::metadata(&real)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        if !meta.is_dir() {
            return Err(StorageError::NotADirectory(path.to_string()));
        }
        fs::remove_dir(&real)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn remove_file(&self, path: &str) -> Result<(), StorageError> {
        let real = self.real_path(path)?;
        let meta = fs::metadata(&real)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        if meta.is_dir() {
            return Err(StorageError::NotAFile(path.to_string()));
        }
        fs::remove_file(&real)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.real_path(from)?;
        let target = self.real_path(to)?;
        fs::rename(&source, &target)
            .await
            .map_err(|e| StorageError::from_io(from, e))
    }

    async fn create_empty(&self, path: &str) -> Result<(), StorageError> {
        let real = self.real_path(path)?;
        fs::File::create(&real)
            .await
            .map(|_| ())
            .map_err(|e| StorageError::from_io(path, e))
    }
}
