//! File catalog: the named files a peer can list, read and write.
//!
//! The protocol only talks to the [`FileCatalog`] trait. [`DirectoryCatalog`]
//! backs it with the regular files of one flat directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tracing::debug;

use crate::protocol::integrity::digest_stream;
use crate::protocol::{validate_file_name, Digest, Result, TransferError};

/// Readable stream for one catalog entry
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Writable stream for one catalog entry
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Name, size and digest of a file, computed for a single transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub digest: Digest,
}

#[async_trait]
pub trait FileCatalog: Send + Sync {
    /// Names of the available files, in presentation order
    async fn list_files(&self) -> Result<Vec<String>>;

    async fn open_for_read(&self, name: &str) -> Result<ByteSource>;

    /// Create `name`, truncated to `size` bytes
    async fn open_for_write(&self, name: &str, size: u64) -> Result<ByteSink>;

    /// Size and digest of the current content of `name`.
    ///
    /// Recomputed on every call: the file may change between requests.
    async fn describe(&self, name: &str) -> Result<FileDescriptor> {
        let mut source = self.open_for_read(name).await?;
        let (digest, size) = digest_stream(&mut source).await?;
        Ok(FileDescriptor {
            name: name.to_string(),
            size,
            digest,
        })
    }
}

/// Catalog over the regular files of a directory
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        validate_file_name(name)?;
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl FileCatalog for DirectoryCatalog {
    async fn list_files(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.root).await.map_err(|e| {
            TransferError::local_io(format!("failed to read directory {:?}", self.root), e)
        })?;

        let mut names = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    return Err(TransferError::local_io(
                        format!("failed to read directory {:?}", self.root),
                        e,
                    ))
                }
            };

            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    debug!("Skipping non UTF-8 file name {:?}", raw);
                    continue;
                }
            };

            if validate_file_name(&name).is_err() {
                debug!("Skipping unlisted name {:?}", name);
                continue;
            }

            // Follows symlinks, unlike DirEntry::file_type
            match fs::metadata(entry.path()).await {
                Ok(metadata) if metadata.is_file() => names.push(name),
                Ok(_) => {}
                Err(e) => debug!("Skipping {:?}: {}", name, e),
            }
        }

        names.sort();
        Ok(names)
    }

    async fn open_for_read(&self, name: &str) -> Result<ByteSource> {
        let path = self.path_for(name)?;

        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| TransferError::local_io(format!("failed to stat {:?}", path), e))?;
        if !metadata.is_file() {
            return Err(TransferError::local_io(
                format!("cannot read {:?}", path),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        let file = File::open(&path)
            .await
            .map_err(|e| TransferError::local_io(format!("failed to open {:?}", path), e))?;

        Ok(Box::new(BufReader::new(file)))
    }

    async fn open_for_write(&self, name: &str, size: u64) -> Result<ByteSink> {
        let path = self.path_for(name)?;

        let file = File::create(&path)
            .await
            .map_err(|e| TransferError::local_io(format!("failed to create {:?}", path), e))?;
        file.set_len(size)
            .await
            .map_err(|e| TransferError::local_io(format!("failed to truncate {:?}", path), e))?;

        Ok(Box::new(BufWriter::new(file)))
    }
}
