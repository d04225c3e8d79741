//! Receive-and-verify step shared by downloads and uploads.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::channel::FramedChannel;
use super::integrity::{digest_matches, Digest};
use super::{parse_decimal, Result, TransferError};
use crate::catalog::{FileCatalog, FileDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// An announced transfer, consumed once by [`TransferRequest::receive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: Direction,
    pub name: String,
    pub size: u64,
    pub digest: Digest,
}

impl TransferRequest {
    /// Read the size and digest lines a provider sends for `name`
    pub async fn read_meta<S>(
        channel: &mut FramedChannel<S>,
        direction: Direction,
        name: String,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite,
    {
        let size_line = channel.read_line().await?;
        let size = parse_decimal("file size", &size_line)?;
        let digest_line = channel.read_line().await?;
        let digest = Digest::from_hex(&digest_line)?;

        debug!("Announced {} ({} bytes, {})", name, size, digest);

        Ok(Self {
            direction,
            name,
            size,
            digest,
        })
    }

    /// Receive the payload into the catalog and verify its digest.
    ///
    /// The destination is truncated to the announced size before writing,
    /// and exactly that many bytes are read from the channel. On a digest
    /// mismatch the received file is left in place.
    pub async fn receive<S>(
        self,
        channel: &mut FramedChannel<S>,
        catalog: &dyn FileCatalog,
    ) -> Result<FileDescriptor>
    where
        S: AsyncRead + AsyncWrite,
    {
        let mut sink = catalog.open_for_write(&self.name, self.size).await?;
        channel.copy_exact_to(&mut sink, self.size).await?;
        sink.shutdown()
            .await
            .map_err(|e| TransferError::local_io(format!("failed to close {}", self.name), e))?;
        drop(sink);

        let received = catalog.describe(&self.name).await?;
        if !digest_matches(&self.digest, &received.digest) {
            return Err(TransferError::IntegrityMismatch {
                name: self.name,
                expected: self.digest,
                actual: received.digest,
            });
        }

        info!(
            "✅ {:?} of {} verified ({} bytes, {})",
            self.direction, received.name, received.size, received.digest
        );

        Ok(received)
    }
}
