//! Download protocol: a provider lists its catalog, a requester picks one
//! entry and receives it.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::channel::FramedChannel;
use super::transfer::{Direction, TransferRequest};
use super::{
    is_valid_selection, parse_decimal, validate_file_name, Result, TransferError,
    MAX_LISTING_ENTRIES,
};
use crate::catalog::{FileCatalog, FileDescriptor};

/// Picks an entry from a listing presented by the provider
#[async_trait]
pub trait FileSelector: Send {
    /// Return a 1-based selection, or `None` to cancel
    async fn select(&mut self, names: &[String]) -> Option<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed(FileDescriptor),
    /// Nothing was selected; the connection must be closed to release the
    /// provider
    Cancelled,
}

/// Provider side: list the catalog, read the selection and stream the file.
///
/// The file is described and then opened again for streaming. Exactly the
/// described number of bytes is sent either way, so a file that changes in
/// between keeps the stream in step; the requester then reports
/// `IntegrityMismatch` for the changed content, or the provider fails with
/// `LocalIo` if the file shrank.
pub async fn serve_download<S>(
    channel: &mut FramedChannel<S>,
    catalog: &dyn FileCatalog,
) -> Result<FileDescriptor>
where
    S: AsyncRead + AsyncWrite,
{
    let files = catalog.list_files().await?;
    debug!("Offering {} file(s)", files.len());

    channel.write_line(&files.len().to_string()).await?;
    channel.write_lines(&files).await?;

    let line = channel.read_line_idle().await?;
    let selection = parse_decimal("selection", &line)?;
    let index = usize::try_from(selection)
        .ok()
        .filter(|&n| is_valid_selection(n, files.len()))
        .ok_or_else(|| {
            TransferError::violation(format!(
                "selection {} outside 1..={}",
                selection,
                files.len()
            ))
        })?;

    let name = &files[index - 1];
    let descriptor = catalog.describe(name).await?;

    channel.write_line(&descriptor.size.to_string()).await?;
    channel.write_line(&descriptor.digest.to_hex()).await?;

    info!("📤 Sending {} ({} bytes)", descriptor.name, descriptor.size);

    let mut source = catalog.open_for_read(name).await?;
    channel.send_from(&mut source, descriptor.size).await?;

    info!("✅ Sent {} ({} bytes)", descriptor.name, descriptor.size);

    Ok(descriptor)
}

/// Requester side: read the announced listing
pub async fn receive_listing<S>(channel: &mut FramedChannel<S>) -> Result<Vec<String>>
where
    S: AsyncRead + AsyncWrite,
{
    let line = channel.read_line().await?;
    let count = parse_decimal("file count", &line)?;
    if count > MAX_LISTING_ENTRIES as u64 {
        return Err(TransferError::violation(format!(
            "listing of {} entries exceeds {}",
            count, MAX_LISTING_ENTRIES
        )));
    }

    let mut names = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = channel.read_line().await?;
        validate_file_name(&name)?;
        names.push(name);
    }

    Ok(names)
}

/// Requester side: send `selection` and receive the chosen file into
/// `catalog`
pub async fn request_selected<S>(
    channel: &mut FramedChannel<S>,
    catalog: &dyn FileCatalog,
    listing: &[String],
    selection: usize,
) -> Result<FileDescriptor>
where
    S: AsyncRead + AsyncWrite,
{
    if !is_valid_selection(selection, listing.len()) {
        return Err(TransferError::violation(format!(
            "selection {} outside 1..={}",
            selection,
            listing.len()
        )));
    }

    channel.write_line(&selection.to_string()).await?;

    let name = listing[selection - 1].clone();
    let request = TransferRequest::read_meta(channel, Direction::Download, name).await?;

    info!("📥 Receiving {} ({} bytes)", request.name, request.size);

    request.receive(channel, catalog).await
}

/// Requester side of one download after the mode selector was sent
pub async fn request_download<S>(
    channel: &mut FramedChannel<S>,
    catalog: &dyn FileCatalog,
    selector: &mut dyn FileSelector,
) -> Result<DownloadOutcome>
where
    S: AsyncRead + AsyncWrite,
{
    let listing = receive_listing(channel).await?;

    let Some(selection) = selector.select(&listing).await else {
        return Ok(DownloadOutcome::Cancelled);
    };

    request_selected(channel, catalog, &listing, selection)
        .await
        .map(DownloadOutcome::Completed)
}
