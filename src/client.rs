//! File Transfer Client Module
//!
//! This module implements the requesting peer:
//! - Establishes a mutually authenticated TLS connection to the server
//! - Lists, downloads and uploads files over one session
//! - Verifies every received file against the announced SHA-256 digest
//! - Shows progress bars for bulk transfers
//!
//! ## Cancellation
//!
//! The protocol has no cancel message. Once a listing was received the
//! server waits for a selection, so declining to pick a file closes the
//! session; [`ClientSession::is_open`] tells the caller to reconnect.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::ProgressStyle;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::catalog::{FileCatalog, FileDescriptor};
use crate::protocol::download::{receive_listing, request_download, request_selected};
use crate::protocol::upload::send_upload;
use crate::protocol::{
    self, DownloadOutcome, FileSelector, FramedChannel, Mode, TransferError, UploadOutcome,
};
use crate::tls::{certificate_fingerprint, ClientTlsConfig};

/// Client configuration
pub struct ClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    pub tls_config: ClientTlsConfig,
    /// Deadline for connecting and every protocol step
    pub io_timeout: Option<Duration>,
    /// Deadline while the server operator decides on an upload
    pub approval_timeout: Option<Duration>,
    /// Draw progress bars for bulk transfers
    pub show_progress: bool,
}

/// File transfer client
pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Connect to the server and return a connected session
    pub async fn connect(&self) -> Result<ClientSession> {
        let addr = self.config.server_addr;
        info!("🔗 Connecting to {}...", addr);

        let tcp_stream = with_limit(self.config.io_timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("Timed out connecting to {}", addr))?
            .with_context(|| format!("Failed to connect to {}", addr))?;

        if let Ok(local) = tcp_stream.local_addr() {
            debug!("TCP connection established {} --> {}", local, addr);
        }

        let connector = TlsConnector::from(self.config.tls_config.config.clone());
        let handshake = connector.connect(self.config.tls_config.server_name.clone(), tcp_stream);
        let tls_stream = with_limit(self.config.io_timeout, handshake)
            .await
            .context("TLS handshake timed out")?
            .context("TLS handshake failed")?;

        info!("🔐 TLS connection established");

        let (_, conn_info) = tls_stream.get_ref();
        if let Some(protocol) = conn_info.protocol_version() {
            info!("  Protocol: {:?}", protocol);
        }
        if let Some(cipher) = conn_info.negotiated_cipher_suite() {
            info!("  Cipher: {:?}", cipher.suite());
        }
        if let Some(cert) = conn_info.peer_certificates().and_then(|certs| certs.first()) {
            info!("  Server certificate: {}", certificate_fingerprint(cert));
        }

        let mut channel = FramedChannel::new(tls_stream)
            .with_timeouts(self.config.io_timeout, self.config.approval_timeout);
        if self.config.show_progress {
            channel.set_progress_style(transfer_style());
        }

        Ok(ClientSession::new(channel))
    }
}

async fn with_limit<F: std::future::Future>(
    limit: Option<Duration>,
    operation: F,
) -> std::result::Result<F::Output, tokio::time::error::Elapsed> {
    match limit {
        Some(limit) => timeout(limit, operation).await,
        None => Ok(operation.await),
    }
}

/// Connected client session
///
/// Runs any number of downloads and uploads until a session-fatal error or
/// a cancelled selection closes it.
pub struct ClientSession<S = TlsStream<TcpStream>> {
    channel: Option<FramedChannel<S>>,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(channel: FramedChannel<S>) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Drop the connection
    pub fn close(&mut self) {
        self.channel = None;
    }

    /// Fetch the server's listing.
    ///
    /// The server then waits for a selection, so the session is consumed.
    pub async fn list(mut self) -> protocol::Result<Vec<String>> {
        let channel = self.open_channel()?;
        channel.write_line(Mode::Download.code()).await?;
        receive_listing(channel).await
    }

    /// Download a file picked by `selector` into `catalog`
    pub async fn download(
        &mut self,
        catalog: &dyn FileCatalog,
        selector: &mut dyn FileSelector,
    ) -> protocol::Result<DownloadOutcome> {
        let channel = self.open_channel()?;
        let result = async {
            channel.write_line(Mode::Download.code()).await?;
            request_download(channel, catalog, selector).await
        }
        .await;

        if let Ok(DownloadOutcome::Cancelled) = result {
            info!("Download cancelled, closing session");
            self.close();
        }
        self.settle(result)
    }

    /// Download `name` into `catalog` without prompting.
    ///
    /// A name missing from the listing is `Cancelled` and closes the session.
    pub async fn download_named(
        &mut self,
        catalog: &dyn FileCatalog,
        name: &str,
    ) -> protocol::Result<DownloadOutcome> {
        let channel = self.open_channel()?;
        let result = async {
            channel.write_line(Mode::Download.code()).await?;
            let listing = receive_listing(channel).await?;

            match listing.iter().position(|entry| entry == name) {
                Some(index) => request_selected(channel, catalog, &listing, index + 1)
                    .await
                    .map(DownloadOutcome::Completed),
                None => {
                    warn!("{} is not offered by the server", name);
                    Ok(DownloadOutcome::Cancelled)
                }
            }
        }
        .await;

        if let Ok(DownloadOutcome::Cancelled) = result {
            self.close();
        }
        self.settle(result)
    }

    /// Offer `name` from `catalog` to the server
    pub async fn upload(
        &mut self,
        catalog: &dyn FileCatalog,
        name: &str,
    ) -> protocol::Result<UploadOutcome> {
        // Describe first: a local failure must not leave the server
        // waiting halfway through an upload
        let descriptor: FileDescriptor = catalog.describe(name).await?;
        info!("📊 {} ({} bytes, {})", descriptor.name, descriptor.size, descriptor.digest);

        let channel = self.open_channel()?;
        let result = async {
            channel.write_line(Mode::Upload.code()).await?;
            info!("Awaiting approval from server...");
            send_upload(channel, catalog, &descriptor).await
        }
        .await;

        self.settle(result)
    }

    fn open_channel(&mut self) -> protocol::Result<&mut FramedChannel<S>> {
        self.channel.as_mut().ok_or(TransferError::ConnectionClosed)
    }

    /// Close the session when `result` left it out of step
    fn settle<T>(&mut self, result: protocol::Result<T>) -> protocol::Result<T> {
        if let Err(e) = &result {
            if e.is_session_fatal() {
                debug!("Closing session after: {}", e);
                self.close();
            }
        }
        result
    }
}

/// Progress bar style for bulk transfers
pub fn transfer_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}
