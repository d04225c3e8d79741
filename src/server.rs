//! File Transfer Server Module
//!
//! This module implements the serving peer:
//! - Accepts mutually authenticated TLS connections
//! - Runs one session task per connection, bounded by a semaphore
//! - Offers its storage directory for download and receives uploads into it
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    TLS Server                            │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │              TLS Acceptor (rustls)                  ││
//! │  │  - Server certificate, client certificate required  ││
//! │  │  - Handshake bounded by the I/O timeout             ││
//! │  └─────────────────────────────────────────────────────┘│
//! │                         │                                │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │              Session loop                           ││
//! │  │  - Mode selector, download provider, upload gate    ││
//! │  │  - Digest verification after every upload           ││
//! │  └─────────────────────────────────────────────────────┘│
//! │                         │                                │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │              Directory catalog                      ││
//! │  │  - Flat storage directory, owner-only permissions   ││
//! │  └─────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::catalog::DirectoryCatalog;
use crate::prompt::{ConsoleApprover, FixedDecision};
use crate::protocol::{format_size, FramedChannel, UploadDecider};
use crate::session::{serve_session, SessionOptions};
use crate::tls::{certificate_fingerprint, ServerTlsConfig};

/// Maximum concurrent connections
pub const MAX_CONNECTIONS: usize = 100;

/// Default listening port
pub const DEFAULT_PORT: u16 = 6600;

/// How incoming uploads are decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    /// Ask the operator on the console
    Prompt,
    /// Accept every upload within the size limit
    Always,
    /// Reject every upload
    Never,
}

impl ApprovalPolicy {
    pub fn decider(self) -> Arc<dyn UploadDecider> {
        match self {
            ApprovalPolicy::Prompt => Arc::new(ConsoleApprover::new()),
            ApprovalPolicy::Always => Arc::new(FixedDecision(true)),
            ApprovalPolicy::Never => Arc::new(FixedDecision(false)),
        }
    }
}

/// Server configuration
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Directory offered for download and receiving uploads
    pub storage_dir: PathBuf,
    pub tls_config: ServerTlsConfig,
    /// Largest upload accepted, in bytes
    pub max_file_size: u64,
    /// Deadline for the handshake and every protocol step
    pub io_timeout: Option<Duration>,
    /// Deadline while waiting on the client's operator
    pub idle_timeout: Option<Duration>,
    /// End each session after one download or upload
    pub single_shot: bool,
    pub approval: ApprovalPolicy,
}

/// File transfer server
pub struct Server {
    config: ServerConfig,
    decider: Arc<dyn UploadDecider>,
    connection_semaphore: Arc<Semaphore>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let decider = config.approval.decider();
        Self {
            config,
            decider,
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        }
    }

    /// Replace the decision source picked by the approval policy
    pub fn with_decider(mut self, decider: Arc<dyn UploadDecider>) -> Self {
        self.decider = decider;
        self
    }

    /// Bind the configured address and serve until the process exits
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.bind_addr))?;

        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.setup_storage_directory().await?;

        let local_addr = listener.local_addr().context("Listener has no local address")?;
        info!("🔒 File transfer server listening on {}", local_addr);
        info!("📁 Storage directory: {:?}", self.config.storage_dir);
        info!("📏 Upload limit: {}", format_size(self.config.max_file_size));

        let tls_acceptor = TlsAcceptor::from(self.config.tls_config.config.clone());
        let catalog = Arc::new(DirectoryCatalog::new(&self.config.storage_dir));
        let options = Arc::new(SessionOptions {
            max_file_size: self.config.max_file_size,
            single_shot: self.config.single_shot,
        });

        loop {
            let (tcp_stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Connection limit reached, rejecting {}", peer_addr);
                    continue;
                }
            };

            let connection = Connection {
                tls_acceptor: tls_acceptor.clone(),
                catalog: catalog.clone(),
                decider: self.decider.clone(),
                options: options.clone(),
                io_timeout: self.config.io_timeout,
                idle_timeout: self.config.idle_timeout,
            };

            tokio::spawn(async move {
                let _permit = permit;

                match connection.handle(tcp_stream, peer_addr).await {
                    Ok(()) => debug!("Connection from {} closed normally", peer_addr),
                    Err(e) => warn!("Connection from {} error: {:#}", peer_addr, e),
                }
            });
        }
    }

    /// Create the storage directory and restrict it to the owner
    async fn setup_storage_directory(&self) -> Result<()> {
        let dir = &self.config.storage_dir;

        if !dir.exists() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create storage directory: {:?}", dir))?;
            info!("Created storage directory: {:?}", dir);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
                .await
                .with_context(|| format!("Failed to restrict storage directory: {:?}", dir))?;
        }

        Ok(())
    }
}

/// Everything one session task needs
struct Connection {
    tls_acceptor: TlsAcceptor,
    catalog: Arc<DirectoryCatalog>,
    decider: Arc<dyn UploadDecider>,
    options: Arc<SessionOptions>,
    io_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
}

impl Connection {
    async fn handle(self, tcp_stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        info!("📥 New connection from {}", peer_addr);

        let handshake = self.tls_acceptor.accept(tcp_stream);
        let tls_stream = match self.io_timeout {
            Some(limit) => timeout(limit, handshake)
                .await
                .context("TLS handshake timed out")?,
            None => handshake.await,
        }
        .context("TLS handshake failed")?;

        let (_, session) = tls_stream.get_ref();
        let fingerprint = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(certificate_fingerprint)
            .unwrap_or_else(|| "none".to_string());
        info!(
            "🔐 TLS handshake successful with {} (client certificate {})",
            peer_addr, fingerprint
        );

        let mut channel =
            FramedChannel::new(tls_stream).with_timeouts(self.io_timeout, self.idle_timeout);

        match serve_session(
            &mut channel,
            self.catalog.as_ref(),
            self.decider.as_ref(),
            &self.options,
        )
        .await
        {
            Ok(report) => {
                info!(
                    "Client {} has disconnected ({} download(s), {} upload(s), {} rejected, {} failed verification)",
                    peer_addr,
                    report.downloads_served,
                    report.uploads_received,
                    report.uploads_rejected,
                    report.integrity_failures
                );
                Ok(())
            }
            Err(e) if e.is_disconnect() => {
                info!("Client {} has disconnected: {}", peer_addr, e);
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Session with {} ended", peer_addr)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(storage_dir: PathBuf) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            storage_dir,
            tls_config: ServerTlsConfig::ephemeral("localhost", None).unwrap(),
            max_file_size: 1024,
            io_timeout: None,
            idle_timeout: None,
            single_shot: false,
            approval: ApprovalPolicy::Never,
        }
    }

    #[tokio::test]
    async fn test_setup_storage_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("nested").join("storage");
        let server = Server::new(config(storage.clone()));

        server.setup_storage_directory().await.unwrap();
        assert!(storage.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&storage).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[tokio::test]
    async fn test_fixed_policies() {
        use crate::protocol::UploadOffer;

        let offer = UploadOffer {
            name: "a.txt".to_string(),
            size: 1,
        };
        assert!(ApprovalPolicy::Always.decider().decide_upload(&offer).await);
        assert!(!ApprovalPolicy::Never.decider().decide_upload(&offer).await);
    }
}
