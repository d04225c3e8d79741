//! Per-connection session loop on the serving peer.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::catalog::FileCatalog;
use crate::protocol::download::serve_download;
use crate::protocol::upload::{receive_upload, UploadDecider, UploadOutcome};
use crate::protocol::{FramedChannel, Mode, Result, TransferError};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Uploads announcing more bytes are refused without asking
    pub max_file_size: u64,
    /// Return after the first protocol run
    pub single_shot: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_file_size: u64::MAX,
            single_shot: false,
        }
    }
}

/// Counters for one finished session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub downloads_served: u64,
    pub uploads_received: u64,
    pub uploads_rejected: u64,
    pub integrity_failures: u64,
}

/// Serve protocol runs until the peer closes the connection.
///
/// Returns the session counters once the peer closes the connection, even
/// in the middle of a protocol run. Any other error that leaves the stream
/// out of step with the peer ends the session and is returned.
pub async fn serve_session<S>(
    channel: &mut FramedChannel<S>,
    catalog: &dyn FileCatalog,
    decider: &dyn UploadDecider,
    options: &SessionOptions,
) -> Result<SessionReport>
where
    S: AsyncRead + AsyncWrite,
{
    let mut report = SessionReport::default();

    loop {
        let selector = match channel.read_line_idle().await {
            Ok(line) => line,
            Err(TransferError::ConnectionClosed) => {
                debug!("Peer closed the session");
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        let mode = Mode::from_code(&selector)?;
        debug!("Mode selected: {:?}", mode);

        let outcome = match mode {
            Mode::Download => serve_download(channel, catalog).await.map(|_| {
                report.downloads_served += 1;
            }),
            Mode::Upload => receive_upload(channel, catalog, decider, options.max_file_size)
                .await
                .map(|outcome| match outcome {
                    UploadOutcome::Accepted(_) => report.uploads_received += 1,
                    UploadOutcome::Rejected { .. } => report.uploads_rejected += 1,
                }),
        };

        match outcome {
            Ok(()) => {}
            Err(TransferError::ConnectionClosed) => {
                debug!("Peer closed the session during {:?}", mode);
                return Ok(report);
            }
            Err(e) if !e.is_session_fatal() => {
                warn!("⚠️  {}", e);
                report.integrity_failures += 1;
            }
            Err(e) => return Err(e),
        }

        if options.single_shot {
            info!("Single-shot session finished");
            return Ok(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DirectoryCatalog;
    use crate::protocol::upload::UploadOffer;
    use crate::protocol::{Digest, APPROVAL_TOKEN};
    use async_trait::async_trait;
    use tokio::io::{duplex, DuplexStream};

    struct Approve;

    #[async_trait]
    impl UploadDecider for Approve {
        async fn decide_upload(&self, _offer: &UploadOffer) -> bool {
            true
        }
    }

    fn channels() -> (FramedChannel<DuplexStream>, FramedChannel<DuplexStream>) {
        let (a, b) = duplex(256 * 1024);
        (FramedChannel::new(a), FramedChannel::new(b))
    }

    #[tokio::test]
    async fn test_unknown_selector_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = DirectoryCatalog::new(dir.path());
        let (mut server, mut peer) = channels();

        peer.write_line("3").await.unwrap();

        let options = SessionOptions::default();
        let result = serve_session(&mut server, &catalog, &Approve, &options).await;
        assert!(matches!(result, Err(TransferError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_clean_close_returns_report() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = DirectoryCatalog::new(dir.path());
        let (mut server, peer) = channels();
        drop(peer);

        let options = SessionOptions::default();
        let report = serve_session(&mut server, &catalog, &Approve, &options)
            .await
            .unwrap();
        assert_eq!(report, SessionReport::default());
    }

    #[tokio::test]
    async fn test_multiple_requests_per_session() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let catalog = DirectoryCatalog::new(dir.path());
        let (mut server, mut peer) = channels();

        let client = async move {
            // Upload b.txt
            peer.write_line(Mode::Upload.code()).await.unwrap();
            peer.write_line("b.txt").await.unwrap();
            peer.write_line("3").await.unwrap();
            assert_eq!(peer.read_line().await.unwrap(), APPROVAL_TOKEN);
            peer.write_line(&Digest::of_bytes(b"abc").to_hex()).await.unwrap();
            peer.write_bytes(b"abc").await.unwrap();

            // Download it back as the second entry
            peer.write_line(Mode::Download.code()).await.unwrap();
            assert_eq!(peer.read_line().await.unwrap(), "2");
            assert_eq!(peer.read_line().await.unwrap(), "a.txt");
            assert_eq!(peer.read_line().await.unwrap(), "b.txt");
            peer.write_line("2").await.unwrap();
            assert_eq!(peer.read_line().await.unwrap(), "3");
            peer.read_line().await.unwrap();
            assert_eq!(peer.read_exact(3).await.unwrap(), b"abc");
        };

        let options = SessionOptions::default();
        let (report, ()) = tokio::join!(
            serve_session(&mut server, &catalog, &Approve, &options),
            client
        );

        let report = report.unwrap();
        assert_eq!(report.uploads_received, 1);
        assert_eq!(report.downloads_served, 1);
        assert_eq!(report.uploads_rejected, 0);
    }

    #[tokio::test]
    async fn test_integrity_failure_keeps_session() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = DirectoryCatalog::new(dir.path());
        let (mut server, mut peer) = channels();

        let client = async move {
            peer.write_line(Mode::Upload.code()).await.unwrap();
            peer.write_line("c.txt").await.unwrap();
            peer.write_line("3").await.unwrap();
            peer.read_line().await.unwrap();
            peer.write_line(&Digest::of_bytes(b"abc").to_hex()).await.unwrap();
            peer.write_bytes(b"xyz").await.unwrap();

            // Still in step
            peer.write_line(Mode::Download.code()).await.unwrap();
            assert_eq!(peer.read_line().await.unwrap(), "1");
            assert_eq!(peer.read_line().await.unwrap(), "c.txt");
        };

        let options = SessionOptions::default();
        let (report, ()) = tokio::join!(
            serve_session(&mut server, &catalog, &Approve, &options),
            client
        );

        let report = report.unwrap();
        assert_eq!(report.integrity_failures, 1);
        assert_eq!(report.uploads_received, 0);
    }

    #[tokio::test]
    async fn test_close_while_selecting_returns_report() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let catalog = DirectoryCatalog::new(dir.path());
        let (mut server, mut peer) = channels();
        let options = SessionOptions::default();

        let client = async move {
            peer.write_line(Mode::Upload.code()).await.unwrap();
            peer.write_line("b.txt").await.unwrap();
            peer.write_line("2").await.unwrap();
            peer.read_line().await.unwrap();
            peer.write_line(&Digest::of_bytes(b"ok").to_hex()).await.unwrap();
            peer.write_bytes(b"ok").await.unwrap();

            // Read the listing, then walk away without selecting
            peer.write_line(Mode::Download.code()).await.unwrap();
            assert_eq!(peer.read_line().await.unwrap(), "2");
            peer.read_line().await.unwrap();
            peer.read_line().await.unwrap();
        };

        let (report, ()) = tokio::join!(
            serve_session(&mut server, &catalog, &Approve, &options),
            client
        );

        let report = report.unwrap();
        assert_eq!(report.uploads_received, 1);
        assert_eq!(report.downloads_served, 0);
    }

    #[tokio::test]
    async fn test_single_shot_returns_after_one_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let catalog = DirectoryCatalog::new(dir.path());
        let (mut server, mut peer) = channels();
        let options = SessionOptions {
            single_shot: true,
            ..SessionOptions::default()
        };

        let client = async {
            peer.write_line(Mode::Download.code()).await.unwrap();
            peer.read_line().await.unwrap();
            peer.read_line().await.unwrap();
            peer.write_line("1").await.unwrap();
            peer.read_line().await.unwrap();
            peer.read_line().await.unwrap();
            peer.read_exact(5).await.unwrap();
        };

        let (report, ()) = tokio::join!(
            serve_session(&mut server, &catalog, &Approve, &options),
            client
        );
        assert_eq!(report.unwrap().downloads_served, 1);
    }
}
