//! Upload protocol: a sender offers one file, the receiver approves or
//! declines it before any payload is sent.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::channel::FramedChannel;
use super::transfer::{Direction, TransferRequest};
use super::{
    format_size, parse_decimal, validate_file_name, Digest, Result, APPROVAL_TOKEN,
    REJECTION_TOKEN,
};
use crate::catalog::{FileCatalog, FileDescriptor};

/// What the receiver is asked to approve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOffer {
    pub name: String,
    pub size: u64,
}

impl UploadOffer {
    pub fn human_size(&self) -> String {
        format_size(self.size)
    }
}

/// Approves or declines incoming uploads
#[async_trait]
pub trait UploadDecider: Send + Sync {
    async fn decide_upload(&self, offer: &UploadOffer) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Accepted(FileDescriptor),
    /// The receiver declined; nothing was transferred
    Rejected { name: String, size: u64 },
}

/// Sender side, after the mode selector was sent.
///
/// `descriptor` must describe the current content of the catalog entry: the
/// digest is announced as-is and exactly `descriptor.size` bytes are
/// streamed.
pub async fn send_upload<S>(
    channel: &mut FramedChannel<S>,
    catalog: &dyn FileCatalog,
    descriptor: &FileDescriptor,
) -> Result<UploadOutcome>
where
    S: AsyncRead + AsyncWrite,
{
    channel
        .write_lines(&[descriptor.name.clone(), descriptor.size.to_string()])
        .await?;

    let answer = channel.read_line_idle().await?;
    if answer != APPROVAL_TOKEN {
        info!("🚫 Upload of {} declined by peer", descriptor.name);
        return Ok(UploadOutcome::Rejected {
            name: descriptor.name.clone(),
            size: descriptor.size,
        });
    }

    channel.write_line(&descriptor.digest.to_hex()).await?;

    info!("📤 Uploading {} ({} bytes)", descriptor.name, descriptor.size);

    let mut source = catalog.open_for_read(&descriptor.name).await?;
    channel.send_from(&mut source, descriptor.size).await?;

    info!("✅ Uploaded {}", descriptor.name);

    Ok(UploadOutcome::Accepted(descriptor.clone()))
}

/// Receiver side, after the mode selector was read
pub async fn receive_upload<S>(
    channel: &mut FramedChannel<S>,
    catalog: &dyn FileCatalog,
    decider: &dyn UploadDecider,
    max_file_size: u64,
) -> Result<UploadOutcome>
where
    S: AsyncRead + AsyncWrite,
{
    let name = channel.read_line().await?;
    let size_line = channel.read_line().await?;
    let size = parse_decimal("file size", &size_line)?;

    let offer = UploadOffer { name, size };
    debug!("Upload offered: {} ({})", offer.name, offer.human_size());

    let approved = if let Err(e) = validate_file_name(&offer.name) {
        warn!("Refusing upload: {}", e);
        false
    } else if offer.size > max_file_size {
        warn!(
            "Refusing upload of {}: {} exceeds limit of {}",
            offer.name,
            offer.human_size(),
            format_size(max_file_size)
        );
        false
    } else {
        decider.decide_upload(&offer).await
    };

    if !approved {
        channel.write_line(REJECTION_TOKEN).await?;
        info!("🚫 Rejected upload of {}", offer.name);
        return Ok(UploadOutcome::Rejected {
            name: offer.name,
            size: offer.size,
        });
    }

    channel.write_line(APPROVAL_TOKEN).await?;

    let digest_line = channel.read_line().await?;
    let digest = Digest::from_hex(&digest_line)?;

    info!("📥 Receiving {} ({} bytes)", offer.name, offer.size);

    let request = TransferRequest {
        direction: Direction::Upload,
        name: offer.name,
        size: offer.size,
        digest,
    };

    request
        .receive(channel, catalog)
        .await
        .map(UploadOutcome::Accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DirectoryCatalog;
    use crate::protocol::TransferError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{duplex, DuplexStream};

    fn channels() -> (FramedChannel<DuplexStream>, FramedChannel<DuplexStream>) {
        let (a, b) = duplex(256 * 1024);
        (FramedChannel::new(a), FramedChannel::new(b))
    }

    fn catalog_with(files: &[(&str, &[u8])]) -> (TempDir, DirectoryCatalog) {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        let catalog = DirectoryCatalog::new(dir.path());
        (dir, catalog)
    }

    struct Always(bool, AtomicUsize);

    impl Always {
        fn new(approve: bool) -> Self {
            Self(approve, AtomicUsize::new(0))
        }

        fn asked(&self) -> usize {
            self.1.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UploadDecider for Always {
        async fn decide_upload(&self, _offer: &UploadOffer) -> bool {
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0
        }
    }

    #[tokio::test]
    async fn test_upload_round_trip() {
        let (_src_dir, src) = catalog_with(&[("report.pdf", b"%PDF-1.7 body")]);
        let (dst_dir, dst) = catalog_with(&[]);
        let (mut sender, mut receiver) = channels();
        let decider = Always::new(true);

        let descriptor = src.describe("report.pdf").await.unwrap();
        let (sent, received) = tokio::join!(
            send_upload(&mut sender, &src, &descriptor),
            receive_upload(&mut receiver, &dst, &decider, u64::MAX)
        );

        assert_eq!(sent.unwrap(), UploadOutcome::Accepted(descriptor.clone()));
        assert_eq!(received.unwrap(), UploadOutcome::Accepted(descriptor));
        assert_eq!(
            std::fs::read(dst_dir.path().join("report.pdf")).unwrap(),
            b"%PDF-1.7 body"
        );
        assert_eq!(decider.asked(), 1);
    }

    #[tokio::test]
    async fn test_rejection_sends_no_digest() {
        let (dst_dir, dst) = catalog_with(&[]);
        let (mut receiver, mut peer) = channels();
        let decider = Always::new(false);

        let script = async {
            peer.write_line("secret.txt").await.unwrap();
            peer.write_line("10").await.unwrap();
            assert_eq!(peer.read_line().await.unwrap(), REJECTION_TOKEN);
        };
        let ((), outcome) = tokio::join!(
            script,
            receive_upload(&mut receiver, &dst, &decider, u64::MAX)
        );

        assert_eq!(
            outcome.unwrap(),
            UploadOutcome::Rejected {
                name: "secret.txt".to_string(),
                size: 10
            }
        );
        assert!(!dst_dir.path().join("secret.txt").exists());
    }

    #[tokio::test]
    async fn test_sender_treats_any_other_token_as_rejection() {
        let (_src_dir, src) = catalog_with(&[("a.txt", b"abc")]);
        let (mut sender, mut peer) = channels();
        let descriptor = src.describe("a.txt").await.unwrap();

        let script = async {
            assert_eq!(peer.read_line().await.unwrap(), "a.txt");
            assert_eq!(peer.read_line().await.unwrap(), "3");
            peer.write_line("Yes").await.unwrap();
        };
        let (outcome, ()) = tokio::join!(send_upload(&mut sender, &src, &descriptor), script);
        assert!(matches!(outcome.unwrap(), UploadOutcome::Rejected { .. }));

        // The session is still in step: nothing followed the rejection
        drop(sender);
        assert!(matches!(
            peer.read_line().await,
            Err(TransferError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversize_is_rejected_without_asking() {
        let (_dst_dir, dst) = catalog_with(&[]);
        let (mut receiver, mut peer) = channels();
        let decider = Always::new(true);

        let script = async {
            peer.write_line("huge.iso").await.unwrap();
            peer.write_line("5000").await.unwrap();
            peer.read_line().await.unwrap()
        };
        let (answer, outcome) =
            tokio::join!(script, receive_upload(&mut receiver, &dst, &decider, 4999));

        assert_eq!(answer, REJECTION_TOKEN);
        assert!(matches!(outcome.unwrap(), UploadOutcome::Rejected { .. }));
        assert_eq!(decider.asked(), 0);
    }

    #[tokio::test]
    async fn test_unsafe_name_is_rejected_without_asking() {
        let (dst_dir, dst) = catalog_with(&[]);
        let (mut receiver, mut peer) = channels();
        let decider = Always::new(true);

        let script = async {
            peer.write_line("../escape.sh").await.unwrap();
            peer.write_line("4").await.unwrap();
            peer.read_line().await.unwrap()
        };
        let (answer, outcome) =
            tokio::join!(script, receive_upload(&mut receiver, &dst, &decider, u64::MAX));

        assert_eq!(answer, REJECTION_TOKEN);
        assert!(matches!(outcome.unwrap(), UploadOutcome::Rejected { .. }));
        assert_eq!(decider.asked(), 0);
        assert!(!dst_dir.path().parent().unwrap().join("escape.sh").exists());
    }

    #[tokio::test]
    async fn test_malformed_digest_after_approval() {
        let (_dst_dir, dst) = catalog_with(&[]);
        let (mut receiver, mut peer) = channels();
        let decider = Always::new(true);

        let script = async {
            peer.write_line("a.bin").await.unwrap();
            peer.write_line("2").await.unwrap();
            assert_eq!(peer.read_line().await.unwrap(), APPROVAL_TOKEN);
            peer.write_line("not-a-digest").await.unwrap();
        };
        let ((), outcome) = tokio::join!(
            script,
            receive_upload(&mut receiver, &dst, &decider, u64::MAX)
        );

        assert!(matches!(outcome, Err(TransferError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_malformed_size_is_violation() {
        let (_dst_dir, dst) = catalog_with(&[]);
        let (mut receiver, mut peer) = channels();
        let decider = Always::new(true);

        peer.write_line("a.bin").await.unwrap();
        peer.write_line("-7").await.unwrap();

        let outcome = receive_upload(&mut receiver, &dst, &decider, u64::MAX).await;
        assert!(matches!(outcome, Err(TransferError::ProtocolViolation(_))));
        assert_eq!(decider.asked(), 0);
    }

    #[tokio::test]
    async fn test_sender_vanishing_after_approval_times_out() {
        let (dst_dir, dst) = catalog_with(&[]);
        let (local, remote) = duplex(1024);
        let mut receiver =
            FramedChannel::new(local).with_timeouts(Some(Duration::from_millis(50)), None);
        let mut peer = FramedChannel::new(remote);
        let decider = Always::new(true);

        peer.write_line("late.bin").await.unwrap();
        peer.write_line("8").await.unwrap();

        let outcome = receive_upload(&mut receiver, &dst, &decider, u64::MAX).await;
        assert!(matches!(outcome, Err(TransferError::Timeout(_))));
        assert_eq!(peer.read_line().await.unwrap(), APPROVAL_TOKEN);
        assert!(!dst_dir.path().join("late.bin").exists());
    }

    #[tokio::test]
    async fn test_sender_stalling_mid_payload_times_out() {
        let (_dst_dir, dst) = catalog_with(&[]);
        let (local, remote) = duplex(1024);
        let mut receiver =
            FramedChannel::new(local).with_timeouts(Some(Duration::from_millis(50)), None);
        let mut peer = FramedChannel::new(remote);
        let decider = Always::new(true);

        peer.write_line("part.bin").await.unwrap();
        peer.write_line("8").await.unwrap();

        let script = async {
            assert_eq!(peer.read_line().await.unwrap(), APPROVAL_TOKEN);
            peer.write_line(&Digest::of_bytes(b"12345678").to_hex()).await.unwrap();
            peer.write_bytes(b"1234").await.unwrap();
        };
        let ((), outcome) = tokio::join!(
            script,
            receive_upload(&mut receiver, &dst, &decider, u64::MAX)
        );

        assert!(matches!(outcome, Err(TransferError::Timeout(_))));
        drop(peer);
    }

    #[test]
    fn test_offer_human_size() {
        let offer = UploadOffer {
            name: "x".to_string(),
            size: 1500,
        };
        assert_eq!(offer.human_size(), "1.5 kB");
    }
}
