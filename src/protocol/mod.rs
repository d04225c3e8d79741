//! Session Protocol Module
//!
//! This module defines the line-based file transfer protocol:
//! - Framed channel primitives over an established byte stream
//! - Integrity verification using SHA-256 digests
//! - Download (provider/requester) and upload (sender/receiver) roles
//!
//! ## Protocol Overview
//!
//! Every control message is a UTF-8 line terminated by `\n`. Bulk payloads
//! are raw bytes whose length was announced on a previous line.
//!
//! ```text
//! Requester                              Provider
//!   |-- "1" (download) ------------------->|
//!   |<------------------------- N ---------|
//!   |<------------------- name x N --------|
//!   |-- selection (1..=N) ---------------->|
//!   |<------------------------ size -------|
//!   |<---------------------- digest -------|
//!   |<------------------ size raw bytes ---|
//!
//! Sender                                 Receiver
//!   |-- "2" (upload) --------------------->|
//!   |-- name ----------------------------->|
//!   |-- size ----------------------------->|
//!   |<------------------ "yes" | other ----|
//!   |-- digest (only after "yes") -------->|
//!   |-- size raw bytes ------------------->|
//! ```
//!
//! The exchange is strictly half-duplex: a peer never writes while the
//! other side is expected to write.

use std::io;
use std::time::Duration;

use thiserror::Error;

pub mod channel;
pub mod download;
pub mod integrity;
pub mod transfer;
pub mod upload;

pub use channel::FramedChannel;
pub use download::{DownloadOutcome, FileSelector};
pub use upload::{UploadDecider, UploadOffer, UploadOutcome};
pub use integrity::{digest_matches, digest_of, digest_stream, Digest, StreamingHasher};
pub use transfer::{Direction, TransferRequest};

/// Maximum control line length in bytes, delimiter included
pub const MAX_LINE_LEN: usize = 4096;

/// Chunk size for bulk transfers (64 KB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on the number of names a provider may announce
pub const MAX_LISTING_ENTRIES: usize = 100_000;

/// Largest size that can be announced on the wire (sizes are signed 64-bit)
pub const MAX_ANNOUNCED_SIZE: u64 = i64::MAX as u64;

/// Longest accepted file name
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Approval token sent by an upload receiver
pub const APPROVAL_TOKEN: &str = "yes";

/// Token a receiver sends when it declines an upload
pub const REJECTION_TOKEN: &str = "no";

/// Protocol errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("malformed line: {0}")]
    MalformedLine(String),

    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: u64, received: u64 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("integrity mismatch for {name}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        name: String,
        expected: Digest,
        actual: Digest,
    },

    #[error("digest computation failed: {0}")]
    DigestComputationFailed(#[source] io::Error),

    #[error("{context}: {source}")]
    LocalIo {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("stream error: {0}")]
    Stream(#[source] io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, TransferError>;

impl TransferError {
    pub(crate) fn violation(message: impl Into<String>) -> Self {
        TransferError::ProtocolViolation(message.into())
    }

    pub(crate) fn local_io(context: impl Into<String>, source: io::Error) -> Self {
        TransferError::LocalIo {
            context: context.into(),
            source,
        }
    }

    /// Whether the session can no longer continue after this error.
    ///
    /// An integrity mismatch is detected only after the whole payload has
    /// been consumed, so the stream is still in step with the peer.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, TransferError::IntegrityMismatch { .. })
    }

    /// Whether the peer went away
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TransferError::ConnectionClosed | TransferError::ShortRead { .. }
        )
    }
}

/// Session mode selected by the requesting peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Requester downloads a file from the provider
    Download,
    /// Sender uploads a file to the receiver
    Upload,
}

impl Mode {
    /// Wire code for this mode
    pub fn code(self) -> &'static str {
        match self {
            Mode::Download => "1",
            Mode::Upload => "2",
        }
    }

    pub fn from_code(line: &str) -> Result<Self> {
        match line {
            "1" => Ok(Mode::Download),
            "2" => Ok(Mode::Upload),
            other => Err(TransferError::violation(format!(
                "unknown mode selector {:?}",
                other
            ))),
        }
    }
}

/// Parse a non-negative decimal field (count, size, selection)
pub fn parse_decimal(field: &str, line: &str) -> Result<u64> {
    if line.is_empty() || !line.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TransferError::violation(format!(
            "{} is not a non-negative decimal: {:?}",
            field, line
        )));
    }

    match line.parse::<u64>() {
        Ok(value) if value <= MAX_ANNOUNCED_SIZE => Ok(value),
        _ => Err(TransferError::violation(format!(
            "{} out of range: {}",
            field, line
        ))),
    }
}

/// Check a 1-based selection against a listing of `max` entries
pub fn is_valid_selection(selection: usize, max: usize) -> bool {
    selection >= 1 && selection <= max
}

/// Parse locally typed menu input into a valid 1-based selection
pub fn parse_selection(input: &str, max: usize) -> Option<usize> {
    input
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|&n| is_valid_selection(n, max))
}

/// Validate a file name exchanged on the wire
///
/// # Security
/// Names address entries of a flat catalog directory. Anything that could
/// escape it (separators, `..`) or break line framing is refused.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TransferError::violation("empty file name"));
    }

    if name.len() > MAX_FILE_NAME_LEN {
        return Err(TransferError::violation(format!(
            "file name longer than {} bytes",
            MAX_FILE_NAME_LEN
        )));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(TransferError::violation(format!(
            "path separators not allowed in {:?}",
            name
        )));
    }

    if name.starts_with('.') {
        return Err(TransferError::violation(format!(
            "hidden or relative name not allowed: {:?}",
            name
        )));
    }

    if name.chars().any(char::is_control) {
        return Err(TransferError::violation(format!(
            "control characters not allowed in {:?}",
            name
        )));
    }

    Ok(())
}

/// Format a byte count with decimal units for display
pub fn format_size(bytes: u64) -> String {
    const BASE: u64 = 1000;
    const UNITS: [char; 6] = ['k', 'M', 'G', 'T', 'P', 'E'];

    if bytes < BASE {
        return format!("{} B", bytes);
    }

    let mut div = BASE;
    let mut exp = 0;
    let mut n = bytes / BASE;
    while n >= BASE {
        div *= BASE;
        exp += 1;
        n /= BASE;
    }

    format!("{:.1} {}B", bytes as f64 / div as f64, UNITS[exp])
}
