//! SHA-256 content digests.
//!
//! Digests are compared as raw bytes. Hex encoding only happens at the wire
//! boundary.

use std::fmt;

use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Result, TransferError, CHUNK_SIZE};

/// Length of a hex-encoded digest on the wire
pub const DIGEST_HEX_LEN: usize = 64;

/// A 256-bit SHA-256 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Digest of an in-memory buffer
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = StreamingHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Lowercase hex form sent on the wire
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a digest line received from a peer
    pub fn from_hex(line: &str) -> Result<Self> {
        if line.len() != DIGEST_HEX_LEN {
            return Err(TransferError::violation(format!(
                "digest must be {} hex characters, got {}",
                DIGEST_HEX_LEN,
                line.len()
            )));
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(line, &mut bytes)
            .map_err(|e| TransferError::violation(format!("invalid digest {:?}: {}", line, e)))?;

        Ok(Self(bytes))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// Streaming hash calculator for large files
pub struct StreamingHasher {
    hasher: Sha256,
    bytes_processed: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            bytes_processed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    pub fn finalize(self) -> Digest {
        Digest(self.hasher.finalize().into())
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream a whole source through SHA-256, returning the digest and the
/// number of bytes read
pub async fn digest_stream<R>(source: &mut R) -> Result<(Digest, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = source
            .read(&mut buffer)
            .await
            .map_err(TransferError::DigestComputationFailed)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let bytes = hasher.bytes_processed();
    Ok((hasher.finalize(), bytes))
}

/// Digest of an entire byte source
pub async fn digest_of<R>(source: &mut R) -> Result<Digest>
where
    R: AsyncRead + Unpin + ?Sized,
{
    digest_stream(source).await.map(|(digest, _)| digest)
}

pub fn digest_matches(expected: &Digest, actual: &Digest) -> bool {
    expected.as_bytes() == actual.as_bytes()
}
