//! Framed channel over an established byte stream.
//!
//! Control messages are `\n`-terminated lines, bulk payloads are raw bytes
//! of an announced length. Every operation advances the shared stream
//! position and none of them can be retried, so any failure here ends the
//! session.

use std::future::Future;
use std::io;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
    ReadHalf, WriteHalf,
};
use tokio::time::timeout;

use super::{Result, TransferError, CHUNK_SIZE, MAX_LINE_LEN};

/// Line and length framing over one connection.
///
/// All methods take `&mut self`, so a read and a write are never in flight
/// at the same time on the same connection.
pub struct FramedChannel<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: BufWriter<WriteHalf<S>>,
    io_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    progress_style: Option<ProgressStyle>,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            io_timeout: None,
            idle_timeout: None,
            progress_style: None,
        }
    }

    /// Set the per-step deadline and the deadline for reads that wait on a
    /// human on the other side
    pub fn with_timeouts(
        mut self,
        io_timeout: Option<Duration>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        self.io_timeout = io_timeout;
        self.idle_timeout = idle_timeout;
        self
    }

    /// Show a progress bar with this style for every bulk transfer
    pub fn set_progress_style(&mut self, style: ProgressStyle) {
        self.progress_style = Some(style);
    }

    /// Read one line with the I/O deadline, delimiter stripped
    pub async fn read_line(&mut self) -> Result<String> {
        let limit = self.io_timeout;
        self.read_line_within(limit).await
    }

    /// Read one line with the idle deadline
    pub async fn read_line_idle(&mut self) -> Result<String> {
        let limit = self.idle_timeout;
        self.read_line_within(limit).await
    }

    /// Read one line with an explicit deadline
    pub async fn read_line_within(&mut self, limit: Option<Duration>) -> Result<String> {
        let mut line = Vec::new();
        let mut bounded = (&mut self.reader).take(MAX_LINE_LEN as u64);
        let read = with_deadline(limit, bounded.read_until(b'\n', &mut line)).await?;

        if read == 0 {
            return Err(TransferError::ConnectionClosed);
        }

        if line.last() != Some(&b'\n') {
            if line.len() >= MAX_LINE_LEN {
                return Err(TransferError::MalformedLine(format!(
                    "no delimiter within {} bytes",
                    MAX_LINE_LEN
                )));
            }
            // End of stream in the middle of a line
            return Err(TransferError::ConnectionClosed);
        }

        line.pop();
        String::from_utf8(line)
            .map_err(|_| TransferError::MalformedLine("line is not valid UTF-8".to_string()))
    }

    /// Write one line and flush it to the peer
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        if line.contains('\n') {
            return Err(TransferError::violation(format!(
                "refusing to send a line containing a delimiter: {:?}",
                line
            )));
        }

        let writer = &mut self.writer;
        with_deadline(self.io_timeout, async move {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        })
        .await
    }

    /// Write several lines with a single flush at the end
    pub async fn write_lines(&mut self, lines: &[String]) -> Result<()> {
        if let Some(line) = lines.iter().find(|line| line.contains('\n')) {
            return Err(TransferError::violation(format!(
                "refusing to send a line containing a delimiter: {:?}",
                line
            )));
        }

        let writer = &mut self.writer;
        with_deadline(self.io_timeout, async move {
            for line in lines {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            writer.flush().await
        })
        .await
    }

    /// Write raw bytes and flush them
    pub async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let writer = &mut self.writer;
        with_deadline(self.io_timeout, async move {
            writer.write_all(data).await?;
            writer.flush().await
        })
        .await
    }

    /// Read exactly `n` bytes
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(n.min(CHUNK_SIZE));
        self.copy_exact_to(&mut data, n as u64).await?;
        Ok(data)
    }

    /// Copy exactly `size` payload bytes from the peer into `sink`
    pub async fn copy_exact_to<W>(&mut self, sink: &mut W, size: u64) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let progress = self.take_progress(size);
        let result = self.copy_chunks_to(sink, size, &progress).await;
        finish_progress(&progress, &result);
        result
    }

    async fn copy_chunks_to<W>(
        &mut self,
        sink: &mut W,
        size: u64,
        progress: &ProgressBar,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut received: u64 = 0;

        while received < size {
            let want = (size - received).min(CHUNK_SIZE as u64) as usize;
            let n = with_deadline(self.io_timeout, self.reader.read(&mut buffer[..want])).await?;
            if n == 0 {
                return Err(TransferError::ShortRead {
                    expected: size,
                    received,
                });
            }

            sink.write_all(&buffer[..n])
                .await
                .map_err(|e| TransferError::local_io("failed to write received data", e))?;

            received += n as u64;
            progress.set_position(received);
        }

        sink.flush()
            .await
            .map_err(|e| TransferError::local_io("failed to flush received data", e))?;

        Ok(received)
    }

    /// Send exactly `size` bytes read from `source` to the peer
    pub async fn send_from<R>(&mut self, source: &mut R, size: u64) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let progress = self.take_progress(size);
        let result = self.send_chunks_from(source, size, &progress).await;
        finish_progress(&progress, &result);
        result
    }

    async fn send_chunks_from<R>(
        &mut self,
        source: &mut R,
        size: u64,
        progress: &ProgressBar,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut sent: u64 = 0;

        while sent < size {
            let want = (size - sent).min(CHUNK_SIZE as u64) as usize;
            let n = source
                .read(&mut buffer[..want])
                .await
                .map_err(|e| TransferError::local_io("failed to read local data", e))?;
            if n == 0 {
                return Err(TransferError::local_io(
                    "local data ended early",
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("source ended after {} of {} bytes", sent, size),
                    ),
                ));
            }

            with_deadline(self.io_timeout, self.writer.write_all(&buffer[..n])).await?;

            sent += n as u64;
            progress.set_position(sent);
        }

        with_deadline(self.io_timeout, self.writer.flush()).await?;

        Ok(sent)
    }

    fn take_progress(&self, size: u64) -> ProgressBar {
        match &self.progress_style {
            Some(style) => ProgressBar::new(size).with_style(style.clone()),
            None => ProgressBar::hidden(),
        }
    }
}

fn finish_progress<T>(progress: &ProgressBar, result: &Result<T>) {
    if result.is_ok() {
        progress.finish();
    } else {
        progress.abandon();
    }
}

/// Run a stream operation under an optional deadline
async fn with_deadline<F, T>(limit: Option<Duration>, operation: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    let outcome = match limit {
        Some(limit) => timeout(limit, operation)
            .await
            .map_err(|_| TransferError::Timeout(limit))?,
        None => operation.await,
    };

    outcome.map_err(stream_error)
}

/// Map a stream error, folding every flavor of disconnect into one variant
fn stream_error(e: io::Error) -> TransferError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected => TransferError::ConnectionClosed,
        _ => TransferError::Stream(e),
    }
}
