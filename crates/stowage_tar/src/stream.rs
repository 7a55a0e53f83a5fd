//! Bounded buffer stream helpers shared by the reader and the writer.
//!
//! All loops poll a [`CancellationToken`] between chunks so that long copies
//! can be aborted promptly.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::header::BLOCK_SIZE;
use crate::ArchiveError;

/// Size of the buffer used for copying entry bodies.
pub const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Fails with [`ArchiveError::Cancelled`] if cancellation was requested.
pub fn check_cancelled(cancellation: &CancellationToken) -> Result<(), ArchiveError> {
    if cancellation.is_cancelled() {
        Err(ArchiveError::Cancelled)
    } else {
        Ok(())
    }
}

/// Reads exactly one block.
///
/// Returns `false` if the stream ended cleanly before the first byte of the
/// block, fails with [`ArchiveError::TruncatedStream`] if it ended inside it.
pub fn read_block(reader: &mut impl Read, block: &mut [u8; BLOCK_SIZE]) -> Result<bool, ArchiveError> {
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        match reader.read(&mut block[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(ArchiveError::TruncatedStream {
                    expected: BLOCK_SIZE as u64,
                    actual: filled as u64,
                })
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(truncated_or_io(err, BLOCK_SIZE as u64, filled as u64)),
        }
    }
    Ok(true)
}

/// Copies exactly `len` bytes from `reader` to `writer`, calling `on_chunk`
/// with the size of every chunk after it was written.
pub fn copy_exact(
    reader: &mut impl Read,
    writer: &mut impl Write,
    len: u64,
    cancellation: &CancellationToken,
    mut on_chunk: impl FnMut(u64),
) -> Result<(), ArchiveError> {
    let mut buffer = vec![0u8; len.clamp(1, COPY_BUFFER_SIZE as u64) as usize];
    let mut copied = 0u64;
    while copied < len {
        check_cancelled(cancellation)?;
        let want = (len - copied).min(buffer.len() as u64) as usize;
        let read = match reader.read(&mut buffer[..want]) {
            Ok(0) => {
                return Err(ArchiveError::TruncatedStream {
                    expected: len,
                    actual: copied,
                })
            }
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(truncated_or_io(err, len, copied)),
        };
        writer.write_all(&buffer[..read])?;
        copied += read as u64;
        on_chunk(read as u64);
    }
    Ok(())
}

/// Copies everything until the end of `reader`. Returns the number of bytes
/// copied.
pub fn copy_to_end(
    reader: &mut impl Read,
    writer: &mut impl Write,
    cancellation: &CancellationToken,
) -> Result<u64, ArchiveError> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        check_cancelled(cancellation)?;
        let read = match reader.read(&mut buffer) {
            Ok(0) => return Ok(copied),
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        writer.write_all(&buffer[..read])?;
        copied += read as u64;
    }
}

/// Reads and discards exactly `len` bytes.
pub fn skip_exact(
    reader: &mut impl Read,
    len: u64,
    cancellation: &CancellationToken,
) -> Result<(), ArchiveError> {
    copy_exact(reader, &mut std::io::sink(), len, cancellation, |_| {})
}

/// Reads exactly `len` bytes into memory. Only meant for small records such
/// as long names, callers must bound `len`.
pub fn read_exact_vec(
    reader: &mut impl Read,
    len: u64,
    cancellation: &CancellationToken,
) -> Result<Vec<u8>, ArchiveError> {
    let mut out = Vec::with_capacity(len as usize);
    copy_exact(reader, &mut out, len, cancellation, |_| {})?;
    Ok(out)
}

/// Maps an unexpected end of file to [`ArchiveError::TruncatedStream`].
pub(crate) fn truncated_or_io(err: std::io::Error, expected: u64, actual: u64) -> ArchiveError {
    if err.kind() == ErrorKind::UnexpectedEof {
        ArchiveError::TruncatedStream { expected, actual }
    } else {
        ArchiveError::IoError(err)
    }
}

/// A reader that can look at the first bytes of a stream without consuming
/// them.
pub struct PeekReader<R> {
    inner: R,
    pending: Vec<u8>,
    position: usize,
}

impl<R: Read> PeekReader<R> {
    /// Wraps `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            position: 0,
        }
    }

    /// Returns up to `len` bytes from the front of the stream. The bytes are
    /// pushed back and returned again by subsequent reads. Fewer bytes are
    /// only returned if the stream is shorter than `len`.
    pub fn peek(&mut self, len: usize) -> std::io::Result<&[u8]> {
        if self.position > 0 {
            self.pending.drain(..self.position);
            self.position = 0;
        }
        while self.pending.len() < len {
            let mut chunk = vec![0u8; len - self.pending.len()];
            match self.inner.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(&self.pending[..len.min(self.pending.len())])
    }

    /// Returns the wrapped reader. Bytes that were peeked but not read are
    /// lost.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for PeekReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position < self.pending.len() {
            let available = &self.pending[self.position..];
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
            self.position += n;
            if self.position == self.pending.len() {
                self.pending.clear();
                self.position = 0;
            }
            return Ok(n);
        }
        self.inner.read(buf)
    }
}

/// A reader that counts the bytes read through it. The count can be observed
/// from another place through [`CountingReader::counter`].
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    /// Wraps `inner`, starting at zero.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A shared handle to the number of bytes read so far.
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.count.clone()
    }

    /// The number of bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}
