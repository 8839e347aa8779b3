//! Buffered streaming I/O over a single file.
//!
//! The writer hands out stable absolute offsets for bytes it has buffered
//! but not yet flushed, which lets the commit pipeline interleave data
//! records and spill records while recording exact on-disk positions in
//! bucket entries. The reader is the symmetric streamer used by verify,
//! rekey and visit.

use crate::error::{Error, Result};
use crate::file::File;

/// Default buffer size for bulk transfers.
pub const BULK_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Append-side streamer.
pub struct BulkWriter<'a, F: File> {
    file: &'a F,
    /// Absolute file offset where the buffer begins.
    base: u64,
    buf: Vec<u8>,
    cap: usize,
}

impl<'a, F: File> BulkWriter<'a, F> {
    /// Start appending at `offset`, flushing whenever the buffer would
    /// exceed `cap` bytes.
    pub fn new(file: &'a F, offset: u64, cap: usize) -> Self {
        Self {
            file,
            base: offset,
            buf: Vec::new(),
            cap,
        }
    }

    /// Reserve `n` bytes of buffer space.
    ///
    /// Returns the absolute offset at which the bytes will land and the
    /// slice to fill in. The offset is stable across later flushes. A
    /// reservation larger than the buffer capacity is honored; it simply
    /// flushes on the next call.
    pub fn prepare(&mut self, n: usize) -> Result<(u64, &mut [u8])> {
        if !self.buf.is_empty() && self.buf.len() + n > self.cap {
            self.flush()?;
        }
        let start = self.buf.len();
        self.buf.resize(start + n, 0);
        Ok((self.base + start as u64, &mut self.buf[start..]))
    }

    /// Absolute offset of the next byte to be reserved.
    pub fn offset(&self) -> u64 {
        self.base + self.buf.len() as u64
    }

    /// Write any buffered bytes to the file.
    pub fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.file.write(self.base, &self.buf)?;
        self.base += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }
}

/// Read-side streamer over the byte range `[first, last)`.
pub struct BulkReader<'a, F: File> {
    file: &'a F,
    /// Absolute file offset of `buf[0]`.
    base: u64,
    buf: Vec<u8>,
    pos: usize,
    last: u64,
    cap: usize,
}

impl<'a, F: File> BulkReader<'a, F> {
    pub fn new(file: &'a F, first: u64, last: u64, cap: usize) -> Self {
        Self {
            file,
            base: first,
            buf: Vec::new(),
            pos: 0,
            last,
            cap: cap.max(1),
        }
    }

    /// Absolute offset of the next unread byte.
    pub fn offset(&self) -> u64 {
        self.base + self.pos as u64
    }

    pub fn eof(&self) -> bool {
        self.offset() >= self.last
    }

    /// Return the next `n` bytes as one contiguous slice, refilling the
    /// buffer as needed. Fails with [`Error::ShortRead`] if fewer than
    /// `n` bytes remain before the end of the range.
    pub fn read(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.buf.len() {
            self.buf.drain(..self.pos);
            self.base += self.pos as u64;
            self.pos = 0;

            let have = self.buf.len();
            let end = self.base + have as u64;
            let avail = self.last.saturating_sub(end);
            if (have as u64).saturating_add(avail) < n as u64 {
                return Err(Error::ShortRead);
            }
            let target = (self.cap as u64)
                .min(have as u64 + avail)
                .max(n as u64) as usize;
            self.buf.resize(target, 0);
            self.file.read(end, &mut self.buf[have..])?;
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
}
