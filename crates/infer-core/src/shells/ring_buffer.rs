//! Fixed-capacity output capture for background shells
//!
//! Keeps the most recent `capacity` bytes of a process's combined output
//! together with a running count of every byte ever written. Offsets handed
//! to readers are positions in that unbounded byte stream, so a reader can
//! resume where it left off and learn how much it missed if the writer
//! lapped it.

use std::fmt;
use std::io;

use parking_lot::RwLock;

struct Inner {
    buf: Vec<u8>,
    /// Next write position once the buffer is full; also the oldest byte.
    write_pos: usize,
    total_written: u64,
}

/// Circular byte buffer shared between one writer and many readers.
pub struct OutputRingBuffer {
    capacity: usize,
    inner: RwLock<Inner>,
}

/// Bytes returned by [`OutputRingBuffer::read_from`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunk {
    pub data: Vec<u8>,
    /// Offset to pass on the next read.
    pub next_offset: u64,
    /// Bytes between the requested offset and the oldest retained byte.
    pub skipped: u64,
}

impl OutputRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: RwLock::new(Inner {
                buf: Vec::with_capacity(capacity.min(64 * 1024)),
                write_pos: 0,
                total_written: 0,
            }),
        }
    }

    /// Append bytes, overwriting the oldest data once full. Returns the
    /// number of bytes accepted, which is always `data.len()`.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let cap = self.capacity;
        let mut inner = self.inner.write();
        inner.total_written += data.len() as u64;

        if data.len() >= cap {
            inner.buf.clear();
            inner.buf.extend_from_slice(&data[data.len() - cap..]);
            inner.write_pos = 0;
            return data.len();
        }

        let mut rest = data;
        if inner.buf.len() < cap {
            let take = (cap - inner.buf.len()).min(rest.len());
            inner.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            inner.write_pos = inner.buf.len() % cap;
        }

        while !rest.is_empty() {
            let pos = inner.write_pos;
            let n = (cap - pos).min(rest.len());
            inner.buf[pos..pos + n].copy_from_slice(&rest[..n]);
            inner.write_pos = (pos + n) % cap;
            rest = &rest[n..];
        }

        data.len()
    }

    /// Everything written at or after `offset` that is still retained.
    ///
    /// An offset older than the retained window starts at the oldest byte
    /// and reports the gap in `skipped`; an offset at or past the end
    /// yields no data.
    pub fn read_from(&self, offset: u64) -> ReadChunk {
        let inner = self.inner.read();
        let total = inner.total_written;
        let oldest = total - inner.buf.len() as u64;

        if offset >= total {
            return ReadChunk {
                data: Vec::new(),
                next_offset: total,
                skipped: 0,
            };
        }

        let start = offset.max(oldest);
        let skip = (start - oldest) as usize;
        let data = Self::ordered(&inner, self.capacity)
            .into_iter()
            .skip(skip)
            .collect();

        ReadChunk {
            data,
            next_offset: total,
            skipped: start - offset,
        }
    }

    /// The last `max_bytes` retained bytes.
    pub fn recent(&self, max_bytes: usize) -> Vec<u8> {
        let inner = self.inner.read();
        let ordered = Self::ordered(&inner, self.capacity);
        let start = ordered.len().saturating_sub(max_bytes);
        ordered[start..].to_vec()
    }

    /// All retained bytes, oldest first.
    pub fn contents(&self) -> Vec<u8> {
        let inner = self.inner.read();
        Self::ordered(&inner, self.capacity)
    }

    /// Retained output as lossy UTF-8.
    pub fn contents_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    pub fn total_written(&self) -> u64 {
        self.inner.read().total_written
    }

    /// Bytes currently retained.
    pub fn size(&self) -> usize {
        self.inner.read().buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop retained bytes and reset the write counter.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.buf.clear();
        inner.write_pos = 0;
        inner.total_written = 0;
    }

    fn ordered(inner: &Inner, cap: usize) -> Vec<u8> {
        if inner.buf.len() < cap {
            return inner.buf.clone();
        }
        let mut out = Vec::with_capacity(cap);
        out.extend_from_slice(&inner.buf[inner.write_pos..]);
        out.extend_from_slice(&inner.buf[..inner.write_pos]);
        out
    }
}

impl io::Write for &OutputRingBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(OutputRingBuffer::write(*self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for OutputRingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputRingBuffer")
            .field("capacity", &self.capacity)
            .field("size", &self.size())
            .field("total_written", &self.total_written())
            .finish()
    }
}

impl fmt::Display for OutputRingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        let size = inner.buf.len();
        let total = inner.total_written;
        write!(
            f,
            "{size}/{} bytes retained, {total} written, {} dropped",
            self.capacity,
            total - size as u64
        )
    }
}
