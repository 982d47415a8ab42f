use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::pool::{BufferPool, PoolInner};
use crate::error::{Error, Result};

enum Storage<'a> {
    /// Leased from a pool, handed back on drop
    Pooled { data: Vec<u8>, pool: Arc<PoolInner> },
    /// View over caller memory, nothing to hand back
    Borrowed(&'a mut [u8]),
}

/// A byte region with a movable payload window `[start, end)`.
///
/// Bytes before `start` are headroom that protocol layers can claim with
/// [`extend_header`](Buffer::extend_header) to prepend a header without
/// copying the payload. Bytes after `end` are free for writing.
///
/// A buffer has exactly one owner. [`release`](Buffer::release) consumes it and
/// dropping it has the same effect, so pooled storage goes back exactly once on
/// every path, including early returns on error. Buffers created with
/// [`wrap`](Buffer::wrap) borrow caller memory and release nothing.
pub struct Buffer<'a> {
    storage: Storage<'a>,
    start: usize,
    end: usize,
    reserved_headroom: usize,
}

impl Buffer<'static> {
    pub(super) fn pooled(data: Vec<u8>, headroom: usize, pool: Arc<PoolInner>) -> Self {
        Self {
            storage: Storage::Pooled { data, pool },
            start: headroom,
            end: headroom,
            reserved_headroom: headroom,
        }
    }

    /// Lease `size` bytes of payload room from the global pool.
    pub fn new(size: usize) -> Self {
        BufferPool::global().allocate(size, 0, 0)
    }

    /// Lease from the global pool with headroom and tailroom reserved.
    pub fn with_reserve(size: usize, headroom: usize, tailroom: usize) -> Self {
        BufferPool::global().allocate(size, headroom, tailroom)
    }

    /// Pooled buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buffer = Self::new(data.len());
        buffer.free_tail()[..data.len()].copy_from_slice(data);
        buffer.truncate(data.len());
        buffer
    }
}

impl<'a> Buffer<'a> {
    /// Empty buffer that writes into `slice`. Releasing it is a no-op.
    pub fn wrap(slice: &'a mut [u8]) -> Self {
        Self {
            storage: Storage::Borrowed(slice),
            start: 0,
            end: 0,
            reserved_headroom: 0,
        }
    }

    fn data(&self) -> &[u8] {
        match &self.storage {
            Storage::Pooled { data, .. } => data.as_slice(),
            Storage::Borrowed(slice) => &**slice,
        }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Pooled { data, .. } => data.as_mut_slice(),
            Storage::Borrowed(slice) => &mut **slice,
        }
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.storage, Storage::Pooled { .. })
    }

    /// Offset of the first payload byte, which is also the headroom left.
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn capacity(&self) -> usize {
        self.data().len()
    }

    /// Headroom requested at allocation time.
    pub fn reserved_headroom(&self) -> usize {
        self.reserved_headroom
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Bytes that can still be written after the payload.
    pub fn free_len(&self) -> usize {
        self.capacity() - self.end
    }

    /// The payload.
    pub fn bytes(&self) -> &[u8] {
        &self.data()[self.start..self.end]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let (start, end) = (self.start, self.end);
        &mut self.data_mut()[start..end]
    }

    /// The writable region `[end, capacity)`.
    pub fn free_tail(&mut self) -> &mut [u8] {
        let end = self.end;
        &mut self.data_mut()[end..]
    }

    /// Set the payload length to `n` after writing into [`free_tail`](Buffer::free_tail).
    ///
    /// # Panics
    /// If `start + n` exceeds the capacity.
    pub fn truncate(&mut self, n: usize) {
        assert!(
            self.start + n <= self.capacity(),
            "truncate({n}) past capacity {}",
            self.capacity()
        );
        self.end = self.start + n;
    }

    /// Move `start` back by `n` bytes and return the claimed region for the header.
    ///
    /// Never copies or reallocates: if fewer than `n` bytes of headroom remain the
    /// call fails with [`Error::HeadroomExhausted`] and the buffer is unchanged.
    pub fn extend_header(&mut self, n: usize) -> Result<&mut [u8]> {
        if n > self.start {
            return Err(Error::HeadroomExhausted {
                needed: n,
                available: self.start,
            });
        }
        self.start -= n;
        let start = self.start;
        Ok(&mut self.data_mut()[start..start + n])
    }

    /// Grow the payload by `n` bytes at the tail and return them for writing.
    pub fn extend(&mut self, n: usize) -> Result<&mut [u8]> {
        let available = self.free_len();
        if n > available {
            return Err(Error::ShortBuffer { needed: n, available });
        }
        let end = self.end;
        self.end += n;
        Ok(&mut self.data_mut()[end..end + n])
    }

    /// Append `src`, failing without writing anything if it does not fit.
    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        self.extend(src.len())?.copy_from_slice(src);
        Ok(src.len())
    }

    /// Drop `n` bytes from the front of the payload.
    pub fn advance(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
    }

    /// Empty the payload and restore the original headroom.
    pub fn reset(&mut self) {
        self.start = self.reserved_headroom;
        self.end = self.reserved_headroom;
    }

    /// Copy the payload into pooled storage owned by nobody else, keeping the
    /// original headroom and free space.
    pub fn duplicate(&self) -> Buffer<'static> {
        let mut copy =
            BufferPool::global().allocate(self.len(), self.start, self.free_len());
        copy.free_tail()[..self.len()].copy_from_slice(self.bytes());
        copy.truncate(self.len());
        copy
    }

    /// Return pooled storage. Equivalent to dropping the buffer.
    pub fn release(self) {}

    /// Read exactly `n` bytes from `reader` onto the end of the payload.
    ///
    /// Fails with [`Error::ShortBuffer`] before reading if there is no room and with
    /// [`Error::ShortRead`] if the source ends early. On failure the payload length
    /// is left unchanged.
    pub async fn read_full_from<R>(&mut self, reader: &mut R, n: usize) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let available = self.free_len();
        if n > available {
            return Err(Error::ShortBuffer { needed: n, available });
        }
        let end = self.end;
        reader
            .read_exact(&mut self.data_mut()[end..end + n])
            .await
            .map_err(Error::from_read)?;
        self.end += n;
        Ok(())
    }

    /// One `read` into the free tail. Returns the number of bytes appended, 0 at EOF.
    pub async fn read_once_from<R>(&mut self, reader: &mut R) -> Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let n = reader.read(self.free_tail()).await?;
        self.end += n;
        Ok(n)
    }

    /// Write the whole payload to `writer`, consuming the buffer.
    pub async fn write_to<W>(self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_all(self.bytes()).await?;
        Ok(())
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        if let Storage::Pooled { data, pool } = &mut self.storage {
            pool.put(std::mem::take(data));
        }
    }
}

impl AsRef<[u8]> for Buffer<'_> {
    fn as_ref(&self) -> &[u8] {
        self.bytes()
    }
}

impl std::fmt::Debug for Buffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("capacity", &self.capacity())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
