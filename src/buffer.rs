//! Bounded byte buffer
//!
//! [`ByteBuffer`] is a growable byte store with a hard capacity ceiling and a
//! read cursor. Writes append at the end and fail instead of growing past the
//! ceiling; reads advance the cursor and fail instead of running past the
//! written end. It backs frame encoding and copies out of the shared region.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::BufferError;

/// Default ceiling: one maximum-size frame plus its header
pub const DEFAULT_MAX_CAPACITY: usize = crate::protocol::MAX_PAYLOAD_LEN + crate::protocol::HEADER_SIZE;

/// Growable, bounds-checked byte buffer with a capacity ceiling
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    data: BytesMut,
    read_pos: usize,
    max_capacity: usize,
}

impl ByteBuffer {
    /// Create an empty buffer that may grow up to `max_capacity` bytes
    pub fn new(max_capacity: usize) -> Self {
        Self::with_capacity(0, max_capacity)
    }

    /// Create a buffer with `initial` bytes preallocated
    pub fn with_capacity(initial: usize, max_capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(initial.min(max_capacity)),
            read_pos: 0,
            max_capacity,
        }
    }

    /// Reset both cursors to zero, keeping the allocation
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }

    /// Number of written bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes written but not yet read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// Current read cursor
    pub fn position(&self) -> usize {
        self.read_pos
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// All written bytes, independent of the read cursor
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn ensure_room(&mut self, additional: usize) -> Result<(), BufferError> {
        let requested = self.data.len().saturating_add(additional);
        if requested > self.max_capacity {
            return Err(BufferError::CapacityExceeded {
                requested,
                max: self.max_capacity,
            });
        }
        self.data.reserve(additional);
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> Result<(), BufferError> {
        self.ensure_room(1)?;
        self.data.put_u8(v);
        Ok(())
    }

    pub fn put_u16(&mut self, v: u16) -> Result<(), BufferError> {
        self.ensure_room(2)?;
        self.data.put_u16_le(v);
        Ok(())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<(), BufferError> {
        self.ensure_room(4)?;
        self.data.put_u32_le(v);
        Ok(())
    }

    pub fn put_u64(&mut self, v: u64) -> Result<(), BufferError> {
        self.ensure_room(8)?;
        self.data.put_u64_le(v);
        Ok(())
    }

    pub fn put_slice(&mut self, src: &[u8]) -> Result<(), BufferError> {
        self.ensure_room(src.len())?;
        self.data.put_slice(src);
        Ok(())
    }

    /// Append `len` zero bytes and return them for in-place filling
    pub fn put_zeroed(&mut self, len: usize) -> Result<&mut [u8], BufferError> {
        self.ensure_room(len)?;
        let start = self.data.len();
        self.data.resize(start + len, 0);
        Ok(&mut self.data[start..])
    }

    fn take(&mut self, len: usize) -> Result<&[u8], BufferError> {
        if len > self.remaining() {
            return Err(BufferError::OutOfBounds {
                position: self.read_pos,
                len,
                available: self.remaining(),
            });
        }
        let start = self.read_pos;
        self.read_pos += len;
        Ok(&self.data[start..start + len])
    }

    pub fn get_u8(&mut self) -> Result<u8, BufferError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, BufferError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, BufferError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, BufferError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    /// Borrow the next `len` bytes and advance the cursor
    pub fn get_slice(&mut self, len: usize) -> Result<&[u8], BufferError> {
        self.take(len)
    }

    /// Fill `dst` from the cursor
    pub fn copy_to_slice(&mut self, dst: &mut [u8]) -> Result<(), BufferError> {
        let src = self.take(dst.len())?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Move the read cursor to an absolute position within the written bytes
    pub fn seek(&mut self, position: usize) -> Result<(), BufferError> {
        if position > self.data.len() {
            return Err(BufferError::OutOfBounds {
                position,
                len: 0,
                available: self.data.len(),
            });
        }
        self.read_pos = position;
        Ok(())
    }

    /// Hand out the written bytes as a shared `Bytes`, leaving this buffer empty
    pub fn split(&mut self) -> Bytes {
        self.read_pos = 0;
        self.data.split().freeze()
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CAPACITY)
    }
}
