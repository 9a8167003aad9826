//! Little-endian byte writer/reader used by the template and leaf codecs
//!
//! Every short read is reported as `StorageError::Corruption`: the reader is
//! only ever handed bytes that were already fully read from storage, so a
//! truncated buffer means a bad chunk, not a transient failure.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::IndexKey;

/// Size of a block length prefix in bytes
pub const LENGTH_PREFIX: usize = 4;

/// Size of the crc32 trailer in bytes
pub const CHECKSUM_SIZE: usize = 4;

#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_key(&mut self, key: IndexKey) {
        self.buf.extend_from_slice(&key.0.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append a crc32 of everything written so far and return the buffer
    pub fn finish_with_checksum(mut self) -> Vec<u8> {
        let checksum = crc32fast::hash(&self.buf);
        self.put_u32(checksum);
        self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> ByteReader<'a> {
    /// `what` names the structure being decoded, for error messages
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    /// Verify and strip a crc32 trailer, returning a reader over the body
    pub fn checked(buf: &'a [u8], what: &'static str) -> StorageResult<Self> {
        if buf.len() < CHECKSUM_SIZE {
            return Err(StorageError::Corruption(format!(
                "{} too short for checksum: {} bytes",
                what,
                buf.len()
            )));
        }

        let (body, trailer) = buf.split_at(buf.len() - CHECKSUM_SIZE);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = crc32fast::hash(body);

        if stored != computed {
            return Err(StorageError::Corruption(format!(
                "{} checksum mismatch: stored={}, computed={}",
                what, stored, computed
            )));
        }

        Ok(Self::new(body, what))
    }

    fn take(&mut self, n: usize) -> StorageResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(StorageError::Corruption(format!(
                "{} truncated: wanted {} bytes at offset {}, {} left",
                self.what,
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> StorageResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> StorageResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> StorageResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_key(&mut self) -> StorageResult<IndexKey> {
        let b = self.take(8)?;
        Ok(IndexKey(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ])))
    }

    pub fn get_bytes(&mut self, n: usize) -> StorageResult<&'a [u8]> {
        self.take(n)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fail unless every byte was consumed
    pub fn expect_end(&self) -> StorageResult<()> {
        if self.remaining() != 0 {
            return Err(StorageError::Corruption(format!(
                "{} has {} trailing bytes",
                self.what,
                self.remaining()
            )));
        }
        Ok(())
    }

    /// Read a count that must be backed by at least `min_item_size` bytes per item
    pub fn get_count(&mut self, min_item_size: usize) -> StorageResult<usize> {
        let count = self.get_u32()? as usize;
        if count.saturating_mul(min_item_size) > self.remaining() {
            return Err(StorageError::Corruption(format!(
                "{} claims {} items but only {} bytes remain",
                self.what,
                count,
                self.remaining()
            )));
        }
        Ok(count)
    }
}

/// Read a little-endian u32 length prefix from the start of a slice
pub fn read_length_prefix(bytes: &[u8], what: &'static str) -> StorageResult<usize> {
    ByteReader::new(bytes, what).get_u32().map(|v| v as usize)
}

/// Largest size or offset a chunk can address
pub const MAX_ADDRESSABLE: usize = u32::MAX as usize;

/// Narrow a chunk size or offset to its on-disk u32 width
pub fn to_u32(value: usize) -> StorageResult<u32> {
    u32::try_from(value).map_err(|_| StorageError::CapacityExceeded {
        needed: value,
        available: MAX_ADDRESSABLE,
    })
}

/// Offset of the block that follows a `length`-byte block at `offset`
pub fn next_block_offset(offset: u32, length: u32) -> StorageResult<u32> {
    let next = offset as usize + LENGTH_PREFIX + length as usize;
    to_u32(next)
}
