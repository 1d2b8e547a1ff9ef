#![forbid(unsafe_code)]
//! Shared geometry constants and unit-carrying newtypes for snapserv.
//!
//! Everything that crosses the kernel boundary is addressed in one of three
//! units: 512-byte sectors (the UBD wire), 4096-byte chunks (snapshot
//! metadata), and 4096-byte blocks (the base device and the COW log). The
//! newtypes here exist so those units cannot be mixed silently.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// I/O granularity of the snapshot target and the COW log.
pub const BLOCK_SIZE: usize = 4096;
/// log2(BLOCK_SIZE).
pub const BLOCK_SHIFT: u32 = 12;
/// UBD sector size in bytes.
pub const SECTOR_SIZE: usize = 512;
/// log2(SECTOR_SIZE).
pub const SECTOR_SHIFT: u32 = 9;
/// Sectors per chunk (BLOCK_SIZE / SECTOR_SIZE).
pub const CHUNK_SIZE: u64 = 8;
/// log2(CHUNK_SIZE).
pub const CHUNK_SHIFT: u32 = 3;
/// Size of one kernel disk-exception record.
pub const EXCEPTION_SIZE: usize = 16;
/// Exceptions held by one metadata area (BLOCK_SIZE / EXCEPTION_SIZE).
pub const EXCEPTIONS_PER_AREA: usize = 256;
/// Chunks reserved at the front of the device for the synthesized header.
pub const NUM_SNAPSHOT_HDR_CHUNKS: u64 = 1;
/// One metadata chunk followed by its 256 data chunks.
pub const STRIDE: u64 = EXCEPTIONS_PER_AREA as u64 + 1;
/// Maximum payload carried by one UBD response frame.
pub const PAYLOAD_SIZE: usize = 1 << 16;

/// A 4096-byte unit on the synthesized snapshot device.
///
/// Chunk 0 is the synthesized on-disk header. A chunk `c` with
/// `c % STRIDE == NUM_SNAPSHOT_HDR_CHUNKS` is a metadata chunk (an area of
/// disk exceptions); every other non-zero chunk is a data chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub u64);

impl ChunkId {
    /// Whether this chunk id addresses a metadata area page.
    #[must_use]
    pub fn is_metadata(self) -> bool {
        self.0 % STRIDE == NUM_SNAPSHOT_HDR_CHUNKS
    }

    /// Index of the area this chunk belongs to.
    #[must_use]
    pub fn area_index(self) -> u64 {
        self.0 / STRIDE
    }

    /// First sector covered by this chunk.
    #[must_use]
    pub fn to_sector(self) -> SectorId {
        SectorId(self.0 << CHUNK_SHIFT)
    }

    /// The next chunk id that may hold data: one past `self`, skipping a
    /// metadata slot if the increment lands on one.
    #[must_use]
    pub fn next_allocatable(self) -> ChunkId {
        let next = ChunkId(self.0 + 1);
        if next.is_metadata() {
            ChunkId(next.0 + 1)
        } else {
            next
        }
    }

    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

/// A 512-byte sector offset as carried in UBD headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorId(pub u64);

impl SectorId {
    /// Chunk containing this sector (truncating).
    #[must_use]
    pub fn to_chunk(self) -> ChunkId {
        ChunkId(self.0 >> CHUNK_SHIFT)
    }
}

/// A BLOCK_SIZE-sized block index in the base device or the COW log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// Byte offset of this block, `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<ByteOffset> {
        self.0.checked_mul(BLOCK_SIZE as u64).map(ByteOffset)
    }
}

/// Byte offset on a `ByteDevice` (pread/pwrite semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}
