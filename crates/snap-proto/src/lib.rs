#![forbid(unsafe_code)]
//! UBD wire protocol and the kernel snapshot structures snapserv
//! synthesizes.
//!
//! Everything here is an explicit little-endian codec over byte slices;
//! nothing relies on in-memory struct layout. Three formats meet in this
//! crate:
//!
//! - [`UbdHeader`]: the request/response header exchanged with the UBD
//!   misc device.
//! - [`DiskException`] and [`DiskHeader`]: the kernel snapshot metadata
//!   the daemon fabricates in memory and serves back on demand.
//! - [`BufferSink`]: the one scratch buffer a device uses to frame every
//!   response (header region + payload arena).

use serde::{Deserialize, Serialize};
use snap_types::{
    read_le_u32, read_le_u64, write_le_u32, write_le_u64, ParseError, SectorId, CHUNK_SIZE,
    EXCEPTION_SIZE, PAYLOAD_SIZE,
};

// ── UBD wire protocol ───────────────────────────────────────────────────────

/// Size of the UBD request/response header on the wire.
pub const UBD_HEADER_SIZE: usize = 32;

/// Request: map a read.
pub const UBD_REQ_MAP_READ: u32 = 0;
/// Request: map a write.
pub const UBD_REQ_MAP_WRITE: u32 = 1;
/// Response: request serviced.
pub const UBD_RESP_SUCCESS: u32 = 0;
/// Response: request failed; no usable payload.
pub const UBD_RESP_ERROR: u32 = 1;

/// UBD request/response header.
///
/// `seq` and `flags` are opaque to the daemon and echoed unchanged. The
/// response overwrites `kind` with a `UBD_RESP_*` code in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UbdHeader {
    pub seq: u64,
    pub kind: u32,
    pub flags: u32,
    pub sector: u64,
    pub len: u64,
}

impl UbdHeader {
    /// Decode a header from the first `UBD_HEADER_SIZE` bytes of `data`.
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            seq: read_le_u64(data, 0)?,
            kind: read_le_u32(data, 8)?,
            flags: read_le_u32(data, 12)?,
            sector: read_le_u64(data, 16)?,
            len: read_le_u64(data, 24)?,
        })
    }

    /// Encode into the first `UBD_HEADER_SIZE` bytes of `data`.
    pub fn encode_into(&self, data: &mut [u8]) -> Result<(), ParseError> {
        write_le_u64(data, 0, self.seq)?;
        write_le_u32(data, 8, self.kind)?;
        write_le_u32(data, 12, self.flags)?;
        write_le_u64(data, 16, self.sector)?;
        write_le_u64(data, 24, self.len)?;
        Ok(())
    }

    /// Sector this request addresses.
    #[must_use]
    pub fn sector_id(&self) -> SectorId {
        SectorId(self.sector)
    }
}

// ── Kernel snapshot format ──────────────────────────────────────────────────

/// Magic of the kernel snapshot on-disk header ("SnAp").
pub const SNAP_MAGIC: u32 = 0x7041_6e53;
/// Snapshot-valid flag value.
pub const SNAPSHOT_VALID: u32 = 1;
/// Snapshot on-disk format version.
pub const SNAPSHOT_DISK_VERSION: u32 = 1;

/// The sector-0 header page the kernel reads once at device creation.
///
/// Serialized into the first 16 bytes of a BLOCK_SIZE page; the remainder
/// of the page stays zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskHeader {
    pub magic: u32,
    pub valid: u32,
    pub version: u32,
    /// Chunk size in 512-byte sectors.
    pub chunk_size: u32,
}

impl DiskHeader {
    /// The header snapserv synthesizes for every device.
    #[must_use]
    pub fn synthesized() -> Self {
        Self {
            magic: SNAP_MAGIC,
            valid: SNAPSHOT_VALID,
            version: SNAPSHOT_DISK_VERSION,
            chunk_size: CHUNK_SIZE as u32,
        }
    }

    pub fn encode_into(&self, page: &mut [u8]) -> Result<(), ParseError> {
        write_le_u32(page, 0, self.magic)?;
        write_le_u32(page, 4, self.valid)?;
        write_le_u32(page, 8, self.version)?;
        write_le_u32(page, 12, self.chunk_size)?;
        Ok(())
    }

    pub fn decode(page: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            magic: read_le_u32(page, 0)?,
            valid: read_le_u32(page, 4)?,
            version: read_le_u32(page, 8)?,
            chunk_size: read_le_u32(page, 12)?,
        })
    }
}

/// One kernel disk-exception record: reads of `old_chunk` are redirected
/// to `new_chunk`. The all-zero record terminates a partially filled area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskException {
    pub old_chunk: u64,
    pub new_chunk: u64,
}

impl DiskException {
    /// Decode the `slot`-th record of an area page.
    pub fn decode_at(area: &[u8], slot: usize) -> Result<Self, ParseError> {
        let offset = slot * EXCEPTION_SIZE;
        Ok(Self {
            old_chunk: read_le_u64(area, offset)?,
            new_chunk: read_le_u64(area, offset + 8)?,
        })
    }

    /// Encode into the `slot`-th record of an area page.
    pub fn encode_at(&self, area: &mut [u8], slot: usize) -> Result<(), ParseError> {
        let offset = slot * EXCEPTION_SIZE;
        write_le_u64(area, offset, self.old_chunk)?;
        write_le_u64(area, offset + 8, self.new_chunk)?;
        Ok(())
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.old_chunk == 0 && self.new_chunk == 0
    }
}

// ── BufferSink ──────────────────────────────────────────────────────────────

/// Scratch buffer framing one request/response to the UBD device.
///
/// Layout: `UBD_HEADER_SIZE` header bytes followed by a `PAYLOAD_SIZE`
/// payload arena. Between resets, successive `payload_buffer(n)` calls
/// hand out non-overlapping windows laid out contiguously from payload
/// offset 0; `advance` moves the cursor after a window is filled.
#[derive(Debug)]
pub struct BufferSink {
    buf: Vec<u8>,
    offset: usize,
}

impl Default for BufferSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferSink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: vec![0_u8; UBD_HEADER_SIZE + PAYLOAD_SIZE],
            offset: 0,
        }
    }

    /// The header region of the frame.
    #[must_use]
    pub fn header_bytes(&self) -> &[u8] {
        &self.buf[..UBD_HEADER_SIZE]
    }

    pub fn header_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..UBD_HEADER_SIZE]
    }

    /// Decode the header currently in the frame.
    pub fn read_header(&self) -> Result<UbdHeader, ParseError> {
        UbdHeader::decode(self.header_bytes())
    }

    /// Encode `header` into the frame.
    pub fn write_header(&mut self, header: &UbdHeader) -> Result<(), ParseError> {
        header.encode_into(&mut self.buf[..UBD_HEADER_SIZE])
    }

    /// A `len`-byte payload window starting at the current offset, or
    /// `None` when the arena cannot hold it.
    pub fn payload_buffer(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > PAYLOAD_SIZE - self.offset {
            return None;
        }
        let start = UBD_HEADER_SIZE + self.offset;
        Some(&mut self.buf[start..start + len])
    }

    /// Move the payload cursor past `len` filled bytes.
    pub fn advance(&mut self, len: usize) {
        debug_assert!(self.offset + len <= PAYLOAD_SIZE);
        self.offset += len;
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Rewind the payload cursor to 0 without touching contents.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// Zero the whole frame and rewind.
    pub fn clear(&mut self) {
        self.buf.fill(0);
        self.offset = 0;
    }

    /// The wire frame for a response carrying `payload_len` payload bytes.
    #[must_use]
    pub fn frame(&self, payload_len: usize) -> &[u8] {
        &self.buf[..UBD_HEADER_SIZE + payload_len]
    }

    /// Read-only view of the first `len` payload bytes.
    #[must_use]
    pub fn payload(&self, len: usize) -> &[u8] {
        &self.buf[UBD_HEADER_SIZE..UBD_HEADER_SIZE + len]
    }
}
