#![forbid(unsafe_code)]
//! The internal copy-on-write log.
//!
//! An append-structured record of block-level operations describing the
//! transformation from a base device to the snapshotted state. The layout
//! is one header page, a packed table of fixed-size operation records, and
//! raw payload extents for replace operations:
//!
//! ```text
//! offset 0:          CowHeader (40 bytes, little-endian)
//! ops_offset:        num_ops × CowOperation (24 bytes each)
//! after the table:   replace payload extents, addressed by op.source
//! ```
//!
//! [`CowLog`] parses and validates a log, hands out forward/reverse
//! [`CowOpIter`] cursors, reads replace payloads, and persists merge
//! progress (`num_merge_ops`) with a header rewrite plus sync, which is
//! the one durability point of the daemon. [`CowImageBuilder`] produces
//! complete images for the enclosing system's tooling and for tests.

use snap_block::ByteDevice;
use snap_error::{Result, SnapError};
use snap_types::{
    read_le_u16, read_le_u32, read_le_u64, u64_to_usize, write_le_u16, write_le_u32, write_le_u64,
    ByteOffset, ParseError, BLOCK_SIZE,
};
use tracing::debug;

/// COW log magic ("SCOW").
pub const COW_MAGIC: u32 = 0x574F_4353;
/// Supported major format version.
pub const COW_MAJOR_VERSION: u16 = 1;
/// Current minor format version.
pub const COW_MINOR_VERSION: u16 = 0;
/// Serialized header size in bytes.
pub const COW_HEADER_SIZE: usize = 40;
/// Serialized operation record size in bytes.
pub const COW_OP_SIZE: usize = 24;

/// Copy a block from another base-device location.
pub const COW_OP_COPY: u16 = 1;
/// Replace a block with a payload stored in the log.
pub const COW_OP_REPLACE: u16 = 2;
/// Zero a block.
pub const COW_OP_ZERO: u16 = 3;
/// End-of-log marker.
pub const COW_OP_FOOTER: u16 = 4;
/// Sequencing label marker.
pub const COW_OP_LABEL: u16 = 5;

/// Replace payloads stored verbatim.
pub const COW_COMPRESS_NONE: u16 = 0;

/// Parsed COW log header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CowHeader {
    pub magic: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub header_size: u32,
    pub block_size: u32,
    pub num_ops: u64,
    pub num_merge_ops: u64,
    pub ops_offset: u64,
}

impl CowHeader {
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(data, 0)?;
        if magic != COW_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(COW_MAGIC),
                actual: u64::from(magic),
            });
        }
        Ok(Self {
            magic,
            major_version: read_le_u16(data, 4)?,
            minor_version: read_le_u16(data, 6)?,
            header_size: read_le_u32(data, 8)?,
            block_size: read_le_u32(data, 12)?,
            num_ops: read_le_u64(data, 16)?,
            num_merge_ops: read_le_u64(data, 24)?,
            ops_offset: read_le_u64(data, 32)?,
        })
    }

    pub fn encode_into(&self, data: &mut [u8]) -> Result<(), ParseError> {
        write_le_u32(data, 0, self.magic)?;
        write_le_u16(data, 4, self.major_version)?;
        write_le_u16(data, 6, self.minor_version)?;
        write_le_u32(data, 8, self.header_size)?;
        write_le_u32(data, 12, self.block_size)?;
        write_le_u64(data, 16, self.num_ops)?;
        write_le_u64(data, 24, self.num_merge_ops)?;
        write_le_u64(data, 32, self.ops_offset)?;
        Ok(())
    }
}

/// One COW operation record.
///
/// `kind` stays raw on purpose: consumers match against the `COW_OP_*`
/// constants and decide for themselves what an unknown kind means at
/// their stage (fatal during the metadata build, a request error during
/// dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CowOperation {
    pub kind: u16,
    pub compression: u16,
    /// Replace only: stored payload length.
    pub data_length: u32,
    /// Destination block in the base device.
    pub new_block: u64,
    /// Copy: source base block. Replace: payload byte offset in the log.
    /// Label: the label value.
    pub source: u64,
}

impl CowOperation {
    /// Footer and label records sequence the log but carry no block data.
    #[must_use]
    pub fn is_marker(&self) -> bool {
        matches!(self.kind, COW_OP_FOOTER | COW_OP_LABEL)
    }

    /// Whether the kernel merge consumes this record.
    #[must_use]
    pub fn is_mergeable(&self) -> bool {
        matches!(self.kind, COW_OP_COPY | COW_OP_REPLACE | COW_OP_ZERO)
    }

    fn decode_at(table: &[u8], index: usize) -> Result<Self, ParseError> {
        let offset = index * COW_OP_SIZE;
        Ok(Self {
            kind: read_le_u16(table, offset)?,
            compression: read_le_u16(table, offset + 2)?,
            data_length: read_le_u32(table, offset + 4)?,
            new_block: read_le_u64(table, offset + 8)?,
            source: read_le_u64(table, offset + 16)?,
        })
    }

    fn encode_at(&self, table: &mut [u8], index: usize) -> Result<(), ParseError> {
        let offset = index * COW_OP_SIZE;
        write_le_u16(table, offset, self.kind)?;
        write_le_u16(table, offset + 2, self.compression)?;
        write_le_u32(table, offset + 4, self.data_length)?;
        write_le_u64(table, offset + 8, self.new_block)?;
        write_le_u64(table, offset + 16, self.source)?;
        Ok(())
    }
}

/// Cursor over the op table with explicit `get`/`next`/`done` stepping.
#[derive(Debug, Clone)]
pub struct CowOpIter<'a> {
    ops: &'a [CowOperation],
    consumed: usize,
    reverse: bool,
}

impl<'a> CowOpIter<'a> {
    #[must_use]
    pub fn done(&self) -> bool {
        self.consumed >= self.ops.len()
    }

    /// The current op, `None` once the cursor is exhausted.
    #[must_use]
    pub fn get(&self) -> Option<&'a CowOperation> {
        if self.done() {
            return None;
        }
        let index = if self.reverse {
            self.ops.len() - 1 - self.consumed
        } else {
            self.consumed
        };
        Some(&self.ops[index])
    }

    pub fn next(&mut self) {
        if !self.done() {
            self.consumed += 1;
        }
    }

    /// Forward table index of the current op. Meaningless for reverse
    /// cursors; used to persist a forward cursor across calls.
    #[must_use]
    pub fn position(&self) -> usize {
        self.consumed
    }
}

/// A parsed, validated COW log bound to its device.
#[derive(Debug)]
pub struct CowLog<D: ByteDevice> {
    dev: D,
    header: CowHeader,
    ops: Vec<CowOperation>,
    mergeable_ops: u64,
    merge_progress: u64,
}

impl<D: ByteDevice> CowLog<D> {
    /// Parse and validate the log on `dev`.
    pub fn parse(dev: D) -> Result<Self> {
        let mut header_bytes = [0_u8; COW_HEADER_SIZE];
        dev.read_exact_at(ByteOffset::ZERO, &mut header_bytes)?;
        let header = CowHeader::decode(&header_bytes)?;

        if header.major_version != COW_MAJOR_VERSION {
            return Err(SnapError::Format(format!(
                "unsupported COW version {}.{}",
                header.major_version, header.minor_version
            )));
        }
        if header.header_size != COW_HEADER_SIZE as u32 {
            return Err(SnapError::Format(format!(
                "unexpected COW header size {}",
                header.header_size
            )));
        }
        if header.block_size as usize != BLOCK_SIZE {
            return Err(SnapError::Format(format!(
                "COW block size {} does not match device block size {BLOCK_SIZE}",
                header.block_size
            )));
        }

        let num_ops = u64_to_usize(header.num_ops, "num_ops")?;
        let table_len = num_ops
            .checked_mul(COW_OP_SIZE)
            .ok_or(ParseError::IntegerConversion { field: "op_table" })?;
        let table_end = header
            .ops_offset
            .checked_add(table_len as u64)
            .ok_or(ParseError::IntegerConversion { field: "op_table" })?;
        if dev.len_bytes() > 0 && table_end > dev.len_bytes() {
            return Err(SnapError::Format(format!(
                "op table [{}, {table_end}) exceeds device length {}",
                header.ops_offset,
                dev.len_bytes()
            )));
        }

        let mut table = vec![0_u8; table_len];
        dev.read_exact_at(ByteOffset(header.ops_offset), &mut table)?;

        let mut ops = Vec::with_capacity(num_ops);
        let mut mergeable_ops = 0_u64;
        for index in 0..num_ops {
            let op = CowOperation::decode_at(&table, index)?;
            if op.kind == COW_OP_REPLACE {
                if op.compression != COW_COMPRESS_NONE {
                    return Err(SnapError::Format(format!(
                        "unsupported compression {} on replace op {index}",
                        op.compression
                    )));
                }
                if op.data_length as usize != BLOCK_SIZE {
                    return Err(SnapError::Format(format!(
                        "replace op {index} payload length {} is not one block",
                        op.data_length
                    )));
                }
            }
            if op.is_mergeable() {
                mergeable_ops += 1;
            }
            ops.push(op);
        }

        if header.num_merge_ops > mergeable_ops {
            return Err(SnapError::Format(format!(
                "merge progress {} exceeds {mergeable_ops} mergeable ops",
                header.num_merge_ops
            )));
        }

        debug!(
            target: "snap::cow",
            event = "parsed",
            num_ops = header.num_ops,
            mergeable_ops,
            num_merge_ops = header.num_merge_ops
        );

        Ok(Self {
            dev,
            header,
            ops,
            mergeable_ops,
            merge_progress: 0,
        })
    }

    #[must_use]
    pub fn header(&self) -> &CowHeader {
        &self.header
    }

    /// The underlying device.
    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    #[must_use]
    pub fn ops(&self) -> &[CowOperation] {
        &self.ops
    }

    /// Count of replace/copy/zero records in the log.
    #[must_use]
    pub fn mergeable_ops(&self) -> u64 {
        self.mergeable_ops
    }

    /// Mergeable ops reconciled since this log was opened.
    #[must_use]
    pub fn merge_progress(&self) -> u64 {
        self.merge_progress
    }

    /// Forward cursor from the first op.
    #[must_use]
    pub fn iter(&self) -> CowOpIter<'_> {
        self.iter_from(0)
    }

    /// Forward cursor from table index `position`.
    #[must_use]
    pub fn iter_from(&self, position: usize) -> CowOpIter<'_> {
        CowOpIter {
            ops: &self.ops,
            consumed: position.min(self.ops.len()),
            reverse: false,
        }
    }

    /// Reverse cursor from the last op.
    #[must_use]
    pub fn rev_iter(&self) -> CowOpIter<'_> {
        CowOpIter {
            ops: &self.ops,
            consumed: 0,
            reverse: true,
        }
    }

    /// Position of the forward merge cursor implied by the persisted
    /// merge progress: just past `num_merge_ops` mergeable records.
    pub fn initialize_merge(&self) -> Result<usize> {
        let mut remaining = self.header.num_merge_ops;
        let mut position = 0_usize;
        while remaining > 0 {
            let Some(op) = self.ops.get(position) else {
                return Err(SnapError::Invariant(
                    "merge progress runs past the op table".to_owned(),
                ));
            };
            if op.is_marker() {
                position += 1;
                continue;
            }
            if !op.is_mergeable() {
                return Err(SnapError::UnknownOp(op.kind));
            }
            remaining -= 1;
            position += 1;
        }
        Ok(position)
    }

    /// Read the stored payload of a replace op into `out` (one block).
    pub fn read_data(&self, op: &CowOperation, out: &mut [u8]) -> Result<()> {
        if op.kind != COW_OP_REPLACE {
            return Err(SnapError::Invariant(format!(
                "payload read on non-replace op kind {}",
                op.kind
            )));
        }
        if out.len() != BLOCK_SIZE {
            return Err(SnapError::Invariant(format!(
                "payload read of {} bytes, expected one block",
                out.len()
            )));
        }
        self.dev.read_exact_at(ByteOffset(op.source), out)?;
        Ok(())
    }

    /// In-memory merge accounting; durability comes from `commit_merge`.
    pub fn update_merge_progress(&mut self, count: u64) {
        self.merge_progress = self.merge_progress.saturating_add(count);
    }

    /// Durably advance `num_merge_ops` by `count`: rewrite the header and
    /// sync the device.
    pub fn commit_merge(&mut self, count: u64) -> Result<()> {
        let total = self
            .header
            .num_merge_ops
            .checked_add(count)
            .ok_or_else(|| SnapError::Invariant("merge counter overflow".to_owned()))?;
        if total > self.mergeable_ops {
            return Err(SnapError::Invariant(format!(
                "merge commit of {count} would pass {} of {} mergeable ops",
                total, self.mergeable_ops
            )));
        }
        self.header.num_merge_ops = total;

        let mut header_bytes = [0_u8; COW_HEADER_SIZE];
        self.header.encode_into(&mut header_bytes)?;
        self.dev.write_all_at(ByteOffset::ZERO, &header_bytes)?;
        self.dev.sync()?;

        debug!(
            target: "snap::cow",
            event = "merge_committed",
            count,
            num_merge_ops = total
        );
        Ok(())
    }
}

// ── Image builder ───────────────────────────────────────────────────────────

enum BuilderOp {
    Copy { new_block: u64, source: u64 },
    Replace { new_block: u64, payload: Vec<u8> },
    Zero { new_block: u64 },
    Label { value: u64 },
    Footer,
}

/// Builds a complete COW log image in memory.
#[derive(Default)]
pub struct CowImageBuilder {
    ops: Vec<BuilderOp>,
    num_merge_ops: u64,
}

impl CowImageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copy(&mut self, new_block: u64, source: u64) -> &mut Self {
        self.ops.push(BuilderOp::Copy { new_block, source });
        self
    }

    pub fn replace(&mut self, new_block: u64, payload: &[u8; BLOCK_SIZE]) -> &mut Self {
        self.ops.push(BuilderOp::Replace {
            new_block,
            payload: payload.to_vec(),
        });
        self
    }

    pub fn zero(&mut self, new_block: u64) -> &mut Self {
        self.ops.push(BuilderOp::Zero { new_block });
        self
    }

    pub fn label(&mut self, value: u64) -> &mut Self {
        self.ops.push(BuilderOp::Label { value });
        self
    }

    pub fn footer(&mut self) -> &mut Self {
        self.ops.push(BuilderOp::Footer);
        self
    }

    /// Pre-set merge progress, for images that resume a partial merge.
    pub fn with_merge_ops(&mut self, count: u64) -> &mut Self {
        self.num_merge_ops = count;
        self
    }

    /// Serialize the image.
    pub fn build(&self) -> Result<Vec<u8>> {
        let num_ops = self.ops.len();
        let table_len = num_ops
            .checked_mul(COW_OP_SIZE)
            .ok_or_else(|| SnapError::Format("op table length overflow".to_owned()))?;
        let data_offset = COW_HEADER_SIZE + table_len;

        let mut table = vec![0_u8; table_len];
        let mut data = Vec::new();
        for (index, op) in self.ops.iter().enumerate() {
            let record = match op {
                BuilderOp::Copy { new_block, source } => CowOperation {
                    kind: COW_OP_COPY,
                    compression: COW_COMPRESS_NONE,
                    data_length: 0,
                    new_block: *new_block,
                    source: *source,
                },
                BuilderOp::Replace { new_block, payload } => {
                    let source = (data_offset + data.len()) as u64;
                    data.extend_from_slice(payload);
                    CowOperation {
                        kind: COW_OP_REPLACE,
                        compression: COW_COMPRESS_NONE,
                        data_length: payload.len() as u32,
                        new_block: *new_block,
                        source,
                    }
                }
                BuilderOp::Zero { new_block } => CowOperation {
                    kind: COW_OP_ZERO,
                    compression: COW_COMPRESS_NONE,
                    data_length: 0,
                    new_block: *new_block,
                    source: 0,
                },
                BuilderOp::Label { value } => CowOperation {
                    kind: COW_OP_LABEL,
                    compression: COW_COMPRESS_NONE,
                    data_length: 0,
                    new_block: 0,
                    source: *value,
                },
                BuilderOp::Footer => CowOperation {
                    kind: COW_OP_FOOTER,
                    compression: COW_COMPRESS_NONE,
                    data_length: 0,
                    new_block: 0,
                    source: 0,
                },
            };
            record.encode_at(&mut table, index)?;
        }

        let header = CowHeader {
            magic: COW_MAGIC,
            major_version: COW_MAJOR_VERSION,
            minor_version: COW_MINOR_VERSION,
            header_size: COW_HEADER_SIZE as u32,
            block_size: BLOCK_SIZE as u32,
            num_ops: num_ops as u64,
            num_merge_ops: self.num_merge_ops,
            ops_offset: COW_HEADER_SIZE as u64,
        };
        let mut image = vec![0_u8; COW_HEADER_SIZE];
        header.encode_into(&mut image)?;
        image.extend_from_slice(&table);
        image.extend_from_slice(&data);
        Ok(image)
    }
}
