//! Per-block data reads.
//!
//! The kernel coalesces reads over contiguous data chunks, so one request
//! can span up to a full area's worth of blocks. Each 4096-byte slice
//! still resolves independently: a replace pulls its payload out of the
//! COW log, a zero writes zeroes, a copy reads the base device. A copy is
//! always the only operation of its request, and no request crosses from
//! data chunks into a metadata chunk.

use crate::metadata::ExceptionTable;
use snap_block::ByteDevice;
use snap_cow::{CowLog, COW_OP_COPY, COW_OP_REPLACE, COW_OP_ZERO};
use snap_error::{Result, SnapError};
use snap_proto::BufferSink;
use snap_types::{BlockNumber, ChunkId, BLOCK_SIZE};

/// Fill the sink's payload arena with `size` bytes of data starting at
/// `chunk`. The sink's cursor is rewound on return, success or not.
pub fn read_data<C: ByteDevice, B: ByteDevice>(
    log: &CowLog<C>,
    base: &B,
    table: &ExceptionTable,
    chunk: ChunkId,
    size: usize,
    sink: &mut BufferSink,
) -> Result<()> {
    let result = read_blocks(log, base, table, chunk, size, sink);
    sink.reset();
    result
}

fn read_blocks<C: ByteDevice, B: ByteDevice>(
    log: &CowLog<C>,
    base: &B,
    table: &ExceptionTable,
    chunk: ChunkId,
    size: usize,
    sink: &mut BufferSink,
) -> Result<()> {
    if size % BLOCK_SIZE != 0 {
        return Err(SnapError::Invariant(format!(
            "data read of {size} bytes is not block aligned"
        )));
    }

    let mut remaining = size;
    let mut chunk_key = chunk;
    while remaining > 0 {
        let op_index = table
            .lookup(chunk_key)
            .ok_or(SnapError::UnknownChunk(chunk_key.0))?;
        let op = &log.ops()[op_index];

        let buffer = sink
            .payload_buffer(BLOCK_SIZE)
            .ok_or_else(|| SnapError::Invariant("payload arena exhausted mid-read".to_owned()))?;
        match op.kind {
            COW_OP_REPLACE => log.read_data(op, buffer)?,
            COW_OP_ZERO => buffer.fill(0),
            COW_OP_COPY => {
                let offset = BlockNumber(op.source).to_byte_offset().ok_or_else(|| {
                    SnapError::Invariant(format!("copy source {} overflows", op.source))
                })?;
                base.read_exact_at(offset, buffer)?;
            }
            other => return Err(SnapError::UnknownOp(other)),
        }

        sink.advance(BLOCK_SIZE);
        remaining -= BLOCK_SIZE;
        chunk_key = ChunkId(chunk_key.0 + 1);

        // A copy merges alone; the kernel never folds it into a larger
        // request.
        if op.kind == COW_OP_COPY {
            if remaining != 0 {
                return Err(SnapError::Invariant(format!(
                    "copy op inside a {size}-byte request"
                )));
            }
            break;
        }

        // Crossing into a metadata chunk would mean the request spanned an
        // area boundary, which the kernel never issues.
        if chunk_key.is_metadata() {
            if remaining != 0 {
                return Err(SnapError::Invariant(format!(
                    "read spans the area boundary at chunk {chunk_key}"
                )));
            }
            break;
        }
    }

    Ok(())
}
