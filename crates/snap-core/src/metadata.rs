//! Synthesized kernel snapshot metadata.
//!
//! The kernel learns the snapshot's exception mappings by reading metadata
//! chunks; it never sees the COW log itself. This module performs the one
//! reverse pass over the log that fabricates those mappings: every
//! replace/copy/zero operation receives a synthetic data chunk id, the
//! resulting disk exceptions are packed into 4096-byte areas, and the
//! chunk-to-operation map drives all later data reads.
//!
//! Chunk ids are assigned in reverse log order because the kernel merges
//! each metadata page from its tail backward; walking the log backwards
//! here makes the kernel's merge proceed in forward log order. Copy
//! operations additionally never receive an id contiguous with their
//! neighbor's, which strips the kernel of the freedom to coalesce
//! dependent copies into one I/O across a crash.

use snap_cow::{CowOperation, COW_OP_COPY};
use snap_error::{Result, SnapError};
use snap_proto::{BufferSink, DiskException};
use snap_types::{
    u64_to_usize, ChunkId, CHUNK_SIZE, EXCEPTIONS_PER_AREA, EXCEPTION_SIZE,
    NUM_SNAPSHOT_HDR_CHUNKS,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Bytes of disk exceptions in one area page.
pub const AREA_BYTES: usize = EXCEPTIONS_PER_AREA * EXCEPTION_SIZE;

/// The synthesized exception areas plus the chunk-to-operation map.
///
/// Built once per device; afterwards only merge reconciliation touches it,
/// zeroing exception records in place as the kernel retires them.
#[derive(Debug)]
pub struct ExceptionTable {
    areas: Vec<Vec<u8>>,
    chunk_map: BTreeMap<ChunkId, usize>,
    num_sectors: u64,
}

/// Run the reverse pass over `ops` and construct the exception table.
///
/// Fails on any operation that is neither a marker nor mergeable; a log
/// with no mergeable operations yields a single all-zero area so the
/// kernel's first metadata read terminates immediately.
pub fn build(ops: &[CowOperation]) -> Result<ExceptionTable> {
    let mut areas: Vec<Vec<u8>> = Vec::new();
    let mut chunk_map = BTreeMap::new();
    let mut area = vec![0_u8; AREA_BYTES];
    let mut in_area = 0_usize;
    let mut next_free = ChunkId(NUM_SNAPSHOT_HDR_CHUNKS + 1);
    let mut prev_was_copy = false;
    let mut any_mergeable = false;

    for (index, op) in ops.iter().enumerate().rev() {
        if op.is_marker() {
            continue;
        }
        if !op.is_mergeable() {
            return Err(SnapError::UnknownOp(op.kind));
        }
        any_mergeable = true;

        // A copy never sits at an id contiguous with its predecessor, and
        // nothing sits contiguous after a copy.
        if op.kind == COW_OP_COPY || prev_was_copy {
            next_free = next_free.next_allocatable();
        }
        prev_was_copy = op.kind == COW_OP_COPY;

        DiskException {
            old_chunk: op.new_block,
            new_chunk: next_free.0,
        }
        .encode_at(&mut area, in_area)?;
        chunk_map.insert(next_free, index);
        in_area += 1;

        if in_area == EXCEPTIONS_PER_AREA {
            areas.push(std::mem::replace(&mut area, vec![0_u8; AREA_BYTES]));
            in_area = 0;
        }

        next_free = next_free.next_allocatable();
    }

    // The zero-initialized tail of a partial area is the terminator the
    // kernel stops on.
    if in_area > 0 || !any_mergeable {
        areas.push(area);
    }

    let num_sectors = next_free.0 * CHUNK_SIZE;
    debug!(
        target: "snap::core::metadata",
        event = "built",
        exceptions = chunk_map.len(),
        areas = areas.len(),
        num_sectors
    );

    Ok(ExceptionTable {
        areas,
        chunk_map,
        num_sectors,
    })
}

impl ExceptionTable {
    /// Operation index mapped at `chunk`, if it is a data chunk.
    #[must_use]
    pub fn lookup(&self, chunk: ChunkId) -> Option<usize> {
        self.chunk_map.get(&chunk).copied()
    }

    #[must_use]
    pub fn contains(&self, chunk: ChunkId) -> bool {
        self.chunk_map.contains_key(&chunk)
    }

    #[must_use]
    pub fn areas_len(&self) -> usize {
        self.areas.len()
    }

    #[must_use]
    pub fn area(&self, index: usize) -> &[u8] {
        &self.areas[index]
    }

    pub fn area_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.areas[index]
    }

    /// Sector count of the synthesized device.
    #[must_use]
    pub fn num_sectors(&self) -> u64 {
        self.num_sectors
    }

    /// Data-chunk mappings in ascending chunk order.
    pub fn mappings(&self) -> impl Iterator<Item = (ChunkId, usize)> + '_ {
        self.chunk_map.iter().map(|(chunk, index)| (*chunk, *index))
    }

    /// Serve a metadata-chunk read into the sink's payload arena.
    ///
    /// Requests past the last area answer all zeroes: the kernel prefetches
    /// areas and stops at the first fully zero page.
    pub fn read_metadata(
        &self,
        chunk: ChunkId,
        read_size: usize,
        sink: &mut BufferSink,
    ) -> Result<()> {
        if read_size > AREA_BYTES {
            return Err(SnapError::BadRequest(format!(
                "metadata read of {read_size} bytes exceeds one area"
            )));
        }

        let index = u64_to_usize(chunk.area_index(), "area_index")?;
        let buffer = sink
            .payload_buffer(AREA_BYTES)
            .ok_or_else(|| SnapError::Invariant("payload arena cannot hold an area".to_owned()))?;
        if index < self.areas.len() {
            buffer.copy_from_slice(&self.areas[index]);
        } else {
            buffer.fill(0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snap_cow::{CowImageBuilder, CowLog, COW_OP_REPLACE, COW_OP_ZERO};
    use snap_block::MemoryByteDevice;
    use snap_types::{BLOCK_SIZE, STRIDE};

    fn log_from(builder: &CowImageBuilder) -> CowLog<MemoryByteDevice> {
        let image = builder.build().expect("build image");
        CowLog::parse(MemoryByteDevice::from_vec(image)).expect("parse image")
    }

    #[test]
    fn single_zero_op_lands_at_chunk_two() {
        let log = log_from(CowImageBuilder::new().zero(5));
        let table = build(log.ops()).expect("build");

        assert_eq!(table.areas_len(), 1);
        assert_eq!(
            DiskException::decode_at(table.area(0), 0).expect("slot 0"),
            DiskException {
                old_chunk: 5,
                new_chunk: 2
            }
        );
        assert!(DiskException::decode_at(table.area(0), 1)
            .expect("slot 1")
            .is_zero());
        assert_eq!(table.lookup(ChunkId(2)), Some(0));
        assert_eq!(table.num_sectors(), 3 * CHUNK_SIZE);
    }

    #[test]
    fn copy_adjacency_rule_spreads_assignments() {
        // Forward order: replace, then copy. The reverse pass sees the
        // copy first; it skips chunk 2, and the replace skips chunk 4.
        let log = log_from(
            CowImageBuilder::new()
                .replace(10, &[0xCD; BLOCK_SIZE])
                .copy(20, 30),
        );
        let table = build(log.ops()).expect("build");

        assert_eq!(
            DiskException::decode_at(table.area(0), 0).expect("slot 0"),
            DiskException {
                old_chunk: 20,
                new_chunk: 3
            }
        );
        assert_eq!(
            DiskException::decode_at(table.area(0), 1).expect("slot 1"),
            DiskException {
                old_chunk: 10,
                new_chunk: 5
            }
        );
        assert_eq!(table.lookup(ChunkId(3)), Some(1));
        assert_eq!(table.lookup(ChunkId(5)), Some(0));
        assert_eq!(table.num_sectors(), 6 * CHUNK_SIZE);
    }

    #[test]
    fn no_two_copies_get_contiguous_chunks() {
        let mut builder = CowImageBuilder::new();
        for block in 0..64_u64 {
            builder.copy(block + 100, block + 500);
            if block % 3 == 0 {
                builder.zero(block + 900);
            }
        }
        let log = log_from(&builder);
        let table = build(log.ops()).expect("build");

        let mappings: Vec<(ChunkId, usize)> = table.mappings().collect();
        for pair in mappings.windows(2) {
            let (a_chunk, a_index) = pair[0];
            let (b_chunk, b_index) = pair[1];
            let a_copy = log.ops()[a_index].kind == COW_OP_COPY;
            let b_copy = log.ops()[b_index].kind == COW_OP_COPY;
            if a_copy && b_copy {
                assert!(
                    b_chunk.0 > a_chunk.0 + 1,
                    "copies at contiguous chunks {a_chunk} and {b_chunk}"
                );
            }
        }
    }

    #[test]
    fn assignments_follow_reverse_log_order() {
        let log = log_from(
            CowImageBuilder::new()
                .zero(1)
                .label(42)
                .replace(2, &[1; BLOCK_SIZE])
                .zero(3)
                .footer(),
        );
        let table = build(log.ops()).expect("build");

        // Ascending chunk order must replay the mergeable ops backwards.
        let kinds: Vec<u16> = table
            .mappings()
            .map(|(_, index)| log.ops()[index].kind)
            .collect();
        assert_eq!(kinds, vec![COW_OP_ZERO, COW_OP_REPLACE, COW_OP_ZERO]);
        let blocks: Vec<u64> = table
            .mappings()
            .map(|(_, index)| log.ops()[index].new_block)
            .collect();
        assert_eq!(blocks, vec![3, 2, 1]);
    }

    #[test]
    fn data_chunks_never_collide_with_metadata_slots() {
        let mut builder = CowImageBuilder::new();
        for block in 0..600_u64 {
            builder.zero(block);
        }
        let log = log_from(&builder);
        let table = build(log.ops()).expect("build");

        for (chunk, _) in table.mappings() {
            assert!(!chunk.is_metadata(), "data chunk {chunk} on a metadata slot");
            assert!(chunk.0 >= 2);
        }
    }

    #[test]
    fn area_rollover_skips_the_next_metadata_chunk() {
        let mut builder = CowImageBuilder::new();
        for block in 0..257_u64 {
            builder.zero(block);
        }
        let log = log_from(&builder);
        let table = build(log.ops()).expect("build");

        assert_eq!(table.areas_len(), 2);

        // Area 0 is full; its last assignment is chunk 257, and the 257th
        // exception lands at 259 because 258 is a metadata chunk.
        let last_full = DiskException::decode_at(table.area(0), 255).expect("slot 255");
        assert_eq!(last_full.new_chunk, 257);
        let first_rolled = DiskException::decode_at(table.area(1), 0).expect("slot 0");
        assert_eq!(first_rolled.new_chunk, 259);
        assert!(DiskException::decode_at(table.area(1), 1)
            .expect("slot 1")
            .is_zero());

        // Each area's live entries carry ascending chunk ids drawn from its
        // own stride window.
        for area_index in 0..table.areas_len() {
            let mut previous = 0_u64;
            for slot in 0..EXCEPTIONS_PER_AREA {
                let entry = DiskException::decode_at(table.area(area_index), slot).expect("slot");
                if entry.is_zero() {
                    break;
                }
                assert!(entry.new_chunk > previous, "chunk ids must ascend");
                let window = entry.new_chunk - NUM_SNAPSHOT_HDR_CHUNKS;
                let k = area_index as u64;
                assert!(
                    window > k * STRIDE && window <= (k + 1) * STRIDE,
                    "chunk {} stored in area {area_index}",
                    entry.new_chunk
                );
                previous = entry.new_chunk;
            }
        }
    }

    #[test]
    fn empty_log_yields_one_zero_area() {
        let log = log_from(CowImageBuilder::new().label(9).footer());
        let table = build(log.ops()).expect("build");

        assert_eq!(table.areas_len(), 1);
        assert!(table.area(0).iter().all(|b| *b == 0));
        assert_eq!(table.mappings().count(), 0);
        assert_eq!(table.num_sectors(), 2 * CHUNK_SIZE);
    }

    #[test]
    fn unknown_op_kind_fails_the_build() {
        let op = CowOperation {
            kind: 99,
            compression: 0,
            data_length: 0,
            new_block: 1,
            source: 0,
        };
        assert!(matches!(build(&[op]), Err(SnapError::UnknownOp(99))));
    }

    #[test]
    fn metadata_read_copies_area_and_zero_fills_past_end() {
        let log = log_from(CowImageBuilder::new().zero(5));
        let table = build(log.ops()).expect("build");
        let mut sink = BufferSink::new();

        table
            .read_metadata(ChunkId(1), AREA_BYTES, &mut sink)
            .expect("area 0");
        assert_eq!(sink.payload(AREA_BYTES), table.area(0));

        // Same read twice returns identical bytes.
        let first: Vec<u8> = sink.payload(AREA_BYTES).to_vec();
        table
            .read_metadata(ChunkId(1), AREA_BYTES, &mut sink)
            .expect("area 0 again");
        assert_eq!(sink.payload(AREA_BYTES), &first[..]);

        // Prefetch past the end answers zeroes.
        table
            .read_metadata(ChunkId(1 + STRIDE), AREA_BYTES, &mut sink)
            .expect("past the end");
        assert!(sink.payload(AREA_BYTES).iter().all(|b| *b == 0));
    }

    #[test]
    fn oversized_metadata_read_is_rejected() {
        let log = log_from(CowImageBuilder::new().zero(5));
        let table = build(log.ops()).expect("build");
        let mut sink = BufferSink::new();

        let err = table
            .read_metadata(ChunkId(1), AREA_BYTES + 1, &mut sink)
            .expect_err("oversized");
        assert!(matches!(err, SnapError::BadRequest(_)));
        assert!(err.is_request_scoped());
    }
}
