//! Merge-completion reconciliation.
//!
//! After the kernel retires exceptions from the tail of a metadata area,
//! it writes the whole area page back. The page is the kernel's view:
//! still-live exceptions first, then zeroes where merged entries used to
//! be. Reconciliation diffs that view against the stored area, counts the
//! newly retired exceptions, zeroes them in place, walks the forward log
//! cursor past the same number of mergeable operations, and commits the
//! new total durably. The kernel retires areas from their tails, so the
//! forward cursor consumes the log in its own order.

use crate::metadata::{ExceptionTable, AREA_BYTES};
use snap_block::ByteDevice;
use snap_cow::CowLog;
use snap_error::{Result, SnapError};
use snap_proto::DiskException;
use snap_types::{u64_to_usize, ChunkId, EXCEPTIONS_PER_AREA};
use tracing::debug;

/// Reconcile one merge-completion page for the area addressed by `chunk`.
///
/// Returns the number of operations merged in this cycle. On success the
/// stored area reflects the kernel's view, `merge_position` has advanced,
/// and the new merge total is durable.
pub fn process_merge_complete<D: ByteDevice>(
    log: &mut CowLog<D>,
    table: &mut ExceptionTable,
    merge_position: &mut usize,
    chunk: ChunkId,
    incoming: &[u8],
) -> Result<u64> {
    if incoming.len() != AREA_BYTES {
        return Err(SnapError::Invariant(format!(
            "merge page of {} bytes",
            incoming.len()
        )));
    }
    let area_index = u64_to_usize(chunk.area_index(), "area_index")?;
    if area_index >= table.areas_len() {
        return Err(SnapError::Invariant(format!(
            "merge write for area {area_index}, device has {}",
            table.areas_len()
        )));
    }

    let (unmerged, merged_now) = {
        let area = table.area_mut(area_index);
        let unmerged = merge_frontier(incoming, area, area_index)?;
        let merged_now = retire_merged(incoming, area, unmerged, area_index)?;
        (unmerged, merged_now)
    };

    advance_cursor(log, merge_position, merged_now)?;

    let merged_now = merged_now as u64;
    log.update_merge_progress(merged_now);
    log.commit_merge(merged_now)?;

    debug!(
        target: "snap::core::merge",
        event = "reconciled",
        area = area_index,
        unmerged,
        merged_now,
        num_merge_ops = log.header().num_merge_ops
    );
    Ok(merged_now)
}

/// Walk the kernel page and the stored area in lockstep until the first
/// all-zero kernel entry; everything before it is still unmerged and must
/// match the stored metadata exactly.
fn merge_frontier(incoming: &[u8], area: &[u8], area_index: usize) -> Result<usize> {
    let mut unmerged = 0_usize;
    for slot in 0..EXCEPTIONS_PER_AREA {
        let merged = DiskException::decode_at(incoming, slot)?;
        if merged.old_chunk != 0 {
            if merged.new_chunk == 0 {
                return Err(corrupt(
                    area_index,
                    format!("kernel entry {slot} has an old chunk but no new chunk"),
                ));
            }
            let stored = DiskException::decode_at(area, slot)?;
            if merged != stored {
                return Err(corrupt(
                    area_index,
                    format!(
                        "kernel entry {slot} ({}, {}) does not match stored ({}, {})",
                        merged.old_chunk, merged.new_chunk, stored.old_chunk, stored.new_chunk
                    ),
                ));
            }
            unmerged += 1;
            continue;
        }
        if merged.new_chunk != 0 {
            return Err(corrupt(
                area_index,
                format!("kernel entry {slot} has a new chunk but no old chunk"),
            ));
        }
        return Ok(unmerged);
    }

    // A write with nothing merged should never reach us.
    Err(SnapError::Invariant(format!(
        "merge page for area {area_index} has no merged entries"
    )))
}

/// Count the entries the kernel retired this cycle, zeroing each in the
/// stored area. Stops at entries that were already merged in an earlier
/// cycle or at the zero tail of a partial area.
fn retire_merged(
    incoming: &[u8],
    area: &mut [u8],
    unmerged: usize,
    area_index: usize,
) -> Result<usize> {
    let mut merged_now = 0_usize;
    for slot in unmerged..EXCEPTIONS_PER_AREA {
        let merged = DiskException::decode_at(incoming, slot)?;
        if !merged.is_zero() {
            return Err(corrupt(
                area_index,
                format!("kernel entry {slot} is live past the merge frontier"),
            ));
        }

        let stored = DiskException::decode_at(area, slot)?;
        if stored.new_chunk != 0 {
            DiskException::default().encode_at(area, slot)?;
            merged_now += 1;
        } else if stored.old_chunk == 0 {
            break;
        } else {
            return Err(corrupt(
                area_index,
                format!(
                    "stored entry {slot} has old chunk {} but no new chunk",
                    stored.old_chunk
                ),
            ));
        }
    }

    if merged_now == 0 {
        return Err(corrupt(
            area_index,
            "no newly merged exceptions in this cycle".to_owned(),
        ));
    }
    Ok(merged_now)
}

/// Advance the forward cursor past `credits` mergeable operations.
/// Footer and label records are stepped over without consuming a credit.
fn advance_cursor<D: ByteDevice>(
    log: &CowLog<D>,
    merge_position: &mut usize,
    credits: usize,
) -> Result<()> {
    let ops = log.ops();
    let mut position = *merge_position;
    let mut remaining = credits;
    while remaining > 0 {
        match ops.get(position) {
            None => {
                return Err(SnapError::Invariant(format!(
                    "merge of {credits} ops runs past the end of the log"
                )));
            }
            Some(op) if op.is_marker() => position += 1,
            Some(op) if op.is_mergeable() => {
                remaining -= 1;
                position += 1;
            }
            Some(op) => return Err(SnapError::UnknownOp(op.kind)),
        }
    }
    *merge_position = position;
    Ok(())
}

fn corrupt(area_index: usize, detail: String) -> SnapError {
    SnapError::MergeCorruption {
        area: area_index as u64,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata;
    use snap_block::MemoryByteDevice;
    use snap_cow::CowImageBuilder;
    use snap_types::BLOCK_SIZE;

    struct Fixture {
        log: CowLog<MemoryByteDevice>,
        table: ExceptionTable,
        merge_position: usize,
    }

    fn fixture(builder: &CowImageBuilder) -> Fixture {
        let image = builder.build().expect("build image");
        let log = CowLog::parse(MemoryByteDevice::from_vec(image)).expect("parse image");
        let table = metadata::build(log.ops()).expect("build table");
        let merge_position = log.initialize_merge().expect("merge cursor");
        Fixture {
            log,
            table,
            merge_position,
        }
    }

    fn merge(fx: &mut Fixture, chunk: ChunkId, incoming: &[u8]) -> Result<u64> {
        process_merge_complete(
            &mut fx.log,
            &mut fx.table,
            &mut fx.merge_position,
            chunk,
            incoming,
        )
    }

    /// Kernel view of `area` after the tail `count` live entries merged.
    fn page_with_tail_merged(area: &[u8], count: usize) -> Vec<u8> {
        let mut page = area.to_vec();
        let live = (0..EXCEPTIONS_PER_AREA)
            .take_while(|slot| {
                !DiskException::decode_at(area, *slot)
                    .expect("slot")
                    .is_zero()
            })
            .count();
        for slot in live.saturating_sub(count)..live {
            DiskException::default()
                .encode_at(&mut page, slot)
                .expect("zero entry");
        }
        page
    }

    #[test]
    fn full_area_merge_commits_everything() {
        let mut fx = fixture(
            CowImageBuilder::new()
                .replace(10, &[0xAB; BLOCK_SIZE])
                .copy(20, 30),
        );
        assert_eq!(fx.log.header().num_merge_ops, 0);

        let incoming = vec![0_u8; AREA_BYTES];
        let merged = merge(&mut fx, ChunkId(1), &incoming).expect("merge");

        assert_eq!(merged, 2);
        assert_eq!(fx.log.header().num_merge_ops, 2);
        assert_eq!(fx.log.merge_progress(), 2);
        assert_eq!(fx.merge_position, 2);
        assert!(fx.table.area(0).iter().all(|b| *b == 0));
    }

    #[test]
    fn partial_merge_zeroes_only_the_tail() {
        let mut builder = CowImageBuilder::new();
        for block in 0..256_u64 {
            builder.zero(block);
        }
        let mut fx = fixture(&builder);

        let incoming = page_with_tail_merged(fx.table.area(0), 100);
        let merged = merge(&mut fx, ChunkId(1), &incoming).expect("merge");

        assert_eq!(merged, 100);
        assert_eq!(fx.merge_position, 100);
        for slot in 0..156 {
            assert!(!DiskException::decode_at(fx.table.area(0), slot)
                .expect("slot")
                .is_zero());
        }
        for slot in 156..EXCEPTIONS_PER_AREA {
            assert!(DiskException::decode_at(fx.table.area(0), slot)
                .expect("slot")
                .is_zero());
        }
    }

    #[test]
    fn successive_cycles_keep_progress_monotone() {
        let mut builder = CowImageBuilder::new();
        for block in 0..8_u64 {
            builder.zero(block);
        }
        let mut fx = fixture(&builder);

        let mut committed = 0_u64;
        for cycle in 1..=4_usize {
            let incoming = page_with_tail_merged(fx.table.area(0), 2);
            let merged = merge(&mut fx, ChunkId(1), &incoming).expect("cycle");
            assert_eq!(merged, 2);
            committed += merged;
            assert_eq!(fx.log.header().num_merge_ops, committed);
            assert_eq!(fx.merge_position, 2 * cycle);
        }
        assert_eq!(committed, 8);
        assert!(fx.log.header().num_merge_ops <= fx.log.mergeable_ops());
    }

    #[test]
    fn markers_do_not_consume_merge_credits() {
        let mut fx = fixture(
            CowImageBuilder::new()
                .label(1)
                .zero(5)
                .label(2)
                .zero(6)
                .footer(),
        );

        let incoming = vec![0_u8; AREA_BYTES];
        let merged = merge(&mut fx, ChunkId(1), &incoming).expect("merge");
        assert_eq!(merged, 2);
        // Past label, zero, label, zero.
        assert_eq!(fx.merge_position, 4);
    }

    #[test]
    fn spurious_page_with_nothing_merged_is_rejected() {
        let mut fx = fixture(&{
            let mut b = CowImageBuilder::new();
            b.zero(1).zero(2);
            b
        });

        // Kernel page identical to the stored area: nothing merged.
        let incoming = fx.table.area(0).to_vec();
        let err = merge(&mut fx, ChunkId(1), &incoming).expect_err("nothing merged");
        assert!(matches!(err, SnapError::MergeCorruption { .. }));
    }

    #[test]
    fn mismatched_live_entry_is_corruption() {
        let mut fx = fixture(&{
            let mut b = CowImageBuilder::new();
            b.zero(1).zero(2);
            b
        });

        let mut incoming = page_with_tail_merged(fx.table.area(0), 1);
        // Corrupt the still-live first entry.
        let mut live = DiskException::decode_at(&incoming, 0).expect("slot 0");
        live.old_chunk ^= 0xFF;
        live.encode_at(&mut incoming, 0).expect("corrupt entry");

        let err = merge(&mut fx, ChunkId(1), &incoming).expect_err("mismatch");
        assert!(matches!(err, SnapError::MergeCorruption { .. }));
        assert!(err.is_request_scoped());
    }

    #[test]
    fn merge_write_past_the_last_area_is_fatal() {
        let mut fx = fixture(&{
            let mut b = CowImageBuilder::new();
            b.zero(1);
            b
        });

        let incoming = vec![0_u8; AREA_BYTES];
        let err = merge(&mut fx, ChunkId(258), &incoming).expect_err("no such area");
        assert!(matches!(err, SnapError::Invariant(_)));
    }

    #[test]
    fn reopened_log_resumes_where_the_commit_left_off() {
        let mut builder = CowImageBuilder::new();
        for block in 0..4_u64 {
            builder.zero(block);
        }
        let mut fx = fixture(&builder);

        let incoming = page_with_tail_merged(fx.table.area(0), 3);
        merge(&mut fx, ChunkId(1), &incoming).expect("first session");

        // A restarted daemon rebuilds everything from the same device.
        let image = fx.log.device().contents();
        let log = CowLog::parse(MemoryByteDevice::from_vec(image)).expect("reopen");
        assert_eq!(log.header().num_merge_ops, 3);
        assert_eq!(log.initialize_merge().expect("cursor"), 3);
    }
}
