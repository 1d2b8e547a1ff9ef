#![forbid(unsafe_code)]
//! The snapserv translation engine.
//!
//! One [`SnapshotDevice`] backs one logical snapshot device: it parses the
//! COW log, fabricates the kernel-format exception metadata, and then sits
//! in a synchronous request loop on the UBD control channel. Reads are
//! answered from the synthesized header, the exception areas, or per-block
//! operation dispatch; the only writes the kernel sends are flushes and
//! merge-completion pages.
//!
//! The loop is strictly single-threaded per device: a request is serviced
//! to completion before the next header is read, and the exception table
//! is only ever touched from that thread.

pub mod dispatch;
pub mod merge;
pub mod metadata;

use metadata::ExceptionTable;
use serde::Serialize;
use snap_block::{ByteDevice, ControlChannel};
use snap_cow::CowLog;
use snap_error::{Result, SnapError};
use snap_proto::{
    BufferSink, DiskHeader, UbdHeader, UBD_REQ_MAP_READ, UBD_REQ_MAP_WRITE, UBD_RESP_ERROR,
    UBD_RESP_SUCCESS,
};
use snap_types::{ChunkId, BLOCK_SIZE, PAYLOAD_SIZE};
use tracing::{debug, error, info, warn};

/// Serializable snapshot of a device's translation state.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DeviceSummary {
    pub num_sectors: u64,
    pub areas: usize,
    pub exceptions: usize,
    pub ops: usize,
    pub mergeable_ops: u64,
    pub num_merge_ops: u64,
}

/// One logical snapshot device: COW log, base device, synthesized
/// metadata, and the scratch buffer its request loop frames responses in.
pub struct SnapshotDevice<C: ByteDevice, B: ByteDevice> {
    cow: CowLog<C>,
    base: B,
    table: ExceptionTable,
    merge_position: usize,
    sink: BufferSink,
    metadata_ready: bool,
}

impl<C: ByteDevice, B: ByteDevice> SnapshotDevice<C, B> {
    /// Parse the COW log on `cow_dev` and build the device's metadata.
    ///
    /// Fails on any log the kernel could not be given a coherent view of:
    /// unparseable header, unknown operation kinds, merge progress past
    /// the end of the log.
    pub fn new(cow_dev: C, base: B) -> Result<Self> {
        let cow = CowLog::parse(cow_dev)?;
        let table = metadata::build(cow.ops())?;
        let merge_position = cow.initialize_merge()?;

        info!(
            target: "snap::core",
            num_sectors = table.num_sectors(),
            areas = table.areas_len(),
            ops = cow.ops().len(),
            resumed_at = merge_position,
            "snapshot device ready"
        );

        Ok(Self {
            cow,
            base,
            table,
            merge_position,
            sink: BufferSink::new(),
            metadata_ready: true,
        })
    }

    /// Sector count the enclosing daemon advertises for this device.
    #[must_use]
    pub fn num_sectors(&self) -> u64 {
        self.table.num_sectors()
    }

    #[must_use]
    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            num_sectors: self.table.num_sectors(),
            areas: self.table.areas_len(),
            exceptions: self.table.mappings().count(),
            ops: self.cow.ops().len(),
            mergeable_ops: self.cow.mergeable_ops(),
            num_merge_ops: self.cow.header().num_merge_ops,
        }
    }

    /// Run the request loop until the control channel closes.
    ///
    /// Per-request failures are answered over the wire and never stop the
    /// loop; only control-channel I/O errors and invariant violations do.
    pub fn serve<T: ControlChannel>(&mut self, ctrl: &mut T) -> Result<()> {
        loop {
            if !self.service_request(ctrl)? {
                info!(target: "snap::core", "control channel closed");
                return Ok(());
            }
        }
    }

    /// Service one request. Returns `false` on a clean channel close.
    fn service_request<T: ControlChannel>(&mut self, ctrl: &mut T) -> Result<bool> {
        self.sink.clear();
        if let Err(err) = ctrl.read_exact(self.sink.header_bytes_mut()) {
            return match err {
                SnapError::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                    Ok(false)
                }
                other => Err(other),
            };
        }

        let request = self.sink.read_header()?;
        debug!(
            target: "snap::core",
            seq = request.seq,
            kind = request.kind,
            sector = request.sector,
            len = request.len,
            "request"
        );

        match request.kind {
            UBD_REQ_MAP_READ => self.handle_read(ctrl, request)?,
            UBD_REQ_MAP_WRITE => self.handle_write(ctrl, request)?,
            other => {
                warn!(target: "snap::core", kind = other, "unsupported request kind");
                let mut response = request;
                response.kind = UBD_RESP_ERROR;
                self.sink.write_header(&response)?;
                ctrl.write_all(self.sink.frame(0))?;
            }
        }
        Ok(true)
    }

    /// Answer a read, split into frames of at most `PAYLOAD_SIZE` bytes.
    fn handle_read<T: ControlChannel>(&mut self, ctrl: &mut T, request: UbdHeader) -> Result<()> {
        let total = usize::try_from(request.len)
            .map_err(|_| SnapError::Protocol("read length overflows usize".to_owned()))?;
        let mut remaining = total;
        let mut offset = 0_usize;

        loop {
            let read_size = remaining.min(PAYLOAD_SIZE);
            let mut response = request;
            response.kind = UBD_RESP_SUCCESS;

            if let Err(err) = self.fill_read_payload(&request, offset, read_size) {
                if !err.is_request_scoped() {
                    return Err(err);
                }
                error!(
                    target: "snap::core",
                    sector = request.sector,
                    error = %err,
                    "read failed"
                );
                response.kind = UBD_RESP_ERROR;
            }

            self.sink.write_header(&response)?;
            ctrl.write_all(self.sink.frame(read_size))?;

            remaining -= read_size;
            offset += read_size;
            if remaining == 0 {
                return Ok(());
            }
        }
    }

    /// Produce one read frame's payload.
    fn fill_read_payload(
        &mut self,
        request: &UbdHeader,
        offset: usize,
        read_size: usize,
    ) -> Result<()> {
        // Sector 0 is the one-time read of the synthesized snapshot
        // header at device creation, always a single block.
        if request.sector == 0 {
            if !self.metadata_ready {
                return Err(SnapError::Invariant(
                    "header read before metadata construction".to_owned(),
                ));
            }
            if read_size != BLOCK_SIZE {
                return Err(SnapError::Invariant(format!(
                    "header read of {read_size} bytes"
                )));
            }
            let page = self.sink.payload_buffer(BLOCK_SIZE).ok_or_else(|| {
                SnapError::Invariant("payload arena cannot hold the header".to_owned())
            })?;
            page.fill(0);
            DiskHeader::synthesized().encode_into(page)?;
            return Ok(());
        }

        let chunk = request.sector_id().to_chunk();
        if self.table.contains(chunk) {
            let chunks_done = (offset / BLOCK_SIZE) as u64;
            dispatch::read_data(
                &self.cow,
                &self.base,
                &self.table,
                ChunkId(chunk.0 + chunks_done),
                read_size,
                &mut self.sink,
            )
        } else {
            // Unmapped chunks are metadata requests; past-the-end reads
            // zero-fill to stop the kernel's prefetch.
            self.table.read_metadata(chunk, read_size, &mut self.sink)
        }
    }

    /// Handle a write: a flush at sector 0, or a merge-completion page
    /// for a metadata chunk.
    fn handle_write<T: ControlChannel>(&mut self, ctrl: &mut T, request: UbdHeader) -> Result<()> {
        let mut response = request;

        if request.sector == 0 {
            // Zero-length flush bio routed to us; nothing is cached here.
            if request.len != 0 {
                return Err(SnapError::Protocol(format!(
                    "flush carrying {} payload bytes",
                    request.len
                )));
            }
            response.kind = UBD_RESP_SUCCESS;
            self.sink.write_header(&response)?;
            ctrl.write_all(self.sink.frame(0))?;
            return Ok(());
        }

        if request.len as usize != BLOCK_SIZE {
            return Err(SnapError::Protocol(format!(
                "merge write of {} bytes",
                request.len
            )));
        }
        let chunk = request.sector_id().to_chunk();
        if self.table.contains(chunk) {
            return Err(SnapError::Invariant(format!(
                "merge write addressed data chunk {chunk}"
            )));
        }

        response.kind = UBD_RESP_SUCCESS;
        let mut page = [0_u8; BLOCK_SIZE];
        {
            let buffer = self.sink.payload_buffer(BLOCK_SIZE).ok_or_else(|| {
                SnapError::Invariant("payload arena cannot hold a merge page".to_owned())
            })?;
            if let Err(err) = ctrl.read_exact(buffer) {
                error!(
                    target: "snap::core",
                    sector = request.sector,
                    error = %err,
                    "merge payload read failed"
                );
                response.kind = UBD_RESP_ERROR;
            } else {
                page.copy_from_slice(buffer);
            }
        }

        if response.kind == UBD_RESP_SUCCESS {
            match merge::process_merge_complete(
                &mut self.cow,
                &mut self.table,
                &mut self.merge_position,
                chunk,
                &page,
            ) {
                Ok(merged) => {
                    debug!(
                        target: "snap::core",
                        sector = request.sector,
                        merged,
                        "merge cycle complete"
                    );
                }
                Err(err) if err.is_request_scoped() => {
                    error!(
                        target: "snap::core",
                        sector = request.sector,
                        error = %err,
                        "merge reconciliation failed"
                    );
                    response.kind = UBD_RESP_ERROR;
                }
                Err(err) => return Err(err),
            }
        }

        self.sink.write_header(&response)?;
        ctrl.write_all(self.sink.frame(0))?;
        Ok(())
    }
}
