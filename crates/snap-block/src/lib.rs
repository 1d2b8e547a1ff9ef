#![forbid(unsafe_code)]
//! Device access seams for snapserv.
//!
//! Two traits cover every descriptor the daemon touches:
//!
//! - [`ByteDevice`]: fixed-offset I/O (pread/pwrite semantics) for the
//!   base device and the COW device.
//! - [`ControlChannel`]: sequential I/O for the UBD misc character
//!   device, which has no seek position worth speaking of.
//!
//! File-backed implementations live here alongside [`MemoryByteDevice`],
//! which backs the test suites of every crate in the workspace.

use parking_lot::Mutex;
use snap_error::{Result, SnapError};
use snap_types::ByteOffset;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed device for fixed-offset I/O.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes; 0 when the backend does not report one.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` at `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write if possible, read-only otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Open read-only.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: false,
        })
    }

    fn check_write_range(&self, offset: ByteOffset, len: usize) -> Result<()> {
        // Block and character special files report zero metadata length;
        // the kernel enforces their bounds.
        if self.len == 0 {
            return Ok(());
        }
        let len = u64::try_from(len)
            .map_err(|_| SnapError::Format("write length overflows u64".to_owned()))?;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| SnapError::Format("write range overflows u64".to_owned()))?;
        if end.0 > self.len {
            return Err(SnapError::Format(format!(
                "write out of bounds: offset={offset} len={len} device_len={}",
                self.len
            )));
        }
        Ok(())
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        // Short reads past the extent surface as UnexpectedEof, which the
        // request loop answers per-request rather than dying on.
        self.file.read_exact_at(buf, offset.0)?;
        trace!(target: "snap::block", event = "read", offset = offset.0, len = buf.len());
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SnapError::Format("device opened read-only".to_owned()));
        }
        self.check_write_range(offset, buf.len())?;
        self.file.write_all_at(buf, offset.0)?;
        trace!(target: "snap::block", event = "write", offset = offset.0, len = buf.len());
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device used by tests and tooling across the workspace.
#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    /// Snapshot of the current contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let offset = usize::try_from(offset.0)
            .map_err(|_| SnapError::Format("offset overflows usize".to_owned()))?;
        let end = offset
            .checked_add(buf.len())
            .ok_or_else(|| SnapError::Format("read range overflow".to_owned()))?;
        let bytes = self.bytes.lock();
        if end > bytes.len() {
            // Same shape a file device produces for a short read.
            return Err(SnapError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "read out of bounds: offset={offset} len={} device_len={}",
                    buf.len(),
                    bytes.len()
                ),
            )));
        }
        buf.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        let offset = usize::try_from(offset.0)
            .map_err(|_| SnapError::Format("offset overflows usize".to_owned()))?;
        let end = offset
            .checked_add(buf.len())
            .ok_or_else(|| SnapError::Format("write range overflow".to_owned()))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(SnapError::Format(format!(
                "write out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                bytes.len()
            )));
        }
        bytes[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Sequential request/response channel to the UBD control device.
///
/// The misc device is a character device: requests are consumed by
/// successive reads and responses are produced by successive writes.
pub trait ControlChannel {
    /// Read exactly `buf.len()` bytes.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf`.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
}

/// File-backed control channel for the real UBD misc device.
#[derive(Debug)]
pub struct FileControlChannel {
    file: File,
}

impl FileControlChannel {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }
}

impl ControlChannel for FileControlChannel {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn memory_device_round_trips() {
        let dev = MemoryByteDevice::new(4096 * 4);
        dev.write_all_at(ByteOffset(4096), &[7_u8; 4096]).expect("write");

        let mut buf = [0_u8; 4096];
        dev.read_exact_at(ByteOffset(4096), &mut buf).expect("read");
        assert_eq!(buf, [7_u8; 4096]);

        assert_eq!(dev.len_bytes(), 4096 * 4);
    }

    #[test]
    fn memory_device_rejects_out_of_bounds() {
        let dev = MemoryByteDevice::new(4096);
        let mut buf = [0_u8; 64];
        assert!(dev.read_exact_at(ByteOffset(4090), &mut buf).is_err());
        assert!(dev.write_all_at(ByteOffset(4090), &buf).is_err());
    }

    #[test]
    fn file_device_round_trips() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(&vec![0_u8; 8192]).expect("seed");
        tmp.flush().expect("flush");

        let dev = FileByteDevice::open(tmp.path()).expect("open");
        dev.write_all_at(ByteOffset(512), b"snapserv").expect("write");

        let mut buf = [0_u8; 8];
        dev.read_exact_at(ByteOffset(512), &mut buf).expect("read");
        assert_eq!(&buf, b"snapserv");

        let mut oob = [0_u8; 16];
        assert!(dev.read_exact_at(ByteOffset(8185), &mut oob).is_err());
    }

    #[test]
    fn read_only_file_device_rejects_writes() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(&[0_u8; 1024]).expect("seed");
        tmp.flush().expect("flush");

        let dev = FileByteDevice::open_read_only(tmp.path()).expect("open");
        assert!(dev.write_all_at(ByteOffset(0), &[1_u8; 4]).is_err());
    }
}
