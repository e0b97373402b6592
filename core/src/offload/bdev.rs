//!
//! Block-device seam for the offload tier.
//!
//! The poller talks to a `BlockDevice`; production deployments back it with
//! an NVMe namespace addressed by PCI bus address, development and tests
//! with a plain file. The device is not self-describing: the pmem index is
//! the only map of what lives where.
//!

use crate::common::{fail, OpResult, StatusCode};
use crossbeam_queue::SegQueue;
use log::info;
use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> u64;
    fn block_count(&self) -> u64;
    /// Stable identifier persisted into device-address records.
    fn bus_addr(&self) -> u64;
    /// Read whole blocks starting at `lba` (in device blocks).
    fn read(&self, lba: u64, buf: &mut [u8]) -> OpResult<()>;
    /// Write whole blocks starting at `lba` (in device blocks).
    fn write(&self, lba: u64, buf: &[u8]) -> OpResult<()>;
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

pub const DEFAULT_BLOCK_SIZE: u64 = 512;

/// File-backed block device.
pub struct FileBdev {
    file: File,
    block_size: u64,
    block_count: u64,
    bus_addr: u64,
}

impl FileBdev {
    pub fn open(
        path: impl AsRef<Path>,
        size: u64,
        block_size: u64,
        ident: &str,
    ) -> OpResult<Self> {
        if block_size == 0 || size < block_size {
            return fail(StatusCode::NotSupported);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())
            .map_err(|_| StatusCode::UnknownError)?;
        let cur = file
            .metadata()
            .map_err(|_| StatusCode::UnknownError)?
            .len();
        if cur < size {
            file.set_len(size).map_err(|_| StatusCode::UnknownError)?;
        }
        info!(
            "offload device {:?} attached: {} blocks of {} bytes",
            path.as_ref(),
            size / block_size,
            block_size
        );
        Ok(FileBdev {
            file,
            block_size,
            block_count: size / block_size,
            bus_addr: ident_hash(ident),
        })
    }
}

/// FNV-1a over the configured device identifier.
fn ident_hash(ident: &str) -> u64 {
    let mut h = 0xcbf2_9ce4_8422_2325u64;
    for b in ident.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

impl BlockDevice for FileBdev {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    fn read(&self, lba: u64, buf: &mut [u8]) -> OpResult<()> {
        debug_assert_eq!(buf.len() as u64 % self.block_size, 0);
        self.file
            .read_exact_at(buf, lba * self.block_size)
            .map_err(|_| StatusCode::UnknownError.into())
    }

    fn write(&self, lba: u64, buf: &[u8]) -> OpResult<()> {
        debug_assert_eq!(buf.len() as u64 % self.block_size, 0);
        self.file
            .write_all_at(buf, lba * self.block_size)
            .map_err(|_| StatusCode::UnknownError.into())
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// Pool of pre-sized I/O buffers. Exhaustion is back-pressure: the caller
/// reports `QueueFullError` instead of allocating.
pub struct IoBufPool {
    bufs: SegQueue<Vec<u8>>,
    buf_size: usize,
}

impl IoBufPool {
    pub fn new(count: usize, buf_size: usize) -> Self {
        let bufs = SegQueue::new();
        for _ in 0..count {
            bufs.push(vec![0u8; buf_size]);
        }
        IoBufPool { bufs, buf_size }
    }

    #[inline(always)]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn take(&self) -> Option<Vec<u8>> {
        self.bufs.pop()
    }

    pub fn put_back(&self, mut buf: Vec<u8>) {
        buf.clear();
        buf.resize(self.buf_size, 0);
        self.bufs.push(buf);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ruc::*;

    #[test]
    fn file_bdev_rw() {
        let dir = format!("/tmp/fragstore_testing/{}", rand::random::<u128>());
        pnk!(std::fs::create_dir_all(&dir));
        let bdev = pnk!(FileBdev::open(
            format!("{}/bdev.img", dir),
            1 << 20,
            DEFAULT_BLOCK_SIZE,
            "0000:05:00.0"
        ));
        assert_eq!(bdev.block_count(), 2048);

        let wr = vec![0x5au8; 1024];
        pnk!(bdev.write(4, &wr));
        let mut rd = vec![0u8; 1024];
        pnk!(bdev.read(4, &mut rd));
        assert_eq!(wr, rd);

        // unwritten blocks read back zeroed
        let mut rd = vec![1u8; 512];
        pnk!(bdev.read(100, &mut rd));
        assert!(rd.iter().all(|b| *b == 0));
    }

    #[test]
    fn buf_pool_backpressure() {
        let pool = IoBufPool::new(2, 64);
        let a = pool.take().unwrap();
        let _b = pool.take().unwrap();
        assert!(pool.take().is_none());
        pool.put_back(a);
        assert_eq!(pool.take().unwrap().len(), 64);
    }
}
