//!
//! The memory-mapped persistent pool.
//!
//! Layout:
//!
//! ```text
//! [ header | redo log | heap ... ]
//! ```
//!
//! The header carries the layout tag, the geometry, the persistent roots
//! (index head, free-list root) and the heap allocator state. The redo log
//! makes multi-word mutations atomic: a transaction stages its writes, the
//! commit serializes them into the log, sets the commit flag, applies them
//! to their home offsets, and clears the flag. Opening a pool replays a
//! committed-but-unapplied log before anything else reads the heap.
//!
//! The heap hands out chunks in multiples of the configured allocation unit.
//! Freed chunks go on a persistent singly-linked list and are reused
//! first-fit; chunks are never split.
//!

use crate::common::{fail, OpError, OpResult, StatusCode, GB, MB};
use log::{debug, info, warn};
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::{
    cell::UnsafeCell,
    collections::HashMap,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

const POOL_MAGIC: u64 = 0x4652_4147_504f_4f4c; // "FRAGPOOL"
const POOL_VERSION: u64 = 1;

const OFF_MAGIC: u64 = 0;
const OFF_VERSION: u64 = 8;
const OFF_TOTAL_SIZE: u64 = 16;
const OFF_ALLOC_UNIT: u64 = 24;
pub const OFF_INDEX_HEAD: u64 = 32;
pub const OFF_FREELIST_ROOT: u64 = 40;
const OFF_HEAP_NEXT: u64 = 48;
const OFF_FREE_HEAD: u64 = 56;
const HDR_SIZE: u64 = 64;

const OFF_LOG_COMMIT: u64 = HDR_SIZE;
const OFF_LOG_COUNT: u64 = HDR_SIZE + 8;
const OFF_LOG_DATA: u64 = HDR_SIZE + 16;
const LOG_SIZE: u64 = 8 * MB;

pub const HEAP_BASE: u64 = HDR_SIZE + LOG_SIZE;

/// Per-chunk bookkeeping: `[size u64][next u64]`. `next` links free chunks.
const CHUNK_HDR: u64 = 16;

const MIN_POOL_SIZE: u64 = HEAP_BASE + MB;
const MAX_POOL_SIZE: u64 = 64 * GB;

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

struct MapCell(UnsafeCell<MmapMut>);

// The map is written only with the transaction lock held (commit + replay);
// concurrent readers never overlap a region an in-flight transaction is
// rewriting, because every reader resolves offsets through index state that
// is published only after commit.
unsafe impl Sync for MapCell {}
unsafe impl Send for MapCell {}

pub struct PmemPool {
    map: MapCell,
    len: u64,
    alloc_unit: u64,
    tx_lock: Mutex<()>,
    path: PathBuf,
}

impl PmemPool {
    /// Map (and if absent, create) the pool file. An existing pool is
    /// reattached: the header is validated, a committed redo log is
    /// replayed. `truncate` forces a fresh pool.
    pub fn open(
        path: impl AsRef<Path>,
        total_size: u64,
        alloc_unit: u64,
        truncate: bool,
    ) -> OpResult<Self> {
        if total_size < MIN_POOL_SIZE || total_size > MAX_POOL_SIZE {
            return fail(StatusCode::AllocationError);
        }
        if alloc_unit == 0 || !alloc_unit.is_power_of_two() {
            return fail(StatusCode::NotSupported);
        }
        let path = path.as_ref().to_path_buf();
        if truncate && path.exists() {
            fs::remove_file(&path).map_err(io_err)?;
        }
        let existed = path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(io_err)?;
        let len = if existed {
            let l = file.metadata().map_err(io_err)?.len();
            if l < MIN_POOL_SIZE {
                warn!("pool file {:?} too small to reattach", path);
                return fail(StatusCode::AllocationError);
            }
            l
        } else {
            file.set_len(total_size).map_err(io_err)?;
            total_size
        };

        let map = unsafe { MmapMut::map_mut(&file).map_err(io_err)? };
        let mut pool = PmemPool {
            map: MapCell(UnsafeCell::new(map)),
            len,
            alloc_unit,
            tx_lock: Mutex::new(()),
            path,
        };

        if existed && pool.read_u64(OFF_MAGIC) == POOL_MAGIC {
            if pool.read_u64(OFF_VERSION) != POOL_VERSION {
                return fail(StatusCode::NotSupported);
            }
            // the pool's own geometry wins over the caller's on reattach
            pool.alloc_unit = pool.read_u64(OFF_ALLOC_UNIT);
            pool.replay_log()?;
            info!(
                "reattached pmem pool {:?} ({} bytes, unit {})",
                pool.path, pool.len, pool.alloc_unit
            );
        } else {
            pool.format(total_size.min(len))?;
            info!(
                "created pmem pool {:?} ({} bytes, unit {})",
                pool.path, pool.len, alloc_unit
            );
        }
        Ok(pool)
    }

    fn format(&self, total_size: u64) -> OpResult<()> {
        let map = self.map_mut();
        map[..HEAP_BASE as usize].fill(0);
        self.put_u64(OFF_VERSION, POOL_VERSION);
        self.put_u64(OFF_TOTAL_SIZE, total_size);
        self.put_u64(OFF_ALLOC_UNIT, self.alloc_unit);
        self.put_u64(OFF_HEAP_NEXT, HEAP_BASE);
        self.put_u64(OFF_FREE_HEAD, 0);
        self.put_u64(OFF_INDEX_HEAD, 0);
        self.put_u64(OFF_FREELIST_ROOT, 0);
        // magic last: a half-formatted pool is not a pool
        self.flush_range(0, HEAP_BASE as usize)?;
        self.put_u64(OFF_MAGIC, POOL_MAGIC);
        self.flush_range(OFF_MAGIC as usize, 8)
    }

    fn replay_log(&self) -> OpResult<()> {
        if self.read_u64(OFF_LOG_COMMIT) != 1 {
            return Ok(());
        }
        debug!("replaying committed redo log in {:?}", self.path);
        let count = self.read_u64(OFF_LOG_COUNT);
        let mut cur = OFF_LOG_DATA;
        for _ in 0..count {
            let off = self.read_u64(cur);
            let len = self.read_u64(cur + 8);
            let data_at = cur + 16;
            let map = self.map_mut();
            map.copy_within(
                data_at as usize..(data_at + len) as usize,
                off as usize,
            );
            cur = data_at + len;
        }
        self.flush()?;
        self.put_u64(OFF_LOG_COMMIT, 0);
        self.flush_range(OFF_LOG_COMMIT as usize, 8)
    }

    /////////////////////////////////////////////////////////////////////////

    #[inline(always)]
    fn map_ref(&self) -> &MmapMut {
        unsafe { &*self.map.0.get() }
    }

    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    fn map_mut(&self) -> &mut MmapMut {
        unsafe { &mut *self.map.0.get() }
    }

    #[inline(always)]
    fn put_u64(&self, off: u64, v: u64) {
        let off = off as usize;
        self.map_mut()[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// Borrow `len` bytes at `off` straight out of the mapping.
    #[inline(always)]
    pub fn read(&self, off: u64, len: usize) -> &[u8] {
        let off = off as usize;
        &self.map_ref()[off..off + len]
    }

    #[inline(always)]
    pub fn read_u64(&self, off: u64) -> u64 {
        let off = off as usize;
        u64::from_le_bytes(self.map_ref()[off..off + 8].try_into().unwrap())
    }

    #[inline(always)]
    pub fn alloc_unit(&self) -> u64 {
        self.alloc_unit
    }

    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn index_head(&self) -> u64 {
        self.read_u64(OFF_INDEX_HEAD)
    }

    pub fn freelist_root(&self) -> u64 {
        self.read_u64(OFF_FREELIST_ROOT)
    }

    pub fn flush(&self) -> OpResult<()> {
        self.map_ref().flush().map_err(io_err)
    }

    fn flush_range(&self, off: usize, len: usize) -> OpResult<()> {
        self.map_ref().flush_range(off, len).map_err(io_err)
    }

    /////////////////////////////////////////////////////////////////////////

    /// Run `f` inside a transaction. Transactions on the same pool
    /// serialize; a non-Ok return discards every staged write.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut PmemTx) -> OpResult<T>,
    ) -> OpResult<T> {
        let _guard = self.tx_lock.lock();
        let mut tx = PmemTx::begin(self);
        let out = f(&mut tx)?;
        tx.commit()?;
        Ok(out)
    }
}

fn io_err(e: std::io::Error) -> OpError {
    match e.raw_os_error() {
        Some(errno) => OpError::new(StatusCode::Errno(errno)),
        None => OpError::new(StatusCode::UnknownError),
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// An open transaction: staged writes plus shadow copies of the allocator
/// roots. Nothing touches the mapping until commit.
pub struct PmemTx<'a> {
    pool: &'a PmemPool,
    writes: Vec<(u64, Vec<u8>)>,
    bytes_staged: u64,
    heap_next: u64,
    free_head: u64,
    // chunk headers rewritten earlier in this transaction, so alloc/free
    // sequences within one transaction observe their own effects
    shadow_chunks: HashMap<u64, (u64, u64)>,
}

impl<'a> PmemTx<'a> {
    fn begin(pool: &'a PmemPool) -> Self {
        PmemTx {
            pool,
            writes: Vec::new(),
            bytes_staged: 0,
            heap_next: pool.read_u64(OFF_HEAP_NEXT),
            free_head: pool.read_u64(OFF_FREE_HEAD),
            shadow_chunks: HashMap::new(),
        }
    }

    pub fn write(&mut self, off: u64, data: &[u8]) -> OpResult<()> {
        debug_assert!(off + data.len() as u64 <= self.pool.len);
        self.bytes_staged += 16 + data.len() as u64;
        if OFF_LOG_DATA + self.bytes_staged > HEAP_BASE {
            // a single change larger than the redo log cannot be atomic
            return fail(StatusCode::AllocationError);
        }
        self.writes.push((off, data.to_vec()));
        Ok(())
    }

    pub fn write_u64(&mut self, off: u64, v: u64) -> OpResult<()> {
        self.write(off, &v.to_le_bytes())
    }

    /// Read an u64 as this transaction would leave it: staged writes win
    /// over the mapping.
    pub fn read_u64(&self, off: u64) -> u64 {
        for (woff, data) in self.writes.iter().rev() {
            if *woff == off && data.len() == 8 {
                return u64::from_le_bytes(data[..].try_into().unwrap());
            }
        }
        self.pool.read_u64(off)
    }

    #[inline(always)]
    pub fn pool(&self) -> &PmemPool {
        self.pool
    }

    fn chunk_hdr(&self, chunk: u64) -> (u64, u64) {
        match self.shadow_chunks.get(&chunk) {
            Some(hdr) => *hdr,
            None => (self.pool.read_u64(chunk), self.pool.read_u64(chunk + 8)),
        }
    }

    /// Allocate `size` bytes from the heap (rounded up to the allocation
    /// unit). Returns the data offset; the chunk header precedes it.
    pub fn alloc(&mut self, size: u64) -> OpResult<u64> {
        let unit = self.pool.alloc_unit;
        let need = size.max(1).div_ceil(unit) * unit;

        // first fit on the persistent free list
        let mut prev = 0u64;
        let mut cur = self.free_head;
        while cur != 0 {
            let (csize, cnext) = self.chunk_hdr(cur);
            if csize >= need {
                if prev == 0 {
                    self.free_head = cnext;
                } else {
                    self.write_u64(prev + 8, cnext)?;
                    self.shadow_chunks
                        .insert(prev, (self.chunk_hdr(prev).0, cnext));
                }
                self.write_u64(cur + 8, 0)?;
                self.shadow_chunks.insert(cur, (csize, 0));
                return Ok(cur + CHUNK_HDR);
            }
            prev = cur;
            cur = cnext;
        }

        // lazy heap growth
        let chunk = self.heap_next;
        let end = chunk
            .checked_add(CHUNK_HDR + need)
            .ok_or_else(|| OpError::new(StatusCode::AllocationError))?;
        if end > self.pool.len {
            return fail(StatusCode::AllocationError);
        }
        self.write_u64(chunk, need)?;
        self.write_u64(chunk + 8, 0)?;
        self.shadow_chunks.insert(chunk, (need, 0));
        self.heap_next = end;
        Ok(chunk + CHUNK_HDR)
    }

    /// Return a chunk (by its data offset) to the free list.
    pub fn free(&mut self, data_off: u64) -> OpResult<()> {
        let chunk = data_off - CHUNK_HDR;
        let (size, _) = self.chunk_hdr(chunk);
        debug_assert!(size > 0);
        self.write_u64(chunk + 8, self.free_head)?;
        self.shadow_chunks.insert(chunk, (size, self.free_head));
        self.free_head = chunk;
        Ok(())
    }

    fn commit(mut self) -> OpResult<()> {
        self.write_u64(OFF_HEAP_NEXT, self.heap_next)?;
        self.write_u64(OFF_FREE_HEAD, self.free_head)?;

        let pool = self.pool;
        let map = pool.map_mut();

        // stage the log
        let mut cur = OFF_LOG_DATA as usize;
        for (off, data) in &self.writes {
            map[cur..cur + 8].copy_from_slice(&off.to_le_bytes());
            map[cur + 8..cur + 16]
                .copy_from_slice(&(data.len() as u64).to_le_bytes());
            map[cur + 16..cur + 16 + data.len()].copy_from_slice(data);
            cur += 16 + data.len();
        }
        pool.put_u64(OFF_LOG_COUNT, self.writes.len() as u64);
        pool.flush_range(HDR_SIZE as usize, cur - HDR_SIZE as usize)?;

        // commit point
        pool.put_u64(OFF_LOG_COMMIT, 1);
        pool.flush_range(OFF_LOG_COMMIT as usize, 8)?;

        // apply home locations
        for (off, data) in &self.writes {
            let off = *off as usize;
            pool.map_mut()[off..off + data.len()].copy_from_slice(data);
            pool.flush_range(off, data.len())?;
        }

        pool.put_u64(OFF_LOG_COMMIT, 0);
        pool.flush_range(OFF_LOG_COMMIT as usize, 8)
    }
}
