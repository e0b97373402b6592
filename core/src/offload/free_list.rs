//!
//! Persistent free-list of device blocks, in allocation units.
//!
//! Lives in the pmem pool so that the transaction freeing a block and the
//! index mutation that stops referencing it commit together. Blocks that
//! have never been handed out are populated lazily from a cursor instead of
//! being enqueued up front; released blocks queue up FIFO and are preferred
//! over lazy population.
//!


use crate::common::{fail, OpResult, StatusCode, EINVAL, ENOSPC};
use crate::pmem::pool::{PmemPool, PmemTx, OFF_FREELIST_ROOT};
use std::sync::Arc;

// root layout
const F_HEAD: u64 = 0;
const F_TAIL: u64 = 8;
const F_MAX_LBA: u64 = 16;
const F_CURSOR: u64 = 24;
const F_INITED: u64 = 32;
const ROOT_SIZE: u64 = 40;

// node layout: [lba u64][next u64]
const NODE_SIZE: u64 = 16;

pub struct OffloadFreeList {
    pool: Arc<PmemPool>,
    root: u64,
}

impl OffloadFreeList {
    /// Attach to the list root in the pool, creating it on first open.
    pub fn open(pool: Arc<PmemPool>) -> OpResult<Self> {
        let mut root = pool.freelist_root();
        if root == 0 {
            root = pool.transaction(|tx| {
                let root = tx.alloc(ROOT_SIZE)?;
                tx.write(root, &[0u8; ROOT_SIZE as usize])?;
                tx.write_u64(OFF_FREELIST_ROOT, root)?;
                Ok(root)
            })?;
        }
        Ok(OffloadFreeList { pool, root })
    }

    /// Release an LBA, or initialize the list with `push(-1)`.
    pub fn push(&self, lba: i64) -> OpResult<()> {
        self.pool.transaction(|tx| self.push_tx(tx, lba))
    }

    /// `push` inside a caller-owned transaction.
    pub fn push_tx(&self, tx: &mut PmemTx, lba: i64) -> OpResult<()> {
        if lba < 0 {
            tx.write_u64(self.root + F_INITED, 1)?;
            tx.write_u64(self.root + F_CURSOR, 0)?;
            return Ok(());
        }
        let node = tx.alloc(NODE_SIZE)?;
        tx.write_u64(node, lba as u64)?;
        tx.write_u64(node + 8, 0)?;
        let tail = tx.read_u64(self.root + F_TAIL);
        if tail == 0 {
            tx.write_u64(self.root + F_HEAD, node)?;
        } else {
            tx.write_u64(tail + 8, node)?;
        }
        tx.write_u64(self.root + F_TAIL, node)
    }

    /// Take a free LBA.
    pub fn get(&self) -> OpResult<i64> {
        self.pool.transaction(|tx| self.get_tx(tx))
    }

    pub fn get_tx(&self, tx: &mut PmemTx) -> OpResult<i64> {
        let max_lba = tx.read_u64(self.root + F_MAX_LBA);
        if tx.read_u64(self.root + F_INITED) == 0 || max_lba == 0 {
            // the list was never initialized: programmer error
            return fail(StatusCode::Errno(EINVAL));
        }

        let head = tx.read_u64(self.root + F_HEAD);
        if head != 0 {
            let lba = tx.read_u64(head);
            let next = tx.read_u64(head + 8);
            tx.write_u64(self.root + F_HEAD, next)?;
            if next == 0 {
                tx.write_u64(self.root + F_TAIL, 0)?;
            }
            tx.free(head)?;
            return Ok(lba as i64);
        }

        let cursor = tx.read_u64(self.root + F_CURSOR);
        if cursor < max_lba {
            tx.write_u64(self.root + F_CURSOR, cursor + 1)?;
            return Ok(((cursor + 1) % max_lba) as i64);
        }

        // every block handed out and none released
        fail(StatusCode::Errno(ENOSPC))
    }

    /// Device capacity in allocation units. Set once after open; grows only.
    pub fn set_max_lba(&self, max: u64) -> OpResult<()> {
        self.pool
            .transaction(|tx| tx.write_u64(self.root + F_MAX_LBA, max))
    }

    pub fn max_lba(&self) -> u64 {
        self.pool.read_u64(self.root + F_MAX_LBA)
    }

    pub fn is_initialized(&self) -> bool {
        self.pool.read_u64(self.root + F_INITED) == 1
    }

    /// Drop every queued node and reset the lazy cursor. Test scaffolding.
    pub fn clear(&self) -> OpResult<()> {
        self.pool.transaction(|tx| {
            let mut head = tx.read_u64(self.root + F_HEAD);
            while head != 0 {
                let next = tx.read_u64(head + 8);
                tx.free(head)?;
                head = next;
            }
            tx.write_u64(self.root + F_HEAD, 0)?;
            tx.write_u64(self.root + F_TAIL, 0)?;
            tx.write_u64(self.root + F_CURSOR, 0)?;
            tx.write_u64(self.root + F_INITED, 0)?;
            tx.write_u64(self.root + F_MAX_LBA, 0)
        })
    }
}
