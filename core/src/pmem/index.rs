//!
//! The pmem index: full key bytes mapped to a value allocation (or, once a
//! value has been offloaded, to a device-address record).
//!
//! Entries live in the pool as a doubly-linked list hanging off the pool
//! header; a process keeps an in-memory map from key bytes to entry offset,
//! rebuilt by walking that list on open. Every mutation commits the pointer
//! and the location tag in one transaction, so readers never observe a
//! `Disk` tag pointing at pmem bytes or vice versa.
//!

#[cfg(test)]
mod test;

use crate::common::{fail, OpResult, RawBytes, StatusCode};
use crate::offload::free_list::OffloadFreeList;
use crate::pmem::pool::{PmemPool, PmemTx, OFF_INDEX_HEAD};
use log::debug;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

// entry layout, offsets relative to the entry base
const E_KEY_LEN: u64 = 0;
const E_VAL_OFF: u64 = 8;
const E_VAL_LEN: u64 = 16;
const E_LOC: u64 = 24;
const E_NEXT: u64 = 32;
const E_PREV: u64 = 40;
const E_KEY: u64 = 48;

/// Size of a persisted device-address record `(bus_addr, lba)`.
pub const DEVICE_ADDR_SIZE: u64 = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValLocation {
    Pmem,
    Disk,
}

impl ValLocation {
    fn to_u64(self) -> u64 {
        match self {
            ValLocation::Pmem => 0,
            ValLocation::Disk => 1,
        }
    }

    fn from_u64(v: u64) -> Self {
        if v == 1 {
            ValLocation::Disk
        } else {
            ValLocation::Pmem
        }
    }
}

/// Where a key's value currently lives.
#[derive(Clone, Copy, Debug)]
pub struct ValCtx {
    /// Pool offset of the value bytes (`Pmem`) or of the device-address
    /// record (`Disk`).
    pub off: u64,
    /// Length of the value in bytes, wherever it lives.
    pub size: u64,
    pub location: ValLocation,
}

pub struct PmemIndex {
    pool: Arc<PmemPool>,
    map: RwLock<HashMap<RawBytes, u64>>,
}

impl PmemIndex {
    /// Attach to the pool and rebuild the in-memory key map from the
    /// persistent entry list.
    pub fn open(pool: Arc<PmemPool>) -> Self {
        let mut map = HashMap::new();
        let mut cur = pool.index_head();
        while cur != 0 {
            let key_len = pool.read_u64(cur + E_KEY_LEN) as usize;
            let key = pool.read(cur + E_KEY, key_len).to_vec();
            map.insert(key, cur);
            cur = pool.read_u64(cur + E_NEXT);
        }
        debug!("pmem index attached, {} entries recovered", map.len());
        PmemIndex {
            pool,
            map: RwLock::new(map),
        }
    }

    #[inline(always)]
    pub fn pool(&self) -> &Arc<PmemPool> {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.map.read().contains_key(key)
    }

    fn entry_ctx(&self, entry: u64) -> ValCtx {
        ValCtx {
            off: self.pool.read_u64(entry + E_VAL_OFF),
            size: self.pool.read_u64(entry + E_VAL_LEN),
            location: ValLocation::from_u64(self.pool.read_u64(entry + E_LOC)),
        }
    }

    pub fn get(&self, key: &[u8]) -> OpResult<ValCtx> {
        let map = self.map.read();
        match map.get(key) {
            Some(&entry) => Ok(self.entry_ctx(entry)),
            None => fail(StatusCode::KeyNotFound),
        }
    }

    /// Copy a pmem-resident value out of the pool.
    pub fn read_value(&self, ctx: &ValCtx) -> RawBytes {
        debug_assert_eq!(ctx.location, ValLocation::Pmem);
        self.pool.read(ctx.off, ctx.size as usize).to_vec()
    }

    /// Decode the device-address record of an offloaded value.
    pub fn read_device_addr(&self, ctx: &ValCtx) -> (u64, u64) {
        debug_assert_eq!(ctx.location, ValLocation::Disk);
        let bus = self.pool.read_u64(ctx.off);
        let lba = self.pool.read_u64(ctx.off + 8);
        (bus, lba)
    }

    /// Insert or overwrite a pmem-resident value. `reserved` is a pool
    /// offset obtained from `alloc_value_for_key`, already sized for the
    /// value; without one the value allocation happens here.
    pub fn put(
        &self,
        key: &[u8],
        value: &[u8],
        reserved: Option<u64>,
    ) -> OpResult<()> {
        let mut map = self.map.write();
        let existing = map.get(key).copied();

        if let Some(entry) = existing {
            let ctx = self.entry_ctx(entry);
            if ctx.location == ValLocation::Disk {
                // overwriting an offloaded value is the Update path;
                // silently dropping its blocks here would strand them
                return fail(StatusCode::NotSupported);
            }
            self.pool.transaction(|tx| {
                let val_off = match reserved {
                    Some(off) => off,
                    None => tx.alloc(value.len() as u64)?,
                };
                tx.write(val_off, value)?;
                tx.free(ctx.off)?;
                tx.write_u64(entry + E_VAL_OFF, val_off)?;
                tx.write_u64(entry + E_VAL_LEN, value.len() as u64)?;
                tx.write_u64(entry + E_LOC, ValLocation::Pmem.to_u64())
            })?;
            return Ok(());
        }

        let entry = self.pool.transaction(|tx| {
            let val_off = match reserved {
                Some(off) => off,
                None => tx.alloc(value.len() as u64)?,
            };
            tx.write(val_off, value)?;

            let entry = tx.alloc(E_KEY + key.len() as u64)?;
            tx.write_u64(entry + E_KEY_LEN, key.len() as u64)?;
            tx.write_u64(entry + E_VAL_OFF, val_off)?;
            tx.write_u64(entry + E_VAL_LEN, value.len() as u64)?;
            tx.write_u64(entry + E_LOC, ValLocation::Pmem.to_u64())?;
            tx.write(entry + E_KEY, key)?;

            let head = tx.read_u64(OFF_INDEX_HEAD);
            tx.write_u64(entry + E_NEXT, head)?;
            tx.write_u64(entry + E_PREV, 0)?;
            if head != 0 {
                tx.write_u64(head + E_PREV, entry)?;
            }
            tx.write_u64(OFF_INDEX_HEAD, entry)?;
            Ok(entry)
        })?;
        map.insert(key.to_vec(), entry);
        Ok(())
    }

    /// Reserve pool space for a value that will be `put` for this key.
    pub fn alloc_value_for_key(&self, _key: &[u8], size: u64) -> OpResult<u64> {
        self.pool.transaction(|tx| tx.alloc(size))
    }

    /// Release an unused reservation.
    pub fn free_reserved(&self, off: u64) -> OpResult<()> {
        self.pool.transaction(|tx| tx.free(off))
    }

    /// Persist a device-address record for `key`. Returns its pool offset.
    pub fn allocate_iov_for_key(
        &self,
        _key: &[u8],
        bus_addr: u64,
        lba: u64,
    ) -> OpResult<u64> {
        self.pool.transaction(|tx| {
            let slot = tx.alloc(DEVICE_ADDR_SIZE)?;
            tx.write_u64(slot, bus_addr)?;
            tx.write_u64(slot + 8, lba)?;
            Ok(slot)
        })
    }

    /// Swing a key's value pointer onto a device-address record, freeing
    /// the pmem-resident bytes it supersedes. Pointer and location tag
    /// change in one transaction.
    pub fn update_value_wrapper(
        &self,
        key: &[u8],
        slot_off: u64,
        val_len: u64,
    ) -> OpResult<()> {
        let map = self.map.read();
        let entry = *map.get(key).ok_or(StatusCode::KeyNotFound)?;
        let ctx = self.entry_ctx(entry);
        self.pool.transaction(|tx| {
            if ctx.location == ValLocation::Pmem {
                tx.free(ctx.off)?;
            }
            tx.write_u64(entry + E_VAL_OFF, slot_off)?;
            tx.write_u64(entry + E_VAL_LEN, val_len)?;
            tx.write_u64(entry + E_LOC, ValLocation::Disk.to_u64())
        })
    }

    /// Refresh the recorded value length after an in-place device
    /// overwrite.
    pub fn update_value_len(&self, key: &[u8], val_len: u64) -> OpResult<()> {
        let map = self.map.read();
        let entry = *map.get(key).ok_or(StatusCode::KeyNotFound)?;
        self.pool
            .transaction(|tx| tx.write_u64(entry + E_VAL_LEN, val_len))
    }

    /// Remove a pmem-resident key: value allocation and index entry go in
    /// one transaction.
    pub fn remove(&self, key: &[u8]) -> OpResult<()> {
        let mut map = self.map.write();
        let entry = *map.get(key).ok_or(StatusCode::KeyNotFound)?;
        let ctx = self.entry_ctx(entry);
        if ctx.location == ValLocation::Disk {
            return fail(StatusCode::NotSupported);
        }
        self.pool.transaction(|tx| {
            tx.free(ctx.off)?;
            Self::unlink(tx, entry)
        })?;
        map.remove(key);
        Ok(())
    }

    /// Remove an offloaded key: the freed LBA goes back to the free-list in
    /// the same transaction that drops the entry, so a crash in between can
    /// neither lose nor double-free the block. Returns the recycled LBA.
    pub fn remove_offloaded(
        &self,
        key: &[u8],
        free_list: &OffloadFreeList,
    ) -> OpResult<u64> {
        let mut map = self.map.write();
        let entry = *map.get(key).ok_or(StatusCode::KeyNotFound)?;
        let ctx = self.entry_ctx(entry);
        if ctx.location != ValLocation::Disk {
            return fail(StatusCode::NotSupported);
        }
        let lba = self.pool.read_u64(ctx.off + 8);
        self.pool.transaction(|tx| {
            free_list.push_tx(tx, lba as i64)?;
            tx.free(ctx.off)?;
            Self::unlink(tx, entry)
        })?;
        map.remove(key);
        Ok(lba)
    }

    fn unlink(tx: &mut PmemTx, entry: u64) -> OpResult<()> {
        let next = tx.read_u64(entry + E_NEXT);
        let prev = tx.read_u64(entry + E_PREV);
        if prev == 0 {
            tx.write_u64(OFF_INDEX_HEAD, next)?;
        } else {
            tx.write_u64(prev + E_NEXT, next)?;
        }
        if next != 0 {
            tx.write_u64(next + E_PREV, prev)?;
        }
        tx.free(entry)
    }
}
