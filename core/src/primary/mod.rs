//!
//! Ready queue of primary keys.
//!
//! Producers push the primary-field bytes of every locally-stored key;
//! consumers pop one and get back a full-size key buffer, zero-filled
//! except for the primary field. Keys homed on other nodes are silently
//! skipped; their home node queues them.
//!

#[cfg(test)]
mod test;

use crate::common::{
    fail, masked_hash, primary_field_value, KeyDescriptor, OpResult, RawBytes,
    StatusCode,
};
use crossbeam_queue::ArrayQueue;
use log::info;

pub struct PrimaryKeyQueue {
    ring: ArrayQueue<RawBytes>,
    key_size: usize,
    pkey_size: usize,
    pkey_offset: usize,
    local_id: u64,
    mask_len: u32,
    mask_off: u32,
}

impl PrimaryKeyQueue {
    pub fn new(
        desc: &KeyDescriptor,
        max_ready_keys: usize,
        local_id: u64,
        mask_len: u32,
        mask_off: u32,
    ) -> OpResult<Self> {
        if max_ready_keys == 0 {
            return fail(StatusCode::AllocationError);
        }
        info!("ready-key queue of {} primary keys", max_ready_keys);
        Ok(PrimaryKeyQueue {
            ring: ArrayQueue::new(max_ready_keys),
            key_size: desc.key_size(),
            pkey_size: desc.primary_size(),
            pkey_offset: desc.primary_offset(),
            local_id,
            mask_len,
            mask_off,
        })
    }

    pub fn is_local(&self, key: &[u8]) -> bool {
        let pkey = &key[self.pkey_offset..self.pkey_offset + self.pkey_size];
        masked_hash(primary_field_value(pkey), self.mask_len, self.mask_off)
            == self.local_id
    }

    /// Queue the primary field of a locally-stored key; non-local keys are
    /// a no-op.
    pub fn enqueue_next(&self, key: &[u8]) -> OpResult<()> {
        if !self.is_local(key) {
            return Ok(());
        }
        let pkey =
            key[self.pkey_offset..self.pkey_offset + self.pkey_size].to_vec();
        self.ring
            .push(pkey)
            .map_err(|_| StatusCode::QueueFullError.into())
    }

    /// Pop one ready key, reconstructed to full size with every non-primary
    /// byte zeroed.
    pub fn dequeue_next(&self) -> OpResult<RawBytes> {
        match self.ring.pop() {
            Some(pkey) => {
                let mut key = vec![0u8; self.key_size];
                key[self.pkey_offset..self.pkey_offset + self.pkey_size]
                    .copy_from_slice(&pkey);
                Ok(key)
            }
            None => fail(StatusCode::KeyNotFound),
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
