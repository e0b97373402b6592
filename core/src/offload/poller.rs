//!
//! The offload poller: single consumer of the offload request ring.
//!
//! Each tick it turns up to a batch of requests into block I/O and hands
//! the completions to the finalize poller. Requests for the same key from
//! the same thread serialize here by construction; nothing is promised
//! across keys or threads.
//!

use crate::common::{OpResult, StatusCode};
use crate::offload::{
    bdev::{BlockDevice, IoBufPool},
    finalize::FinalizePoller,
    free_list::OffloadFreeList,
    DeviceTask,
};
use crate::pmem::index::{PmemIndex, ValLocation};
use crate::poller::Poller;
use crate::rqst::{Rqst, RqstOperation, RQST_POOL};
use crossbeam_queue::ArrayQueue;
use log::warn;
use std::sync::Arc;

pub struct OffloadPoller {
    ring: ArrayQueue<Box<Rqst>>,
    index: Arc<PmemIndex>,
    free_list: Arc<OffloadFreeList>,
    bdev: Arc<dyn BlockDevice>,
    finalize: Arc<FinalizePoller>,
    read_bufs: Arc<IoBufPool>,
    write_bufs: Arc<IoBufPool>,
    alloc_unit: u64,
}

impl OffloadPoller {
    pub fn new(
        queue_depth: usize,
        index: Arc<PmemIndex>,
        free_list: Arc<OffloadFreeList>,
        bdev: Arc<dyn BlockDevice>,
        finalize: Arc<FinalizePoller>,
        read_bufs: Arc<IoBufPool>,
        write_bufs: Arc<IoBufPool>,
        alloc_unit: u64,
    ) -> OpResult<Self> {
        if alloc_unit == 0 || alloc_unit % bdev.block_size() != 0 {
            // offload allocation unit must be whole device blocks
            return Err(StatusCode::NotSupported.into());
        }
        Ok(OffloadPoller {
            ring: ArrayQueue::new(queue_depth),
            index,
            free_list,
            bdev,
            finalize,
            read_bufs,
            write_bufs,
            alloc_unit,
        })
    }

    /// Device capacity in allocation units.
    pub fn lba_count(&self) -> u64 {
        self.bdev.block_count() * self.bdev.block_size() / self.alloc_unit
    }

    #[inline(always)]
    fn unit_to_block(&self, unit_lba: u64) -> u64 {
        unit_lba * (self.alloc_unit / self.bdev.block_size())
    }

    #[inline(always)]
    fn io_len(&self, val_len: u64) -> usize {
        let bs = self.bdev.block_size();
        (val_len.max(1).div_ceil(bs) * bs) as usize
    }

    fn forward(&self, task: DeviceTask) {
        if let Err(mut task) = self.finalize.enqueue(Box::new(task)) {
            // completion ring saturated; fail the request in place
            warn!("finalize ring full, failing request in place");
            task.rqst.complete(StatusCode::QueueFullError, &[]);
            if let Some(buf) = task.buf.take() {
                match task.rqst.op {
                    RqstOperation::Get => self.read_bufs.put_back(buf),
                    _ => self.write_bufs.put_back(buf),
                }
            }
            RQST_POOL.put_back(task.rqst);
        }
    }

    fn finish(&self, mut rqst: Box<Rqst>, status: StatusCode) {
        rqst.complete(status, &[]);
        RQST_POOL.put_back(rqst);
    }

    fn process_get(&self, rqst: Box<Rqst>) {
        let ctx = match self.index.get(&rqst.key) {
            Ok(ctx) if ctx.location == ValLocation::Disk => ctx,
            Ok(_) => return self.finish(rqst, StatusCode::UnknownError),
            Err(e) => return self.finish(rqst, e.status),
        };
        let (_, unit_lba) = self.index.read_device_addr(&ctx);
        let Some(mut buf) = self.read_bufs.take() else {
            return self.finish(rqst, StatusCode::QueueFullError);
        };
        let len = self.io_len(ctx.size);
        let result = self
            .bdev
            .read(self.unit_to_block(unit_lba), &mut buf[..len])
            .is_ok();
        self.forward(DeviceTask {
            rqst,
            buf: Some(buf),
            lba: unit_lba,
            result,
            update_index: false,
            val_len: ctx.size,
        });
    }

    fn process_update(&self, mut rqst: Box<Rqst>) {
        let ctx = match self.index.get(&rqst.key) {
            Ok(ctx) => ctx,
            Err(e) => return self.finish(rqst, e.status),
        };

        let (unit_lba, update_index, payload) = match ctx.location {
            ValLocation::Pmem => {
                // promotion: move the pmem-resident bytes (or the provided
                // replacement) out to a fresh block
                let payload = if rqst.value.is_empty() {
                    self.index.read_value(&ctx)
                } else {
                    std::mem::take(&mut rqst.value)
                };
                let lba = match self.free_list.get() {
                    Ok(lba) => lba as u64,
                    Err(_) => {
                        return self.finish(rqst, StatusCode::AllocationError)
                    }
                };
                (lba, true, payload)
            }
            ValLocation::Disk => {
                if rqst.value.is_empty() {
                    // nothing to rewrite; already offloaded
                    return self.finish(rqst, StatusCode::Ok);
                }
                let (_, lba) = self.index.read_device_addr(&ctx);
                (lba, false, std::mem::take(&mut rqst.value))
            }
        };

        if payload.len() as u64 > self.alloc_unit {
            // a value must fit its allocation-unit extent
            if update_index {
                let _ = self.free_list.push(unit_lba as i64);
            }
            return self.finish(rqst, StatusCode::AllocationError);
        }

        let Some(mut buf) = self.write_bufs.take() else {
            if update_index {
                let _ = self.free_list.push(unit_lba as i64);
            }
            return self.finish(rqst, StatusCode::QueueFullError);
        };
        let len = self.io_len(payload.len() as u64);
        buf[..payload.len()].copy_from_slice(&payload);
        buf[payload.len()..len].fill(0);
        let result = self
            .bdev
            .write(self.unit_to_block(unit_lba), &buf[..len])
            .is_ok();
        self.forward(DeviceTask {
            rqst,
            buf: Some(buf),
            lba: unit_lba,
            result,
            update_index,
            val_len: payload.len() as u64,
        });
    }

    fn process_remove(&self, rqst: Box<Rqst>) {
        match self.index.get(&rqst.key) {
            Ok(ctx) if ctx.location == ValLocation::Disk => {}
            Ok(_) => return self.finish(rqst, StatusCode::UnknownError),
            Err(e) => return self.finish(rqst, e.status),
        }
        // free-list push and index unlink commit together
        let result = self
            .index
            .remove_offloaded(&rqst.key, &self.free_list)
            .is_ok();
        self.forward(DeviceTask {
            rqst,
            buf: None,
            lba: 0,
            result,
            update_index: false,
            val_len: 0,
        });
    }
}

impl Poller for OffloadPoller {
    type Rqst = Rqst;

    fn ring(&self) -> &ArrayQueue<Box<Rqst>> {
        &self.ring
    }

    fn process(&self, batch: &mut Vec<Box<Rqst>>) {
        for rqst in batch.drain(..) {
            match rqst.op {
                RqstOperation::Get => self.process_get(rqst),
                RqstOperation::Update => self.process_update(rqst),
                RqstOperation::Remove => self.process_remove(rqst),
                RqstOperation::Put => {
                    self.finish(rqst, StatusCode::NotSupported)
                }
            }
        }
    }
}
