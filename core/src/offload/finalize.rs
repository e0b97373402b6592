//!
//! The finalize poller: post-I/O stage of the offload tier.
//!
//! Applies the index mutations a completed device operation implies, fires
//! the user callback exactly once, and returns buffers and request records
//! to their pools. When the poller is not ready (shutdown in progress) it
//! drops incoming tasks but still recycles their resources.
//!

use crate::common::StatusCode;
use crate::offload::{
    bdev::IoBufPool,
    free_list::OffloadFreeList,
    DeviceTask,
};
use crate::pmem::index::PmemIndex;
use crate::poller::Poller;
use crate::rqst::{RqstOperation, RQST_POOL};
use crossbeam_queue::ArrayQueue;
use log::warn;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

pub struct FinalizePoller {
    ring: ArrayQueue<Box<DeviceTask>>,
    index: Arc<PmemIndex>,
    free_list: Arc<OffloadFreeList>,
    read_bufs: Arc<IoBufPool>,
    write_bufs: Arc<IoBufPool>,
    bus_addr: u64,
    ready: AtomicBool,
}

impl FinalizePoller {
    pub fn new(
        queue_depth: usize,
        index: Arc<PmemIndex>,
        free_list: Arc<OffloadFreeList>,
        read_bufs: Arc<IoBufPool>,
        write_bufs: Arc<IoBufPool>,
        bus_addr: u64,
    ) -> Self {
        FinalizePoller {
            ring: ArrayQueue::new(queue_depth),
            index,
            free_list,
            read_bufs,
            write_bufs,
            bus_addr,
            ready: AtomicBool::new(true),
        }
    }

    /// Stop accepting work; queued tasks are recycled without effect.
    pub fn quiesce(&self) {
        self.ready.store(false, Ordering::Release);
    }

    fn drop_task(&self, mut task: Box<DeviceTask>) {
        if let Some(buf) = task.buf.take() {
            match task.rqst.op {
                RqstOperation::Get => self.read_bufs.put_back(buf),
                _ => self.write_bufs.put_back(buf),
            }
        }
        RQST_POOL.put_back(task.rqst);
    }

    fn process_get(&self, mut task: Box<DeviceTask>) {
        let buf = task.buf.take();
        if task.result {
            let payload = buf.as_deref().unwrap_or(&[]);
            let len = (task.val_len as usize).min(payload.len());
            task.rqst.complete(StatusCode::Ok, &payload[..len]);
        } else {
            task.rqst.complete(StatusCode::UnknownError, &[]);
        }
        if let Some(buf) = buf {
            self.read_bufs.put_back(buf);
        }
        RQST_POOL.put_back(task.rqst);
    }

    fn process_update(&self, mut task: Box<DeviceTask>) {
        let buf = task.buf.take();

        if !task.result {
            if task.update_index {
                // the write never landed; recycle the block
                if let Err(e) = self.free_list.push(task.lba as i64) {
                    warn!("failed to return lba {}: {:?}", task.lba, e.status);
                }
            }
            task.rqst.complete(StatusCode::UnknownError, &[]);
        } else if task.update_index {
            let installed = self
                .index
                .allocate_iov_for_key(&task.rqst.key, self.bus_addr, task.lba)
                .and_then(|slot| {
                    self.index.update_value_wrapper(
                        &task.rqst.key,
                        slot,
                        task.val_len,
                    )
                });
            match installed {
                Ok(()) => task.rqst.complete(StatusCode::Ok, &[]),
                Err(e) => {
                    if let Err(e) = self.free_list.push(task.lba as i64) {
                        warn!(
                            "failed to return lba {}: {:?}",
                            task.lba, e.status
                        );
                    }
                    task.rqst.complete(e.status, &[]);
                }
            }
        } else {
            // in-place overwrite of an already-offloaded value
            if let Err(e) = self.index.update_value_len(&task.rqst.key, task.val_len) {
                task.rqst.complete(e.status, &[]);
            } else {
                task.rqst.complete(StatusCode::Ok, &[]);
            }
        }

        if let Some(buf) = buf {
            self.write_bufs.put_back(buf);
        }
        RQST_POOL.put_back(task.rqst);
    }

    fn process_remove(&self, mut task: Box<DeviceTask>) {
        // the index and free-list already changed, atomically, on the
        // offload poller; only the completion remains
        let status = if task.result {
            StatusCode::Ok
        } else {
            StatusCode::UnknownError
        };
        task.rqst.complete(status, &[]);
        RQST_POOL.put_back(task.rqst);
    }
}

impl Poller for FinalizePoller {
    type Rqst = DeviceTask;

    fn ring(&self) -> &ArrayQueue<Box<DeviceTask>> {
        &self.ring
    }

    fn process(&self, batch: &mut Vec<Box<DeviceTask>>) {
        let ready = self.ready.load(Ordering::Acquire);
        for task in batch.drain(..) {
            if !ready {
                self.drop_task(task);
                continue;
            }
            match task.rqst.op {
                RqstOperation::Get => self.process_get(task),
                RqstOperation::Update => self.process_update(task),
                RqstOperation::Remove => self.process_remove(task),
                RqstOperation::Put => self.drop_task(task),
            }
        }
    }
}
