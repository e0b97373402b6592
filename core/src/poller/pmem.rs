//!
//! Pmem request pollers: same ring discipline as the offload poller but the
//! work is index operations performed inline. Several run in parallel; the
//! façade spreads requests round-robin or by explicit poller id.
//!

use crate::common::StatusCode;
use crate::offload::poller::OffloadPoller;
use crate::pmem::index::{PmemIndex, ValLocation};
use crate::poller::Poller;
use crate::primary::PrimaryKeyQueue;
use crate::rqst::{Rqst, RqstOperation, RQST_POOL};
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

pub struct PmemPoller {
    ring: ArrayQueue<Box<Rqst>>,
    index: Arc<PmemIndex>,
    ready_keys: Option<Arc<PrimaryKeyQueue>>,
    offload: Option<Arc<OffloadPoller>>,
}

impl PmemPoller {
    pub fn new(
        queue_depth: usize,
        index: Arc<PmemIndex>,
        ready_keys: Option<Arc<PrimaryKeyQueue>>,
        offload: Option<Arc<OffloadPoller>>,
    ) -> Self {
        PmemPoller {
            ring: ArrayQueue::new(queue_depth),
            index,
            ready_keys,
            offload,
        }
    }

    fn finish(&self, mut rqst: Box<Rqst>, status: StatusCode, value: &[u8]) {
        rqst.complete(status, value);
        RQST_POOL.put_back(rqst);
    }

    /// Re-route a request whose value lives on the device.
    fn divert_to_offload(&self, rqst: Box<Rqst>) {
        match &self.offload {
            Some(offload) => {
                if let Err(rqst) = offload.enqueue(rqst) {
                    self.finish(rqst, StatusCode::QueueFullError, &[]);
                }
            }
            None => self.finish(rqst, StatusCode::OffloadDisabledError, &[]),
        }
    }

    fn process_put(&self, mut rqst: Box<Rqst>) {
        let reserved = rqst.reserved.take();
        match self.index.put(&rqst.key, &rqst.value, reserved) {
            Ok(()) => {}
            Err(e) => return self.finish(rqst, e.status, &[]),
        }
        if let Some(ready) = &self.ready_keys {
            if let Err(e) = ready.enqueue_next(&rqst.key) {
                // a key nobody can consume must not stay stored
                let _ = self.index.remove(&rqst.key);
                return self.finish(rqst, e.status, &[]);
            }
        }
        let value = std::mem::take(&mut rqst.value);
        self.finish(rqst, StatusCode::Ok, &value);
    }

    fn process_get(&self, rqst: Box<Rqst>) {
        match self.index.get(&rqst.key) {
            Ok(ctx) if ctx.location == ValLocation::Pmem => {
                let value = self.index.read_value(&ctx);
                self.finish(rqst, StatusCode::Ok, &value);
            }
            Ok(_) => self.divert_to_offload(rqst),
            Err(e) => self.finish(rqst, e.status, &[]),
        }
    }

    fn process_remove(&self, rqst: Box<Rqst>) {
        match self.index.get(&rqst.key) {
            Ok(ctx) if ctx.location == ValLocation::Pmem => {
                match self.index.remove(&rqst.key) {
                    Ok(()) => self.finish(rqst, StatusCode::Ok, &[]),
                    Err(e) => self.finish(rqst, e.status, &[]),
                }
            }
            Ok(_) => self.divert_to_offload(rqst),
            Err(e) => self.finish(rqst, e.status, &[]),
        }
    }
}

impl Poller for PmemPoller {
    type Rqst = Rqst;

    fn ring(&self) -> &ArrayQueue<Box<Rqst>> {
        &self.ring
    }

    fn process(&self, batch: &mut Vec<Box<Rqst>>) {
        for rqst in batch.drain(..) {
            match rqst.op {
                RqstOperation::Put => self.process_put(rqst),
                RqstOperation::Get => self.process_get(rqst),
                RqstOperation::Remove => self.process_remove(rqst),
                // updates carry attributes that route them at the façade
                RqstOperation::Update => {
                    self.finish(rqst, StatusCode::NotImplemented, &[])
                }
            }
        }
    }
}
