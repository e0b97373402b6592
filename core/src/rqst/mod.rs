//!
//! Pool-allocated request records carried through the poller rings.
//!

use crate::common::{RawBytes, StatusCode};
use crossbeam_queue::SegQueue;
use once_cell::sync::Lazy;

/// Per-operation pool capacity (recycled boxes kept around, not a hard cap).
const POOL_CAPACITY: usize = 4096;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RqstOperation {
    Put,
    Get,
    Remove,
    Update,
}

/// Completion callback: `(status, key, value)`. Invoked exactly once, on the
/// poller thread that finished the request.
pub type KvCallback = Box<dyn FnOnce(StatusCode, &[u8], &[u8]) + Send>;

pub struct Rqst {
    pub op: RqstOperation,
    pub key: RawBytes,
    pub value: RawBytes,
    pub cb: Option<KvCallback>,
    /// Pool reservation carried from `Store::alloc` into the put path.
    pub reserved: Option<u64>,
}

impl Rqst {
    /// Fire the callback, if any. Safe to call once per request lifetime;
    /// the request keeps its key/value so the callback can borrow them.
    pub fn complete(&mut self, status: StatusCode, value: &[u8]) {
        if let Some(cb) = self.cb.take() {
            cb(status, &self.key, value);
        }
    }
}

/// Recycled request boxes, one free list per operation so concurrent
/// producers of different operations never contend on the same queue.
pub struct RqstPool {
    put: SegQueue<Box<Rqst>>,
    get: SegQueue<Box<Rqst>>,
    remove: SegQueue<Box<Rqst>>,
    update: SegQueue<Box<Rqst>>,
}

pub static RQST_POOL: Lazy<RqstPool> = Lazy::new(RqstPool::new);

impl RqstPool {
    fn new() -> Self {
        RqstPool {
            put: SegQueue::new(),
            get: SegQueue::new(),
            remove: SegQueue::new(),
            update: SegQueue::new(),
        }
    }

    fn shelf(&self, op: RqstOperation) -> &SegQueue<Box<Rqst>> {
        match op {
            RqstOperation::Put => &self.put,
            RqstOperation::Get => &self.get,
            RqstOperation::Remove => &self.remove,
            RqstOperation::Update => &self.update,
        }
    }

    pub fn take(
        &self,
        op: RqstOperation,
        key: RawBytes,
        value: RawBytes,
        cb: Option<KvCallback>,
    ) -> Box<Rqst> {
        match self.shelf(op).pop() {
            Some(mut r) => {
                r.op = op;
                r.key = key;
                r.value = value;
                r.cb = cb;
                r.reserved = None;
                r
            }
            None => Box::new(Rqst {
                op,
                key,
                value,
                cb,
                reserved: None,
            }),
        }
    }

    /// Return a finished request. An unfired callback is dropped here, which
    /// only happens on the drop-when-not-ready finalize path.
    pub fn put_back(&self, mut rqst: Box<Rqst>) {
        let shelf = self.shelf(rqst.op);
        if shelf.len() >= POOL_CAPACITY {
            return;
        }
        rqst.key.clear();
        rqst.value.clear();
        rqst.cb = None;
        rqst.reserved = None;
        shelf.push(rqst);
    }
}
