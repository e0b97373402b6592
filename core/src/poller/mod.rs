//!
//! # Pollers
//!
//! A poller owns a bounded lock-free ring of pending work and drains it in
//! batches on a dedicated, CPU-pinned thread. Producers only ever enqueue;
//! a full ring is back-pressure (`QueueFullError`), never blocking.
//!

pub mod pmem;

#[cfg(test)]
mod test;

use crossbeam_queue::ArrayQueue;
use log::{debug, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Requests taken off the ring per tick.
pub const DEQUEUE_LIMIT: usize = 1024;

/// Idle back-off between empty ticks.
const IDLE_SPIN: Duration = Duration::from_micros(50);

pub trait Poller: Send + Sync {
    type Rqst: Send;

    fn ring(&self) -> &ArrayQueue<Box<Self::Rqst>>;

    /// Handle one batch. Must not panic; failures are reported through the
    /// request callbacks.
    fn process(&self, batch: &mut Vec<Box<Self::Rqst>>);

    /// A full ring hands the request back so the caller can fail it.
    fn enqueue(&self, rqst: Box<Self::Rqst>) -> Result<(), Box<Self::Rqst>> {
        self.ring().push(rqst)
    }

    fn dequeue(&self, out: &mut Vec<Box<Self::Rqst>>) {
        while out.len() < DEQUEUE_LIMIT {
            match self.ring().pop() {
                Some(r) => out.push(r),
                None => break,
            }
        }
    }
}

/// Run a poller until `keep_running` clears, then drain once more and exit.
pub fn spawn<P>(
    name: &str,
    poller: Arc<P>,
    keep_running: Arc<AtomicBool>,
    core: Option<usize>,
) -> std::io::Result<JoinHandle<()>>
where
    P: Poller + 'static,
{
    let thread_name = name.to_owned();
    thread::Builder::new().name(thread_name.clone()).spawn(move || {
        pin_to_core(&thread_name, core);
        let mut batch = Vec::with_capacity(DEQUEUE_LIMIT);
        while keep_running.load(Ordering::Acquire) {
            poller.dequeue(&mut batch);
            if batch.is_empty() {
                thread::sleep(IDLE_SPIN);
                continue;
            }
            poller.process(&mut batch);
            batch.clear();
        }
        // final drain so enqueued-but-unserved requests still complete
        poller.dequeue(&mut batch);
        if !batch.is_empty() {
            poller.process(&mut batch);
        }
        debug!("poller {} stopped", thread_name);
    })
}

fn pin_to_core(name: &str, core: Option<usize>) {
    let Some(core) = core else { return };
    match core_affinity::get_core_ids() {
        Some(ids) if !ids.is_empty() => {
            let id = ids[core % ids.len()];
            if core_affinity::set_for_current(id) {
                debug!("poller {} pinned to core {:?}", name, id);
            } else {
                warn!("poller {} failed to pin to core {:?}", name, id);
            }
        }
        _ => warn!("poller {}: no cores visible for pinning", name),
    }
}
