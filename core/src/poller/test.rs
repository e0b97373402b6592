use super::pmem::PmemPoller;
use super::*;
use crate::common::{KeyDescriptor, KeyField, StatusCode, MB};
use crate::pmem::index::PmemIndex;
use crate::pmem::pool::PmemPool;
use crate::primary::PrimaryKeyQueue;
use crate::rqst::{Rqst, RqstOperation, RQST_POOL};
use ruc::*;
use std::sync::mpsc;
use std::time::Duration;

fn fresh_index() -> Arc<PmemIndex> {
    let dir = format!("/tmp/fragstore_testing/{}", rand::random::<u128>());
    pnk!(std::fs::create_dir_all(&dir));
    let pool = Arc::new(pnk!(PmemPool::open(
        format!("{}/pool.pm", dir),
        32 * MB,
        64,
        true
    )));
    Arc::new(PmemIndex::open(pool))
}

fn key(i: u64) -> Vec<u8> {
    let mut k = vec![0u8; 16];
    k[..8].copy_from_slice(&i.to_le_bytes());
    k
}

fn rqst_with_sender(
    op: RqstOperation,
    k: Vec<u8>,
    v: Vec<u8>,
    done: mpsc::Sender<(StatusCode, Vec<u8>)>,
) -> Box<Rqst> {
    RQST_POOL.take(
        op,
        k,
        v,
        Some(Box::new(move |status, _key, value| {
            done.send((status, value.to_vec())).ok();
        })),
    )
}

fn must_enqueue(poller: &PmemPoller, rqst: Box<Rqst>) {
    assert!(poller.enqueue(rqst).is_ok());
}

#[test]
fn pmem_poller_processes_batches_inline() {
    let index = fresh_index();
    let poller = PmemPoller::new(16, index.clone(), None, None);
    let (done, wait) = mpsc::channel();

    must_enqueue(
        &poller,
        rqst_with_sender(
            RqstOperation::Put,
            key(1),
            b"payload".to_vec(),
            done.clone(),
        ),
    );
    must_enqueue(
        &poller,
        rqst_with_sender(RqstOperation::Get, key(1), Vec::new(), done.clone()),
    );
    must_enqueue(
        &poller,
        rqst_with_sender(
            RqstOperation::Remove,
            key(1),
            Vec::new(),
            done.clone(),
        ),
    );
    must_enqueue(
        &poller,
        rqst_with_sender(RqstOperation::Get, key(1), Vec::new(), done),
    );

    // one consumer tick serves the whole batch, in submission order
    let mut batch = Vec::new();
    poller.dequeue(&mut batch);
    assert_eq!(batch.len(), 4);
    poller.process(&mut batch);

    assert_eq!(pnk!(wait.recv()), (StatusCode::Ok, b"payload".to_vec()));
    assert_eq!(pnk!(wait.recv()), (StatusCode::Ok, b"payload".to_vec()));
    assert_eq!(pnk!(wait.recv()).0, StatusCode::Ok);
    assert_eq!(pnk!(wait.recv()).0, StatusCode::KeyNotFound);
    assert!(index.is_empty());
}

#[test]
fn put_publishes_to_the_ready_queue() {
    let index = fresh_index();
    let desc = pnk!(KeyDescriptor::new(&[KeyField {
        size: 16,
        is_primary: true,
    }]));
    let ready = Arc::new(pnk!(PrimaryKeyQueue::new(&desc, 2, 0, 0, 0)));
    let poller = PmemPoller::new(16, index.clone(), Some(ready.clone()), None);
    let (done, wait) = mpsc::channel();

    for i in 0..3u64 {
        must_enqueue(
            &poller,
            rqst_with_sender(
                RqstOperation::Put,
                key(i),
                vec![i as u8],
                done.clone(),
            ),
        );
    }
    let mut batch = Vec::new();
    poller.dequeue(&mut batch);
    poller.process(&mut batch);

    assert_eq!(pnk!(wait.recv()).0, StatusCode::Ok);
    assert_eq!(pnk!(wait.recv()).0, StatusCode::Ok);
    // the third key found the ready queue full and was rolled back
    assert_eq!(pnk!(wait.recv()).0, StatusCode::QueueFullError);
    assert_eq!(ready.len(), 2);
    assert_eq!(index.len(), 2);
    assert!(!index.contains(&key(2)));
}

#[test]
fn spawned_poller_drains_before_exiting() {
    let index = fresh_index();
    let poller = Arc::new(PmemPoller::new(64, index.clone(), None, None));
    let keep_running = Arc::new(AtomicBool::new(true));
    let handle = pnk!(spawn(
        "pmem-poller-test",
        poller.clone(),
        keep_running.clone(),
        None
    ));

    let (done, wait) = mpsc::channel();
    for i in 0..32u64 {
        let _ = poller.enqueue(rqst_with_sender(
            RqstOperation::Put,
            key(i),
            vec![1],
            done.clone(),
        ));
    }
    keep_running.store(false, Ordering::Release);
    handle.join().unwrap();

    // everything enqueued before the stop flag still completed
    let mut served = 0;
    while wait.recv_timeout(Duration::from_millis(100)).is_ok() {
        served += 1;
    }
    assert_eq!(served, 32);
    assert_eq!(index.len(), 32);
}
