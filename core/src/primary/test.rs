use super::*;
use crate::common::KeyField;
use ruc::*;

fn desc() -> KeyDescriptor {
    pnk!(KeyDescriptor::new(&[
        KeyField {
            size: 4,
            is_primary: false,
        },
        KeyField {
            size: 8,
            is_primary: true,
        },
        KeyField {
            size: 4,
            is_primary: false,
        },
    ]))
}

fn key_with_primary(primary: u64) -> Vec<u8> {
    let mut k = vec![0xffu8; 16];
    k[4..12].copy_from_slice(&primary.to_le_bytes());
    k
}

#[test]
fn reconstruct_zeroes_non_primary_bytes() {
    let q = pnk!(PrimaryKeyQueue::new(&desc(), 4, 0, 0, 0));
    pnk!(q.enqueue_next(&key_with_primary(0x1122334455667788)));

    let key = pnk!(q.dequeue_next());
    assert_eq!(key.len(), 16);
    assert_eq!(&key[..4], &[0; 4]);
    assert_eq!(&key[4..12], &0x1122334455667788u64.to_le_bytes());
    assert_eq!(&key[12..], &[0; 4]);
}

#[test]
fn capacity_and_exhaustion() {
    let q = pnk!(PrimaryKeyQueue::new(&desc(), 4, 0, 0, 0));
    for i in 0..4u64 {
        pnk!(q.enqueue_next(&key_with_primary(i)));
    }
    assert_eq!(
        q.enqueue_next(&key_with_primary(9)).unwrap_err().status,
        StatusCode::QueueFullError
    );

    for _ in 0..4 {
        pnk!(q.dequeue_next());
    }
    assert_eq!(
        q.dequeue_next().unwrap_err().status,
        StatusCode::KeyNotFound
    );

    // room again after draining
    pnk!(q.enqueue_next(&key_with_primary(5)));
    pnk!(q.dequeue_next());
}

#[test]
fn non_local_keys_skip_the_queue() {
    // one mask bit, this node owns value 0
    let q = pnk!(PrimaryKeyQueue::new(&desc(), 4, 0, 1, 0));
    pnk!(q.enqueue_next(&key_with_primary(2))); // low bit 0: local
    pnk!(q.enqueue_next(&key_with_primary(3))); // low bit 1: not ours
    assert_eq!(q.len(), 1);

    assert!(q.is_local(&key_with_primary(2)));
    assert!(!q.is_local(&key_with_primary(3)));
}

#[test]
fn zero_capacity_is_refused() {
    assert!(PrimaryKeyQueue::new(&desc(), 0, 0, 0, 0).is_err());
}
