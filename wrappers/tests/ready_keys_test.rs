use fragstore::{GetOptions, Key, Options, PutOptions, StatusCode, Store, MB};
use ruc::*;
use std::collections::HashSet;

fn base_options() -> Options {
    let dir = format!("/tmp/fragstore_testing/{}", rand::random::<u128>());
    pnk!(std::fs::create_dir_all(&dir));
    let mut opts = Options::default();
    opts.pmem.pool_path = format!("{}/pool.pm", dir);
    opts.pmem.total_size = 64 * MB;
    opts.pmem.truncate = true;
    opts.key.field(16, true);
    opts.dht.port = 0;
    opts.runtime.max_ready_keys = 4;
    opts
}

fn key_of(store: &Store, primary: u64) -> Key {
    let mut key = store.alloc_key();
    key[..8].copy_from_slice(&primary.to_le_bytes());
    key
}

#[test]
fn get_any_returns_every_put_key_then_runs_dry() {
    let store = pnk!(Store::open(base_options()));

    let mut expected = HashSet::new();
    for i in 1..=4u64 {
        expected.insert(key_of(&store, i).data().to_vec());
        pnk!(store.put(
            key_of(&store, i),
            i.to_le_bytes()[..].into(),
            &PutOptions::default(),
        ));
    }

    let mut seen = HashSet::new();
    for _ in 0..4 {
        let key = pnk!(store.get_any(&GetOptions::default()));
        seen.insert(key.data().to_vec());
        store.free_key(key);
    }
    assert_eq!(seen, expected);

    // drained: the fifth pop finds nothing
    assert_eq!(
        store.get_any(&GetOptions::default()).unwrap_err().status,
        StatusCode::KeyNotFound
    );

    // a fifth put replenishes the queue
    pnk!(store.put(
        key_of(&store, 5),
        b"five"[..].into(),
        &PutOptions::default(),
    ));
    let key = pnk!(store.get_any(&GetOptions::default()));
    assert_eq!(&key[..8], &5u64.to_le_bytes());
    assert_eq!(&key[8..], &[0u8; 8]);
    store.free_key(key);
    store.close();
}

#[test]
fn overflowing_the_ready_queue_rolls_the_put_back() {
    let store = pnk!(Store::open(base_options()));

    for i in 1..=4u64 {
        pnk!(store.put(
            key_of(&store, i),
            b"v"[..].into(),
            &PutOptions::default(),
        ));
    }
    // queue capacity is 4: the fifth put cannot publish its key
    assert_eq!(
        store
            .put(key_of(&store, 5), b"v"[..].into(), &PutOptions::default())
            .unwrap_err()
            .status,
        StatusCode::QueueFullError
    );
    // and the rolled-back key is gone from the index too
    let key = key_of(&store, 5);
    assert_eq!(
        store.get(&key, &GetOptions::default()).unwrap_err().status,
        StatusCode::KeyNotFound
    );
    store.free_key(key);
    store.close();
}

#[test]
fn get_any_without_a_ready_queue_is_not_supported() {
    let mut opts = base_options();
    opts.runtime.max_ready_keys = 0;
    let store = pnk!(Store::open(opts));
    assert_eq!(
        store.get_any(&GetOptions::default()).unwrap_err().status,
        StatusCode::NotSupported
    );
    store.close();
}
