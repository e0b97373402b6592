use fragstore::{
    GetOptions, Key, Options, PutOptions, StatusCode, Store, UpdateOptions, KB,
    MB,
};
use ruc::*;

fn base_options(offload: bool) -> Options {
    let dir = format!("/tmp/fragstore_testing/{}", rand::random::<u128>());
    pnk!(std::fs::create_dir_all(&dir));
    let mut opts = Options::default();
    opts.pmem.pool_path = format!("{}/pool.pm", dir);
    opts.pmem.total_size = 64 * MB;
    opts.pmem.truncate = true;
    opts.key.field(16, true);
    opts.dht.port = 0;
    if offload {
        opts.offload.dev_path = format!("{}/bdev.img", dir);
        opts.offload.nvme_addr = "0000:88:00.0".to_owned();
        opts.offload.nvme_name = "Nvme0".to_owned();
        opts.offload.alloc_unit_size = 16 * KB;
        opts.offload.dev_size = MB;
    }
    opts
}

fn key_of(store: &Store, primary: u64) -> Key {
    let mut key = store.alloc_key();
    key[..8].copy_from_slice(&primary.to_le_bytes());
    key
}

#[test]
fn promote_read_overwrite_remove() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = pnk!(Store::open(base_options(true)));
    let value: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

    let key = key_of(&store, 1);
    pnk!(store.put(key, value.clone()[..].into(), &PutOptions::default()));

    let key = key_of(&store, 1);
    assert!(!pnk!(store.is_offloaded(&key)));

    // promotion moves the pmem-resident bytes out to the device
    pnk!(store.update(&key, None, &UpdateOptions::long_term()));
    assert!(pnk!(store.is_offloaded(&key)));
    let got = pnk!(store.get(&key, &GetOptions::default()));
    assert_eq!(got.data(), &value[..]);

    // overwrite in place on the device
    let v2 = vec![0x77u8; 2000];
    pnk!(store.update(
        &key,
        Some(v2.clone()[..].into()),
        &UpdateOptions::long_term(),
    ));
    let got = pnk!(store.get(&key, &GetOptions::default()));
    assert_eq!(got.data(), &v2[..]);

    // the asynchronous long-term read path sees the same bytes
    let (done, wait) = std::sync::mpsc::channel();
    pnk!(store.get_async(
        &key,
        Box::new(move |status, _key, value| {
            done.send((status, value.to_vec())).ok();
        }),
        &GetOptions {
            attr: fragstore::ATTR_LONG_TERM,
            ..Default::default()
        },
    ));
    let (status, bytes) =
        pnk!(wait.recv_timeout(std::time::Duration::from_secs(5)));
    assert_eq!(status, StatusCode::Ok);
    assert_eq!(bytes, v2);

    pnk!(store.remove(&key));
    assert_eq!(
        store.get(&key, &GetOptions::default()).unwrap_err().status,
        StatusCode::KeyNotFound
    );
    assert!(!pnk!(store.is_offloaded(&key)));
    store.free_key(key);
    store.close();
}

#[test]
fn removed_blocks_are_allocatable_again() {
    let mut opts = base_options(true);
    // four allocation units in total: recycling is load-bearing
    opts.offload.dev_size = 64 * KB;
    let store = pnk!(Store::open(opts));

    for round in 0..10u64 {
        let key = key_of(&store, 100 + round);
        pnk!(store.put(key, vec![round as u8; 4096][..].into(), &PutOptions::default()));
        let key = key_of(&store, 100 + round);
        pnk!(store.update(&key, None, &UpdateOptions::long_term()));
        assert!(pnk!(store.is_offloaded(&key)));
        pnk!(store.remove(&key));
        store.free_key(key);
    }
    store.close();
}

#[test]
fn update_without_offload_fails_immediately() {
    let store = pnk!(Store::open(base_options(false)));
    let key = key_of(&store, 9);
    pnk!(store.put(key, b"value"[..].into(), &PutOptions::default()));

    let key = key_of(&store, 9);
    assert_eq!(
        store
            .update(&key, None, &UpdateOptions::long_term())
            .unwrap_err()
            .status,
        StatusCode::OffloadDisabledError
    );
    store.free_key(key);
    store.close();
}

#[test]
fn offload_state_survives_reopen() {
    let mut opts = base_options(true);
    opts.pmem.truncate = false;
    let dir_pool = opts.pmem.pool_path.clone();
    let value = vec![0x42u8; 3000];

    {
        let mut first = opts.clone();
        first.pmem.truncate = true;
        let store = pnk!(Store::open(first));
        let key = key_of(&store, 77);
        pnk!(store.put(key, value.clone()[..].into(), &PutOptions::default()));
        let key = key_of(&store, 77);
        pnk!(store.update(&key, None, &UpdateOptions::long_term()));
        store.free_key(key);
        store.close();
    }

    assert!(std::path::Path::new(&dir_pool).exists());
    let store = pnk!(Store::open(opts));
    let key = key_of(&store, 77);
    assert!(pnk!(store.is_offloaded(&key)));
    let got = pnk!(store.get(&key, &GetOptions::default()));
    assert_eq!(got.data(), &value[..]);
    store.free_key(key);
    store.close();
}
