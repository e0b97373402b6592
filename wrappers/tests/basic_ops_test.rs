use fragstore::{
    GetOptions, Key, Options, PutOptions, StatusCode, Store, GB, MB,
};
use ruc::*;
use std::sync::mpsc;
use std::time::Duration;

fn test_dir() -> String {
    let dir = format!("/tmp/fragstore_testing/{}", rand::random::<u128>());
    pnk!(std::fs::create_dir_all(&dir));
    dir
}

fn base_options(dir: &str) -> Options {
    let mut opts = Options::default();
    opts.pmem.pool_path = format!("{}/pool.pm", dir);
    opts.pmem.total_size = 64 * MB;
    opts.pmem.truncate = true;
    opts.key.field(16, true);
    opts.dht.port = 0;
    opts
}

fn key_of(store: &Store, text: &[u8]) -> Key {
    let mut key = store.alloc_key();
    key[..text.len()].copy_from_slice(text);
    key
}

#[test]
fn put_get_remove_roundtrip() {
    let dir = test_dir();
    let mut opts = base_options(&dir);
    opts.pmem.total_size = 2 * GB;
    let store = pnk!(Store::open(opts));
    assert_eq!(store.key_size(), 16);

    let key = key_of(&store, b"100");
    pnk!(store.put(key, b"abcd\0"[..].into(), &PutOptions::default()));

    let key = key_of(&store, b"100");
    let value = pnk!(store.get(&key, &GetOptions::default()));
    assert_eq!(&value[..], b"abcd\0");

    pnk!(store.remove(&key));
    assert_eq!(
        store.get(&key, &GetOptions::default()).unwrap_err().status,
        StatusCode::KeyNotFound
    );
    store.free_key(key);
    store.close();
}

#[test]
fn alloc_put_get_across_value_sizes() {
    let dir = test_dir();
    let store = pnk!(Store::open(base_options(&dir)));

    let sizes: &[usize] = &[
        1, 8, 16, 32, 64, 127, 128, 129, 255, 256, 512, 1023, 1024, 1025,
        2048, 4096, 8192, 10240, 16384,
    ];
    for (i, n) in sizes.iter().enumerate() {
        let key = key_of(&store, &(i as u64).to_le_bytes());
        let mut value = pnk!(store.alloc(&key, *n, &Default::default()));
        value
            .iter_mut()
            .enumerate()
            .for_each(|(j, b)| *b = (i + j) as u8);
        let expected = value.data().to_vec();

        pnk!(store.put(key, value, &PutOptions::default()));

        let key = key_of(&store, &(i as u64).to_le_bytes());
        let got = pnk!(store.get(&key, &GetOptions::default()));
        assert_eq!(got.data(), &expected[..], "size {}", n);
        store.free_key(key);
    }
    store.close();
}

#[test]
fn async_completion_is_visible_to_sync_get() {
    let dir = test_dir();
    let mut opts = base_options(&dir);
    opts.runtime.num_of_pollers = 2;
    let store = pnk!(Store::open(opts));

    let put_opts = PutOptions {
        poller_id: Some(0),
        ..Default::default()
    };
    let (done, wait) = mpsc::channel();
    let key = key_of(&store, b"async-key");
    pnk!(store.put_async(
        key,
        b"async-value"[..].into(),
        Box::new(move |status, _key, _value| {
            done.send(status).ok();
        }),
        &put_opts,
    ));
    let status = pnk!(wait.recv_timeout(Duration::from_secs(5)));
    assert_eq!(status, StatusCode::Ok);

    // the fired callback makes the put observable on the same poller
    let key = key_of(&store, b"async-key");
    let got = pnk!(store.get(
        &key,
        &GetOptions {
            poller_id: Some(0),
            ..Default::default()
        },
    ));
    assert_eq!(&got[..], b"async-value");
    store.free_key(key);
    store.close();
}

#[test]
fn values_survive_store_reopen() {
    let dir = test_dir();
    {
        let store = pnk!(Store::open(base_options(&dir)));
        let key = key_of(&store, b"durable");
        pnk!(store.put(key, b"still here"[..].into(), &PutOptions::default()));
        store.close();
    }

    let mut opts = base_options(&dir);
    opts.pmem.truncate = false;
    let store = pnk!(Store::open(opts));
    let key = key_of(&store, b"durable");
    let got = pnk!(store.get(&key, &GetOptions::default()));
    assert_eq!(&got[..], b"still here");
    store.free_key(key);
    store.close();
}

#[test]
fn properties_reflect_configuration() {
    let dir = test_dir();
    let opts = base_options(&dir);
    let pool_path = opts.pmem.pool_path.clone();
    let store = pnk!(Store::open(opts));

    assert_eq!(store.get_property("fragstore.dht.id"), "0");
    assert_eq!(store.get_property("fragstore.pmem.path"), pool_path);
    assert_eq!(
        store.get_property("fragstore.pmem.size"),
        (64 * MB).to_string()
    );
    assert_eq!(store.get_property("no.such.property"), "");
    store.close();
}
