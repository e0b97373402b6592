use super::*;
use crate::common::MB;
use ruc::*;

fn open_pool(path: &str, truncate: bool) -> Arc<PmemPool> {
    Arc::new(pnk!(PmemPool::open(path, 32 * MB, 64, truncate)))
}

fn fresh_index() -> PmemIndex {
    let dir = format!("/tmp/fragstore_testing/{}", rand::random::<u128>());
    pnk!(std::fs::create_dir_all(&dir));
    PmemIndex::open(open_pool(&format!("{}/pool.pm", dir), true))
}

fn key(i: u64) -> Vec<u8> {
    let mut k = vec![0u8; 16];
    k[..8].copy_from_slice(&i.to_le_bytes());
    k
}

#[test]
fn put_get_remove() {
    let idx = fresh_index();
    let k = key(100);

    assert_eq!(idx.get(&k).unwrap_err().status, StatusCode::KeyNotFound);

    pnk!(idx.put(&k, b"abcd\0", None));
    let ctx = pnk!(idx.get(&k));
    assert_eq!(ctx.location, ValLocation::Pmem);
    assert_eq!(ctx.size, 5);
    assert_eq!(idx.read_value(&ctx), b"abcd\0");

    // overwrite in place
    pnk!(idx.put(&k, b"efgh", None));
    let ctx = pnk!(idx.get(&k));
    assert_eq!(idx.read_value(&ctx), b"efgh");
    assert_eq!(idx.len(), 1);

    pnk!(idx.remove(&k));
    assert_eq!(idx.get(&k).unwrap_err().status, StatusCode::KeyNotFound);
    assert_eq!(idx.remove(&k).unwrap_err().status, StatusCode::KeyNotFound);
}

#[test]
fn content_addressed_by_full_key() {
    let idx = fresh_index();
    let mut a = key(7);
    let mut b = key(7);
    a[8] = 1; // same primary bytes, different tail
    b[8] = 2;
    pnk!(idx.put(&a, b"one", None));
    pnk!(idx.put(&b, b"two", None));
    assert_eq!(idx.read_value(&pnk!(idx.get(&a))), b"one");
    assert_eq!(idx.read_value(&pnk!(idx.get(&b))), b"two");
}

#[test]
fn survives_reattach() {
    let dir = format!("/tmp/fragstore_testing/{}", rand::random::<u128>());
    pnk!(std::fs::create_dir_all(&dir));
    let path = format!("{}/pool.pm", dir);

    {
        let idx = PmemIndex::open(open_pool(&path, true));
        for i in 0..50u64 {
            pnk!(idx.put(&key(i), &i.to_le_bytes(), None));
        }
        pnk!(idx.remove(&key(17)));
    }

    let idx = PmemIndex::open(open_pool(&path, false));
    assert_eq!(idx.len(), 49);
    assert_eq!(
        idx.get(&key(17)).unwrap_err().status,
        StatusCode::KeyNotFound
    );
    for i in (0..50u64).filter(|i| *i != 17) {
        let ctx = pnk!(idx.get(&key(i)));
        assert_eq!(idx.read_value(&ctx), &i.to_le_bytes());
    }
}

#[test]
fn reserved_allocation_roundtrip() {
    let idx = fresh_index();
    let k = key(3);
    let off = pnk!(idx.alloc_value_for_key(&k, 128));
    pnk!(idx.put(&k, &[0xabu8; 128], Some(off)));
    let ctx = pnk!(idx.get(&k));
    assert_eq!(ctx.off, off);
    assert_eq!(idx.read_value(&ctx), vec![0xab; 128]);
}

#[test]
fn device_addr_promotion() {
    let idx = fresh_index();
    let k = key(9);
    pnk!(idx.put(&k, &[1u8; 4096], None));

    let slot = pnk!(idx.allocate_iov_for_key(&k, 0xbeef, 42));
    pnk!(idx.update_value_wrapper(&k, slot, 4096));

    let ctx = pnk!(idx.get(&k));
    assert_eq!(ctx.location, ValLocation::Disk);
    assert_eq!(ctx.size, 4096);
    assert_eq!(idx.read_device_addr(&ctx), (0xbeef, 42));

    // a pmem-path put/remove on an offloaded key is refused
    assert_eq!(
        idx.put(&k, b"x", None).unwrap_err().status,
        StatusCode::NotSupported
    );
    assert_eq!(idx.remove(&k).unwrap_err().status, StatusCode::NotSupported);
}
