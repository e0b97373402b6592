use super::*;

#[test]
fn ownership_attrs() {
    let k = Key::new(vec![1, 2, 3]);
    assert_eq!(k.attr, KeyValAttribute::CallerOwned);
    assert_eq!(k.size(), 3);
    assert_eq!(k.data(), &[1, 2, 3]);

    let k = Key::buffered(vec![0; 16]);
    assert_eq!(k.attr, KeyValAttribute::Buffered);
    assert_eq!(k.into_bytes(), vec![0; 16]);
}

#[test]
fn value_reservation() {
    let v = Value::new(b"abcd".to_vec());
    assert!(v.reserved.is_none());

    let mut v = Value::reserved(vec![0; 8], 4096);
    assert_eq!(v.reserved, Some(4096));
    v[0] = 0xff;
    assert_eq!(v.data()[0], 0xff);
}

#[test]
fn deref_as_slice() {
    let mut k = Key::new(vec![0u8; 4]);
    k[1] = 7;
    assert_eq!(&k[..], &[0, 7, 0, 0]);

    let v: Value = b"xyz"[..].into();
    assert_eq!(&v[..], b"xyz");
}
