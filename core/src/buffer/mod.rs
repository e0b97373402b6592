//!
//! Typed ownership-tracked byte buffers for keys and values.
//!
//! A buffer is either plain heap memory owned by the caller, or engine
//! memory (a DHT transmit-arena slot, or a pool reservation on the value
//! side) that must go back where it came from via the store's `free`.
//!

#[cfg(test)]
mod test;

use crate::common::RawBytes;
use std::ops::{Deref, DerefMut};

/// Who owns the backing allocation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum KeyValAttribute {
    /// Plain heap buffer, released by the caller.
    #[default]
    CallerOwned,
    /// Came from an engine arena and must be returned to it.
    Buffered,
}

#[derive(Debug, Default)]
pub struct Key {
    pub buf: RawBytes,
    pub attr: KeyValAttribute,
}

impl Key {
    #[inline(always)]
    pub fn new(buf: RawBytes) -> Self {
        Key {
            buf,
            attr: KeyValAttribute::CallerOwned,
        }
    }

    /// An engine-owned key carved from a transmit arena.
    #[inline(always)]
    pub fn buffered(buf: RawBytes) -> Self {
        Key {
            buf,
            attr: KeyValAttribute::Buffered,
        }
    }

    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Give up the backing bytes, e.g. to return them to an arena.
    #[inline(always)]
    pub fn into_bytes(self) -> RawBytes {
        self.buf
    }
}

impl Deref for Key {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for Key {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

#[derive(Debug, Default)]
pub struct Value {
    pub buf: RawBytes,
    pub attr: KeyValAttribute,
    /// Pool offset pre-allocated by `Store::alloc`; `put` installs into it.
    pub reserved: Option<u64>,
}

impl Value {
    #[inline(always)]
    pub fn new(buf: RawBytes) -> Self {
        Value {
            buf,
            attr: KeyValAttribute::CallerOwned,
            reserved: None,
        }
    }

    /// A value whose pool space was already reserved for its key.
    #[inline(always)]
    pub fn reserved(buf: RawBytes, off: u64) -> Self {
        Value {
            buf,
            attr: KeyValAttribute::CallerOwned,
            reserved: Some(off),
        }
    }

    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    #[inline(always)]
    pub fn into_bytes(self) -> RawBytes {
        self.buf
    }
}

impl Deref for Value {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for Value {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl AsRef<[u8]> for Value {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl From<RawBytes> for Value {
    fn from(buf: RawBytes) -> Self {
        Value::new(buf)
    }
}

impl From<&[u8]> for Value {
    fn from(buf: &[u8]) -> Self {
        Value::new(buf.to_vec())
    }
}
