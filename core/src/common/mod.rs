//!
//! # Common components
//!
//! Status taxonomy, key-layout descriptor, shared type aliases.
//!

use serde::{Deserialize, Serialize};
use std::mem::size_of;
use thiserror::Error;

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

pub type RawBytes = Vec<u8>;
pub type RawKey = RawBytes;
pub type RawValue = RawBytes;

pub const KB: u64 = 1 << 10;
pub const MB: u64 = 1 << 20;
pub const GB: u64 = 1 << 30;

/// Used when the key layout declares no fields at all.
pub const DEFAULT_KEY_SIZE: usize = 16;

pub(crate) const EINVAL: i32 = 22;
pub(crate) const ENOSPC: i32 = 28;

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// Outcome of every engine operation.
///
/// Non-negative wire codes are the enumerated statuses below; negative wire
/// codes alias errno values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusCode {
    Ok,
    KeyNotFound,
    AllocationError,
    OffloadDisabledError,
    TimeOut,
    QueueFullError,
    NotImplemented,
    NotSupported,
    UnknownError,
    Errno(i32),
}

impl StatusCode {
    pub fn to_wire(self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::KeyNotFound => 1,
            StatusCode::AllocationError => 2,
            StatusCode::OffloadDisabledError => 3,
            StatusCode::TimeOut => 4,
            StatusCode::QueueFullError => 5,
            StatusCode::NotImplemented => 6,
            StatusCode::NotSupported => 7,
            StatusCode::UnknownError => 8,
            StatusCode::Errno(e) => -e.abs(),
        }
    }

    pub fn from_wire(code: i32) -> Self {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::KeyNotFound,
            2 => StatusCode::AllocationError,
            3 => StatusCode::OffloadDisabledError,
            4 => StatusCode::TimeOut,
            5 => StatusCode::QueueFullError,
            6 => StatusCode::NotImplemented,
            7 => StatusCode::NotSupported,
            8 => StatusCode::UnknownError,
            e if e < 0 => StatusCode::Errno(-e),
            _ => StatusCode::UnknownError,
        }
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

/// Typed failure raised by the synchronous API surface.
#[derive(Error, Clone, Debug, Eq, PartialEq)]
#[error("operation failed: {status:?}")]
pub struct OpError {
    pub status: StatusCode,
}

impl OpError {
    pub fn new(status: StatusCode) -> Self {
        OpError { status }
    }
}

impl From<StatusCode> for OpError {
    fn from(status: StatusCode) -> Self {
        OpError { status }
    }
}

pub type OpResult<T> = std::result::Result<T, OpError>;

#[inline(always)]
pub fn fail<T>(status: StatusCode) -> OpResult<T> {
    Err(OpError::new(status))
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// One field of the composite key layout.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct KeyField {
    pub size: usize,
    #[serde(default)]
    pub is_primary: bool,
}

/// Composite-key layout declared at store-open time.
///
/// Total size and the primary field's offset/size are computed once and
/// cached; exactly one field must be marked primary.
#[derive(Clone, Debug)]
pub struct KeyDescriptor {
    fields: Vec<KeyField>,
    key_size: usize,
    pkey_size: usize,
    pkey_offset: usize,
}

impl KeyDescriptor {
    pub fn new(fields: &[KeyField]) -> OpResult<Self> {
        if fields.is_empty() {
            // no declared layout: the whole key is one primary field
            return Ok(KeyDescriptor {
                fields: vec![KeyField {
                    size: DEFAULT_KEY_SIZE,
                    is_primary: true,
                }],
                key_size: DEFAULT_KEY_SIZE,
                pkey_size: DEFAULT_KEY_SIZE,
                pkey_offset: 0,
            });
        }

        let mut key_size = 0;
        let mut pkey_size = 0;
        let mut pkey_offset = 0;
        let mut primaries = 0;
        for f in fields {
            if f.size == 0 {
                return fail(StatusCode::NotSupported);
            }
            if f.is_primary {
                primaries += 1;
                pkey_size = f.size;
                pkey_offset = key_size;
            }
            key_size += f.size;
        }
        if primaries != 1 {
            return fail(StatusCode::NotSupported);
        }
        if pkey_size > size_of::<u64>() && pkey_size != key_size {
            // routing reads the primary field as an unsigned integer
            return fail(StatusCode::NotSupported);
        }
        Ok(KeyDescriptor {
            fields: fields.to_vec(),
            key_size,
            pkey_size,
            pkey_offset,
        })
    }

    #[inline(always)]
    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    #[inline(always)]
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    #[inline(always)]
    pub fn primary_size(&self) -> usize {
        self.pkey_size
    }

    #[inline(always)]
    pub fn primary_offset(&self) -> usize {
        self.pkey_offset
    }

    /// Borrow the primary-field bytes out of a full key buffer.
    #[inline(always)]
    pub fn primary_of<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        &key[self.pkey_offset..self.pkey_offset + self.pkey_size]
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// Primary-field bytes as an unsigned integer, little-endian, zero-padded.
#[inline(always)]
pub fn primary_field_value(pkey: &[u8]) -> u64 {
    let mut buf = [0u8; size_of::<u64>()];
    let n = pkey.len().min(size_of::<u64>());
    buf[..n].copy_from_slice(&pkey[..n]);
    u64::from_le_bytes(buf)
}

/// The first `mask_len` bits of `value`, offset by `mask_off`, as an
/// unsigned integer. A zero-length mask maps every key to 0.
#[inline(always)]
pub fn masked_hash(value: u64, mask_len: u32, mask_off: u32) -> u64 {
    if mask_len == 0 {
        return 0;
    }
    let shifted = value >> mask_off;
    if mask_len >= u64::BITS {
        shifted
    } else {
        shifted & ((1u64 << mask_len) - 1)
    }
}
