#![doc = include_str!("../README.md")]
#![deny(warnings)]
#![cfg_attr(test, allow(warnings))]

pub mod buffer;

pub mod common;

pub mod offload;

pub mod pmem;

pub mod poller;

pub mod primary;

pub mod rqst;

pub use buffer::{Key, KeyValAttribute, Value};

pub use common::{
    masked_hash, primary_field_value, KeyDescriptor, KeyField, OpError, OpResult,
    RawBytes, StatusCode, GB, KB, MB,
};

pub use pmem::{index::PmemIndex, pool::PmemPool};
