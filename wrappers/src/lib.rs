#![doc = include_str!("../README.md")]
#![deny(warnings)]
#![cfg_attr(test, allow(warnings))]

/// Store configuration and per-call option records.
pub mod options;
/// The public synchronous/asynchronous store façade.
pub mod store;

pub use options::{
    AllocOptions, GetOptions, KeyFieldOptions, KeyOptions, OffloadOptions,
    OperationalMode, Options, PmemOptions, PutOptions, RuntimeOptions,
    UpdateOptions, ATTR_EMPTY, ATTR_LONG_TERM,
};

pub use store::Store;

pub use fragstore_core::{
    self, Key, KeyValAttribute, OpError, OpResult, RawBytes, StatusCode, Value,
    GB, KB, MB,
};

pub use fragstore_core::rqst::KvCallback;

pub use fragstore_dht::{self, DhtNodeState, KeyRange, NeighborOptions};
