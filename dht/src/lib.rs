//! Static DHT layer: every node knows its neighbors and the key range each
//! one owns; a key's primary field decides its home node. No re-sharding,
//! no membership changes.

#![deny(warnings)]
#![cfg_attr(test, allow(warnings))]

pub mod client;

pub mod core;

pub mod msg;

pub mod node;

pub mod server;

pub use crate::core::{DhtCore, DhtOptions, NeighborOptions};

pub use client::DhtClient;

pub use node::{DhtNode, DhtNodeState, KeyRange};

pub use server::{DhtServer, DhtServerState, KvDispatcher};
