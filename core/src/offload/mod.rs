//!
//! # Offload tier
//!
//! Cold values move from the pmem pool to a block device. The free-list
//! tracks device blocks in pmem (so block accounting survives restarts),
//! the offload poller turns requests into block I/O, and the finalize
//! poller applies the resulting index mutations and fires callbacks.
//!

pub mod bdev;

pub mod finalize;

pub mod free_list;

pub mod poller;

use crate::rqst::Rqst;

/// Carries one request across the I/O boundary from the offload poller to
/// the finalize poller.
pub struct DeviceTask {
    pub rqst: Box<Rqst>,
    /// DMA-style buffer holding the payload read from / written to disk.
    pub buf: Option<Vec<u8>>,
    /// LBA the operation touched, in allocation units.
    pub lba: u64,
    /// Whether the device operation succeeded.
    pub result: bool,
    /// Install a fresh device-address record on success (value promotion);
    /// false for in-place overwrites of already-offloaded values.
    pub update_index: bool,
    /// Payload length in bytes.
    pub val_len: u64,
}
