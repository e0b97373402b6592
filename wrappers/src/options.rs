//!
//! Store configuration: a serde tree that can be filled in code or read
//! once at startup from a TOML key/value file, plus the per-call option
//! records carried by the API methods.
//!

use fragstore_core::common::{KeyField, GB};
use fragstore_dht::DhtOptions;
use ruc::*;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Attribute bits carried by per-call options.
pub const ATTR_EMPTY: u32 = 0;
/// Value belongs on the long-term (offload) tier.
pub const ATTR_LONG_TERM: u32 = 1 << 0;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum OperationalMode {
    /// Full local engine plus DHT endpoint.
    #[default]
    Storage,
    /// No local engine; every operation is forwarded to peers.
    Satellite,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub mode: OperationalMode,
    pub pmem: PmemOptions,
    pub offload: OffloadOptions,
    pub dht: DhtOptions,
    pub key: KeyOptions,
    pub runtime: RuntimeOptions,
}

impl Options {
    /// Read options from a TOML file, once, at startup.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Options> {
        let raw = fs::read_to_string(path.as_ref()).c(d!())?;
        toml::from_str(&raw).c(d!())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PmemOptions {
    pub pool_path: String,
    pub total_size: u64,
    pub alloc_unit_size: u64,
    /// Discard an existing pool instead of reattaching to it.
    pub truncate: bool,
}

impl Default for PmemOptions {
    fn default() -> Self {
        PmemOptions {
            pool_path: String::new(),
            total_size: 2 * GB,
            alloc_unit_size: 64,
            truncate: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadOptions {
    /// Backing block device; empty disables the offload tier.
    pub dev_path: String,
    /// Device identity persisted into device-address records.
    pub nvme_addr: String,
    pub nvme_name: String,
    /// Bytes per offloaded allocation; whole device blocks.
    pub alloc_unit_size: u64,
    /// Size of a file-backed device created on demand.
    pub dev_size: u64,
}

impl Default for OffloadOptions {
    fn default() -> Self {
        OffloadOptions {
            dev_path: String::new(),
            nvme_addr: String::new(),
            nvme_name: String::new(),
            alloc_unit_size: 16 << 10,
            dev_size: GB,
        }
    }
}

impl OffloadOptions {
    pub fn enabled(&self) -> bool {
        !self.dev_path.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyOptions {
    pub fields: Vec<KeyFieldOptions>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyFieldOptions {
    pub size: usize,
    pub is_primary: bool,
}

impl KeyOptions {
    pub fn field(&mut self, size: usize, is_primary: bool) -> &mut Self {
        self.fields.push(KeyFieldOptions { size, is_primary });
        self
    }

    pub(crate) fn to_fields(&self) -> Vec<KeyField> {
        self.fields
            .iter()
            .map(|f| KeyField {
                size: f.size,
                is_primary: f.is_primary,
            })
            .collect()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Parallel pmem pollers.
    pub num_of_pollers: usize,
    /// Ready-key queue capacity; 0 disables GetAny.
    pub max_ready_keys: usize,
    /// First CPU core handed to poller threads.
    pub base_core: usize,
    /// Capacity of each request ring.
    pub queue_depth: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            num_of_pollers: 1,
            max_ready_keys: 0,
            base_core: 1,
            queue_depth: 4096,
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Default)]
pub struct PutOptions {
    pub attr: u32,
    /// Pin the request to one pmem poller instead of round-robin.
    pub poller_id: Option<usize>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GetOptions {
    pub attr: u32,
    pub poller_id: Option<usize>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UpdateOptions {
    pub attr: u32,
}

impl UpdateOptions {
    pub fn long_term() -> Self {
        UpdateOptions {
            attr: ATTR_LONG_TERM,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AllocOptions {
    pub attr: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn toml_roundtrip() {
        let raw = r#"
            mode = "Storage"

            [pmem]
            pool_path = "/tmp/pool.pm"
            total_size = 1073741824

            [offload]
            dev_path = "/tmp/bdev.img"
            alloc_unit_size = 16384

            [dht]
            port = 31850
            id = 0

            [[dht.neighbors]]
            ip = "127.0.0.1"
            port = 31851
            key_range = { mask_length = 1, mask_offset = 0, start = 1, end = 1 }

            [[key.fields]]
            size = 16
            is_primary = true

            [runtime]
            num_of_pollers = 2
            max_ready_keys = 64
        "#;
        let opts: Options = toml::from_str(raw).unwrap();
        assert_eq!(opts.pmem.total_size, GB);
        assert!(opts.offload.enabled());
        assert_eq!(opts.dht.neighbors.len(), 1);
        assert_eq!(opts.dht.neighbors[0].key_range.start, 1);
        assert_eq!(opts.key.fields[0].size, 16);
        assert_eq!(opts.runtime.num_of_pollers, 2);
        // untouched knobs keep their defaults
        assert_eq!(opts.runtime.queue_depth, 4096);
        assert_eq!(opts.offload.dev_size, GB);
    }
}
