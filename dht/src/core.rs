//!
//! Routing core: which node owns a key.
//!
//! The primary-field bytes, read as a little-endian unsigned integer and
//! narrowed by the configured bit mask, give a key's hash; a key is local
//! iff that hash equals this node's id, and otherwise exactly one neighbor's
//! `[start, end]` range must contain it. The neighbor set is fixed for the
//! process lifetime.
//!

use crate::client::DhtClient;
use crate::node::{DhtNode, KeyRange};
use fragstore_core::common::{
    fail, masked_hash, primary_field_value, KeyDescriptor, OpResult, StatusCode,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configured identity and neighborhood of this node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtOptions {
    /// Listen port; 0 disables the server endpoint.
    #[serde(default = "default_port")]
    pub port: u16,
    /// This node's hash value.
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub neighbors: Vec<NeighborOptions>,
}

fn default_port() -> u16 {
    31850
}

impl Default for DhtOptions {
    fn default() -> Self {
        DhtOptions {
            port: default_port(),
            id: 0,
            neighbors: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NeighborOptions {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub key_range: KeyRange,
}

pub struct DhtCore {
    local: Arc<DhtNode>,
    neighbors: Vec<Arc<DhtNode>>,
    desc: KeyDescriptor,
    mask_length: u32,
    mask_offset: u32,
    client: DhtClient,
}

impl DhtCore {
    pub fn new(opts: &DhtOptions, desc: KeyDescriptor) -> OpResult<Self> {
        let mask = opts
            .neighbors
            .first()
            .map(|n| n.key_range)
            .unwrap_or_default();
        let local = Arc::new(DhtNode::new(
            "127.0.0.1",
            opts.port,
            KeyRange {
                mask_length: mask.mask_length,
                mask_offset: mask.mask_offset,
                start: opts.id,
                end: opts.id,
            },
            true,
        ));
        let neighbors: Vec<Arc<DhtNode>> = opts
            .neighbors
            .iter()
            .map(|n| {
                Arc::new(DhtNode::new(&n.ip, n.port, n.key_range, false))
            })
            .collect();
        for n in &neighbors {
            info!(
                "dht neighbor {} range [{}, {}]",
                n.addr(),
                n.range().start,
                n.range().end
            );
        }
        let client = DhtClient::new(desc.key_size());
        Ok(DhtCore {
            local,
            neighbors,
            desc,
            mask_length: mask.mask_length,
            mask_offset: mask.mask_offset,
            client,
        })
    }

    #[inline(always)]
    pub fn local_node(&self) -> &Arc<DhtNode> {
        &self.local
    }

    #[inline(always)]
    pub fn neighbors(&self) -> &[Arc<DhtNode>] {
        &self.neighbors
    }

    #[inline(always)]
    pub fn client(&self) -> &DhtClient {
        &self.client
    }

    #[inline(always)]
    pub fn key_descriptor(&self) -> &KeyDescriptor {
        &self.desc
    }

    /// Routing hash of a full key buffer.
    pub fn get_hash(&self, key: &[u8]) -> u64 {
        let pkey = self.desc.primary_of(key);
        masked_hash(
            primary_field_value(pkey),
            self.mask_length,
            self.mask_offset,
        )
    }

    pub fn is_local_key(&self, key: &[u8]) -> bool {
        self.get_hash(key) == self.local.range().start
    }

    /// The node a key is homed on.
    pub fn get_host(&self, key: &[u8]) -> OpResult<Arc<DhtNode>> {
        let hash = self.get_hash(key);
        if hash == self.local.range().start {
            return Ok(self.local.clone());
        }
        match self.neighbors.iter().find(|n| n.owns(hash)) {
            Some(n) => Ok(n.clone()),
            None => {
                warn!("no neighbor owns hash {}", hash);
                fail(StatusCode::UnknownError)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fragstore_core::common::KeyField;
    use ruc::*;

    fn two_node_core(id: u64) -> DhtCore {
        let desc = pnk!(KeyDescriptor::new(&[KeyField {
            size: 8,
            is_primary: true,
        }]));
        let other = 1 - id;
        let opts = DhtOptions {
            port: 0,
            id,
            neighbors: vec![NeighborOptions {
                ip: "127.0.0.1".to_owned(),
                port: 40000,
                key_range: KeyRange {
                    mask_length: 1,
                    mask_offset: 0,
                    start: other,
                    end: other,
                },
            }],
        };
        pnk!(DhtCore::new(&opts, desc))
    }

    fn key(v: u64) -> Vec<u8> {
        v.to_le_bytes().to_vec()
    }

    #[test]
    fn is_local_iff_lookup_is_local() {
        let core = two_node_core(0);
        for v in 0..16u64 {
            let k = key(v);
            let host = pnk!(core.get_host(&k));
            assert_eq!(core.is_local_key(&k), host.is_local());
        }
    }

    #[test]
    fn low_bit_routes_between_two_nodes() {
        let core = two_node_core(0);
        assert!(core.is_local_key(&key(2)));
        assert!(!core.is_local_key(&key(3)));
        assert_eq!(pnk!(core.get_host(&key(3))).port(), 40000);

        let core = two_node_core(1);
        assert!(core.is_local_key(&key(3)));
        assert!(!core.is_local_key(&key(2)));
    }

    #[test]
    fn mask_offset_shifts_the_window() {
        let desc = pnk!(KeyDescriptor::new(&[KeyField {
            size: 8,
            is_primary: true,
        }]));
        let opts = DhtOptions {
            port: 0,
            id: 1,
            neighbors: vec![NeighborOptions {
                ip: "127.0.0.1".to_owned(),
                port: 40001,
                key_range: KeyRange {
                    mask_length: 2,
                    mask_offset: 4,
                    start: 0,
                    end: 0,
                },
            }],
        };
        let core = pnk!(DhtCore::new(&opts, desc));
        // bits [4..6) == 1 → local
        assert!(core.is_local_key(&key(0b01_0000)));
        assert!(!core.is_local_key(&key(0b10_0000)));
    }
}
