//!
//! A DHT participant as this node sees it.
//!

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DhtNodeState {
    Init,
    Ready,
    NotResponding,
}

impl DhtNodeState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DhtNodeState::Ready,
            2 => DhtNodeState::NotResponding,
            _ => DhtNodeState::Init,
        }
    }
}

impl std::fmt::Display for DhtNodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DhtNodeState::Init => "Not initialized",
            DhtNodeState::Ready => "Ready",
            DhtNodeState::NotResponding => "Not Responding",
        };
        write!(f, "{}", s)
    }
}

/// Hash range a neighbor is responsible for, plus how to extract the hash
/// from a primary field.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct KeyRange {
    #[serde(default)]
    pub mask_length: u32,
    #[serde(default)]
    pub mask_offset: u32,
    #[serde(default)]
    pub start: u64,
    #[serde(default)]
    pub end: u64,
}

#[derive(Debug)]
pub struct DhtNode {
    ip: String,
    port: u16,
    range: KeyRange,
    local: bool,
    state: AtomicU8,
    session_id: AtomicU64,
}

impl DhtNode {
    pub fn new(ip: &str, port: u16, range: KeyRange, local: bool) -> Self {
        DhtNode {
            ip: ip.to_owned(),
            port,
            range,
            local,
            state: AtomicU8::new(DhtNodeState::Init as u8),
            session_id: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn ip(&self) -> &str {
        &self.ip
    }

    #[inline(always)]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline(always)]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    #[inline(always)]
    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    #[inline(always)]
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn state(&self) -> DhtNodeState {
        DhtNodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: DhtNodeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_session(&self) -> u64 {
        self.session_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether `hash` falls inside this neighbor's range.
    #[inline(always)]
    pub fn owns(&self, hash: u64) -> bool {
        self.range.start <= hash && hash <= self.range.end
    }
}
