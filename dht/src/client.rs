//!
//! Outbound side of the DHT: one lazily-connected session per neighbor,
//! synchronous request/response with a bounded wait, and a transmit arena
//! so hot-path key allocation recycles buffers instead of hitting the heap.
//!

use crate::msg::{self, RequestType};
use crate::node::{DhtNode, DhtNodeState};
use fragstore_core::buffer::{Key, KeyValAttribute};
use fragstore_core::common::{fail, OpResult, RawBytes, StatusCode};
use crossbeam_queue::SegQueue;
use log::{debug, warn};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::Arc,
    time::Duration,
};

/// How long a synchronous call waits for the peer.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Transmit-arena buffers kept warm.
const ARENA_CAPACITY: usize = 1024;

struct Session {
    stream: Mutex<Option<TcpStream>>,
}

pub struct DhtClient {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    arena: SegQueue<RawBytes>,
    key_size: usize,
}

impl DhtClient {
    pub fn new(key_size: usize) -> Self {
        DhtClient {
            sessions: Mutex::new(HashMap::new()),
            arena: SegQueue::new(),
            key_size,
        }
    }

    /// An engine-owned key from the transmit arena; return it with `free`.
    pub fn alloc_key(&self) -> Key {
        match self.arena.pop() {
            Some(mut buf) => {
                buf.clear();
                buf.resize(self.key_size, 0);
                Key::buffered(buf)
            }
            None => Key::buffered(vec![0u8; self.key_size]),
        }
    }

    /// Return an engine-owned key to the arena; caller-owned keys just drop.
    pub fn free(&self, key: Key) {
        if key.attr == KeyValAttribute::Buffered
            && self.arena.len() < ARENA_CAPACITY
        {
            self.arena.push(key.into_bytes());
        }
    }

    pub fn put(&self, node: &DhtNode, key: &[u8], value: &[u8]) -> OpResult<()> {
        self.call(node, RequestType::Put, key, value).map(|_| ())
    }

    pub fn get(&self, node: &DhtNode, key: &[u8]) -> OpResult<RawBytes> {
        self.call(node, RequestType::Get, key, &[])
    }

    pub fn remove(&self, node: &DhtNode, key: &[u8]) -> OpResult<()> {
        self.call(node, RequestType::Remove, key, &[]).map(|_| ())
    }

    /// Probe (and repair) the session to a neighbor.
    pub fn ping(&self, node: &DhtNode) -> bool {
        let session = self.session_of(node);
        let mut stream = session.stream.lock();
        match Self::ensure_connected(&mut stream, node) {
            Ok(()) => {
                node.set_state(DhtNodeState::Ready);
                true
            }
            Err(_) => {
                node.set_state(DhtNodeState::NotResponding);
                false
            }
        }
    }

    fn session_of(&self, node: &DhtNode) -> Arc<Session> {
        let mut sessions = self.sessions.lock();
        sessions
            .entry(node.addr())
            .or_insert_with(|| {
                Arc::new(Session {
                    stream: Mutex::new(None),
                })
            })
            .clone()
    }

    fn ensure_connected(
        stream: &mut Option<TcpStream>,
        node: &DhtNode,
    ) -> OpResult<()> {
        if stream.is_some() {
            return Ok(());
        }
        let addr: SocketAddr = node
            .addr()
            .parse()
            .map_err(|_| StatusCode::NotSupported)?;
        let s = TcpStream::connect_timeout(&addr, RESPONSE_TIMEOUT)
            .map_err(|_| StatusCode::TimeOut)?;
        s.set_read_timeout(Some(RESPONSE_TIMEOUT)).ok();
        s.set_write_timeout(Some(RESPONSE_TIMEOUT)).ok();
        s.set_nodelay(true).ok();
        let id = node.bump_session();
        debug!("dht session {} to {} established", id, node.addr());
        *stream = Some(s);
        Ok(())
    }

    /// One request/response exchange. Transport failures tear the session
    /// down and retry once on a fresh connection before giving up.
    fn call(
        &self,
        node: &DhtNode,
        ty: RequestType,
        key: &[u8],
        value: &[u8],
    ) -> OpResult<RawBytes> {
        let session = self.session_of(node);
        let mut stream = session.stream.lock();

        let mut last_err = StatusCode::TimeOut;
        for attempt in 0..2 {
            if let Err(e) = Self::ensure_connected(&mut stream, node) {
                node.set_state(DhtNodeState::NotResponding);
                return Err(e);
            }
            match Self::exchange(stream.as_mut().unwrap(), ty, key, value) {
                Ok((status, payload)) => {
                    node.set_state(DhtNodeState::Ready);
                    return if status.is_ok() {
                        Ok(payload)
                    } else {
                        // application-level failure, propagated verbatim
                        fail(status)
                    };
                }
                Err(e) => {
                    warn!(
                        "dht call to {} failed (attempt {}): {:?}",
                        node.addr(),
                        attempt,
                        e.status
                    );
                    *stream = None;
                    last_err = e.status;
                }
            }
        }
        node.set_state(DhtNodeState::NotResponding);
        fail(last_err)
    }

    fn exchange(
        stream: &mut TcpStream,
        ty: RequestType,
        key: &[u8],
        value: &[u8],
    ) -> OpResult<(StatusCode, RawBytes)> {
        stream
            .write_all(&msg::encode_request(ty, key, value))
            .map_err(|_| StatusCode::TimeOut)?;

        let mut buf = Vec::with_capacity(msg::RESP_HDR_SIZE);
        let mut chunk = [0u8; 4096];
        loop {
            if let Some((status, payload, _)) = msg::try_parse_response(&buf)? {
                return Ok((status, payload));
            }
            let n = stream
                .read(&mut chunk)
                .map_err(|_| StatusCode::TimeOut)?;
            if n == 0 {
                return fail(StatusCode::TimeOut);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }
}
