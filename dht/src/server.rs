//!
//! Inbound side of the DHT: a single-threaded TCP endpoint that parses
//! requests, dispatches them into the store, and serializes the outcome.
//! Store failures never escape; they become non-OK status codes on the
//! wire.
//!

use crate::msg::{self, RequestType};
use fragstore_core::common::{OpResult, RawBytes, StatusCode};
use log::{debug, info, warn};
use std::{
    io::{ErrorKind, Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// What the server calls back into. Implemented by the KV façade; the
/// handlers behave like local API calls made on behalf of the peer.
pub trait KvDispatcher: Send + Sync {
    fn serve_get(&self, key: &[u8]) -> OpResult<RawBytes>;
    fn serve_put(&self, key: &[u8], value: &[u8]) -> OpResult<()>;
    fn serve_remove(&self, key: &[u8]) -> OpResult<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DhtServerState {
    Init,
    Ready,
    Stopped,
    Error,
}

impl DhtServerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DhtServerState::Ready,
            2 => DhtServerState::Stopped,
            3 => DhtServerState::Error,
            _ => DhtServerState::Init,
        }
    }
}

pub struct DhtServer {
    port: u16,
    state: Arc<AtomicU8>,
    keep_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

struct Connection {
    stream: TcpStream,
    rx: Vec<u8>,
}

impl DhtServer {
    /// Bind and start serving. Returns once the event loop is up.
    pub fn start(
        port: u16,
        dispatcher: Arc<dyn KvDispatcher>,
    ) -> OpResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| {
            warn!("dht server cannot bind port {}: {}", port, e);
            StatusCode::Errno(e.raw_os_error().unwrap_or(0))
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|_| StatusCode::UnknownError)?;

        let state = Arc::new(AtomicU8::new(DhtServerState::Init as u8));
        let keep_running = Arc::new(AtomicBool::new(true));

        let loop_state = state.clone();
        let loop_keep = keep_running.clone();
        let thread = thread::Builder::new()
            .name(format!("dht-server-{}", port))
            .spawn(move || {
                serve_loop(listener, dispatcher, loop_state, loop_keep)
            })
            .map_err(|_| StatusCode::UnknownError)?;

        while state.load(Ordering::Acquire) == DhtServerState::Init as u8 {
            thread::sleep(Duration::from_millis(1));
        }
        info!("dht server listening on port {}", port);
        Ok(DhtServer {
            port,
            state,
            keep_running,
            thread: Some(thread),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> DhtServerState {
        DhtServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stop(&mut self) {
        self.keep_running.store(false, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for DhtServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_loop(
    listener: TcpListener,
    dispatcher: Arc<dyn KvDispatcher>,
    state: Arc<AtomicU8>,
    keep_running: Arc<AtomicBool>,
) {
    state.store(DhtServerState::Ready as u8, Ordering::Release);
    let mut conns: Vec<Connection> = Vec::new();
    let mut chunk = [0u8; 16 * 1024];

    while keep_running.load(Ordering::Acquire) {
        let mut idle = true;

        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("dht connection from {}", peer);
                stream.set_nodelay(true).ok();
                if stream.set_nonblocking(true).is_ok() {
                    conns.push(Connection {
                        stream,
                        rx: Vec::new(),
                    });
                }
                idle = false;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!("dht accept failed: {}", e),
        }

        conns.retain_mut(|conn| {
            match pump(conn, &mut chunk, dispatcher.as_ref()) {
                Ok(progress) => {
                    idle &= !progress;
                    true
                }
                Err(()) => false,
            }
        });

        if idle {
            thread::sleep(Duration::from_micros(100));
        }
    }
    state.store(DhtServerState::Stopped as u8, Ordering::Release);
}

/// Drain readable bytes from one connection and answer every complete
/// request found. `Err` drops the connection.
fn pump(
    conn: &mut Connection,
    chunk: &mut [u8],
    dispatcher: &dyn KvDispatcher,
) -> Result<bool, ()> {
    let mut progress = false;
    loop {
        match conn.stream.read(chunk) {
            Ok(0) => return Err(()),
            Ok(n) => {
                conn.rx.extend_from_slice(&chunk[..n]);
                progress = true;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(_) => return Err(()),
        }
    }

    loop {
        match msg::try_parse_request(&conn.rx) {
            Ok(Some((ty, key, value, used))) => {
                conn.rx.drain(..used);
                let resp = dispatch(dispatcher, ty, &key, &value);
                write_response(&mut conn.stream, &resp)?;
                progress = true;
            }
            Ok(None) => break,
            Err(_) => return Err(()), // unparseable peer
        }
    }
    Ok(progress)
}

fn dispatch(
    dispatcher: &dyn KvDispatcher,
    ty: RequestType,
    key: &[u8],
    value: &[u8],
) -> RawBytes {
    let (status, payload) = match ty {
        RequestType::Get => match dispatcher.serve_get(key) {
            Ok(value) => (StatusCode::Ok, value),
            Err(e) => (e.status, Vec::new()),
        },
        RequestType::Put => match dispatcher.serve_put(key, value) {
            Ok(()) => (StatusCode::Ok, Vec::new()),
            Err(e) => (e.status, Vec::new()),
        },
        RequestType::Remove => match dispatcher.serve_remove(key) {
            Ok(()) => (StatusCode::Ok, Vec::new()),
            Err(e) => (e.status, Vec::new()),
        },
    };
    msg::encode_response(status, &payload)
}

/// The socket is nonblocking; spin briefly through WouldBlock so short
/// responses go out whole.
fn write_response(stream: &mut TcpStream, resp: &[u8]) -> Result<(), ()> {
    let mut sent = 0;
    while sent < resp.len() {
        match stream.write(&resp[sent..]) {
            Ok(n) => sent += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_micros(10));
            }
            Err(_) => return Err(()),
        }
    }
    Ok(())
}
