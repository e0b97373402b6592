//!
//! The public store façade.
//!
//! Every operation first resolves where the key lives: remote keys go out
//! through the DHT client, local ones fan out into the poller rings.
//! Synchronous calls are the asynchronous path plus a bounded one-shot
//! wait; the work itself always happens on a poller thread.
//!

use crate::options::{
    AllocOptions, GetOptions, OperationalMode, Options, PutOptions,
    UpdateOptions, ATTR_LONG_TERM,
};
use crossbeam_channel::bounded;
use fragstore_core::{
    buffer::{Key, Value},
    common::{fail, KeyDescriptor, OpResult, RawBytes, StatusCode},
    offload::{
        bdev::{BlockDevice, FileBdev, IoBufPool, DEFAULT_BLOCK_SIZE},
        finalize::FinalizePoller,
        free_list::OffloadFreeList,
        poller::OffloadPoller,
    },
    pmem::index::{PmemIndex, ValLocation},
    pmem::pool::PmemPool,
    poller::{self, pmem::PmemPoller, Poller},
    primary::PrimaryKeyQueue,
    rqst::{KvCallback, Rqst, RqstOperation, RQST_POOL},
};
use fragstore_dht::{
    node::DhtNode, DhtCore, DhtServer, DhtServerState, KvDispatcher,
};
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::json;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread::JoinHandle,
    time::Duration,
};

/// How long a synchronous wrapper waits for its completion callback.
const SYNC_TIMEOUT: Duration = Duration::from_secs(1);

/// I/O buffers per direction for the offload tier.
const IO_POOL_SIZE: usize = 256;

struct LocalEngine {
    pool: Arc<PmemPool>,
    index: Arc<PmemIndex>,
    pollers: Vec<Arc<PmemPoller>>,
    offload: Option<Arc<OffloadPoller>>,
    finalize: Option<Arc<FinalizePoller>>,
    ready_keys: Option<Arc<PrimaryKeyQueue>>,
}

pub struct Store {
    options: Options,
    desc: KeyDescriptor,
    dht: Arc<DhtCore>,
    local: Option<LocalEngine>,
    server: Mutex<Option<DhtServer>>,
    keep_running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    rr: AtomicUsize,
    closed: AtomicBool,
}

/// Server-side hook into the store; weak so the endpoint never keeps a
/// closed store alive.
struct Dispatcher {
    store: Weak<Store>,
}

impl Dispatcher {
    /// A peer's key must match this store's declared layout exactly.
    fn checked_key(store: &Store, key: &[u8]) -> OpResult<Key> {
        if key.len() != store.key_size() {
            return fail(StatusCode::NotSupported);
        }
        Ok(Key::new(key.to_vec()))
    }
}

impl KvDispatcher for Dispatcher {
    fn serve_get(&self, key: &[u8]) -> OpResult<RawBytes> {
        let store = self.store.upgrade().ok_or(StatusCode::UnknownError)?;
        let key = Self::checked_key(&store, key)?;
        store.get(&key, &GetOptions::default()).map(Value::into_bytes)
    }

    fn serve_put(&self, key: &[u8], value: &[u8]) -> OpResult<()> {
        let store = self.store.upgrade().ok_or(StatusCode::UnknownError)?;
        let key = Self::checked_key(&store, key)?;
        let value = store.alloc(&key, value.len(), &AllocOptions::default())
            .map(|mut v| {
                v.buf.copy_from_slice(value);
                v
            })?;
        store.put(key, value, &PutOptions::default())
    }

    fn serve_remove(&self, key: &[u8]) -> OpResult<()> {
        let store = self.store.upgrade().ok_or(StatusCode::UnknownError)?;
        let key = Self::checked_key(&store, key)?;
        store.remove(&key)
    }
}

impl Store {
    /// Build the node and bring up its pollers and DHT endpoint.
    pub fn open(options: Options) -> OpResult<Arc<Store>> {
        let desc = KeyDescriptor::new(&options.key.to_fields())?;
        info!(
            "opening store: key {} bytes (primary {} at {}), mode {:?}",
            desc.key_size(),
            desc.primary_size(),
            desc.primary_offset(),
            options.mode
        );

        let keep_running = Arc::new(AtomicBool::new(true));
        let mut threads = Vec::new();

        // the storage engine comes up before any network-facing piece
        let local = match options.mode {
            OperationalMode::Satellite => None,
            OperationalMode::Storage => {
                match Self::open_local(&options, &desc, &keep_running, &mut threads)
                {
                    Ok(engine) => Some(engine),
                    Err(e) => {
                        stop_threads(&keep_running, &mut threads);
                        return Err(e);
                    }
                }
            }
        };

        let dht = match DhtCore::new(&options.dht, desc.clone()) {
            Ok(dht) => Arc::new(dht),
            Err(e) => {
                stop_threads(&keep_running, &mut threads);
                return Err(e);
            }
        };

        let store = Arc::new(Store {
            desc,
            dht,
            local,
            server: Mutex::new(None),
            keep_running,
            threads: Mutex::new(threads),
            rr: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            options,
        });

        if store.options.dht.port != 0
            && store.options.mode == OperationalMode::Storage
        {
            let dispatcher = Arc::new(Dispatcher {
                store: Arc::downgrade(&store),
            });
            match DhtServer::start(store.options.dht.port, dispatcher) {
                Ok(server) => *store.server.lock() = Some(server),
                Err(e) => {
                    store.close();
                    return Err(e);
                }
            }
        }
        Ok(store)
    }

    fn open_local(
        options: &Options,
        desc: &KeyDescriptor,
        keep_running: &Arc<AtomicBool>,
        threads: &mut Vec<JoinHandle<()>>,
    ) -> OpResult<LocalEngine> {
        if options.pmem.pool_path.is_empty() {
            warn!("pmem.pool_path not configured");
            return fail(StatusCode::NotSupported);
        }
        let pool = Arc::new(PmemPool::open(
            &options.pmem.pool_path,
            options.pmem.total_size,
            options.pmem.alloc_unit_size,
            options.pmem.truncate,
        )?);
        let index = Arc::new(PmemIndex::open(pool.clone()));

        let queue_depth = options.runtime.queue_depth.max(2);
        let base_core = options.runtime.base_core;
        let mut core = 0;

        let (offload, finalize) = if options.offload.enabled() {
            let ident = if options.offload.nvme_addr.is_empty() {
                options.offload.dev_path.clone()
            } else {
                options.offload.nvme_addr.clone()
            };
            let bdev: Arc<dyn BlockDevice> = Arc::new(FileBdev::open(
                &options.offload.dev_path,
                options.offload.dev_size,
                DEFAULT_BLOCK_SIZE,
                &ident,
            )?);
            let free_list = Arc::new(OffloadFreeList::open(pool.clone())?);
            if !free_list.is_initialized() {
                free_list.push(-1)?;
            }
            let lba_count =
                options.offload.dev_size / options.offload.alloc_unit_size;
            if free_list.max_lba() < lba_count {
                free_list.set_max_lba(lba_count)?;
            }

            let buf_size = options.offload.alloc_unit_size as usize;
            let read_bufs = Arc::new(IoBufPool::new(IO_POOL_SIZE, buf_size));
            let write_bufs = Arc::new(IoBufPool::new(IO_POOL_SIZE, buf_size));

            let finalize = Arc::new(FinalizePoller::new(
                queue_depth,
                index.clone(),
                free_list.clone(),
                read_bufs.clone(),
                write_bufs.clone(),
                bdev.bus_addr(),
            ));
            let offload = Arc::new(OffloadPoller::new(
                queue_depth,
                index.clone(),
                free_list.clone(),
                bdev,
                finalize.clone(),
                read_bufs,
                write_bufs,
                options.offload.alloc_unit_size,
            )?);

            threads.push(spawn_poller(
                "offload-poller",
                offload.clone(),
                keep_running,
                base_core + core,
            )?);
            core += 1;
            threads.push(spawn_poller(
                "finalize-poller",
                finalize.clone(),
                keep_running,
                base_core + core,
            )?);
            core += 1;
            (Some(offload), Some(finalize))
        } else {
            (None, None)
        };

        let ready_keys = if options.runtime.max_ready_keys > 0 {
            let mask = options
                .dht
                .neighbors
                .first()
                .map(|n| n.key_range)
                .unwrap_or_default();
            Some(Arc::new(PrimaryKeyQueue::new(
                desc,
                options.runtime.max_ready_keys,
                options.dht.id,
                mask.mask_length,
                mask.mask_offset,
            )?))
        } else {
            None
        };

        let mut pollers = Vec::new();
        for i in 0..options.runtime.num_of_pollers.max(1) {
            let p = Arc::new(PmemPoller::new(
                queue_depth,
                index.clone(),
                ready_keys.clone(),
                offload.clone(),
            ));
            threads.push(spawn_poller(
                &format!("pmem-poller-{}", i),
                p.clone(),
                keep_running,
                base_core + core,
            )?);
            core += 1;
            pollers.push(p);
        }

        Ok(LocalEngine {
            pool,
            index,
            pollers,
            offload,
            finalize,
            ready_keys,
        })
    }

    /////////////////////////////////////////////////////////////////////////

    #[inline(always)]
    pub fn key_size(&self) -> usize {
        self.desc.key_size()
    }

    #[inline(always)]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The local engine, iff this key is actually homed here.
    fn local_for(&self, key: &[u8]) -> Option<&LocalEngine> {
        match &self.local {
            Some(engine) if self.dht.is_local_key(key) => Some(engine),
            _ => None,
        }
    }

    fn local_engine(&self) -> OpResult<&LocalEngine> {
        self.local
            .as_ref()
            .ok_or_else(|| StatusCode::NotSupported.into())
    }

    fn remote_node(&self, key: &[u8]) -> OpResult<Arc<DhtNode>> {
        let host = self.dht.get_host(key)?;
        if host.is_local() {
            // satellite configured as its own home: nowhere to forward
            return fail(StatusCode::UnknownError);
        }
        Ok(host)
    }

    fn pick_poller<'a>(
        &self,
        engine: &'a LocalEngine,
        poller_id: Option<usize>,
    ) -> OpResult<&'a Arc<PmemPoller>> {
        match poller_id {
            Some(id) => engine
                .pollers
                .get(id)
                .ok_or_else(|| StatusCode::NotSupported.into()),
            None => {
                let id = self.rr.fetch_add(1, Ordering::Relaxed)
                    % engine.pollers.len();
                Ok(&engine.pollers[id])
            }
        }
    }

    /////////////////////////////////////////////////////////////////////////

    /// Enqueue and wait for the completion callback; expiry leaves the
    /// request in flight and surfaces `TimeOut`.
    fn sync_call<P>(
        &self,
        poller: &P,
        op: RqstOperation,
        key: RawBytes,
        value: RawBytes,
        reserved: Option<u64>,
    ) -> OpResult<RawBytes>
    where
        P: Poller<Rqst = Rqst> + ?Sized,
    {
        let (done, wait) = bounded::<(StatusCode, RawBytes)>(1);
        let cb: KvCallback = Box::new(move |status, _key, value| {
            let _ = done.try_send((status, value.to_vec()));
        });
        let mut rqst = RQST_POOL.take(op, key, value, Some(cb));
        rqst.reserved = reserved;
        if let Err(rqst) = poller.enqueue(rqst) {
            RQST_POOL.put_back(rqst);
            return fail(StatusCode::QueueFullError);
        }
        match wait.recv_timeout(SYNC_TIMEOUT) {
            Ok((status, bytes)) if status.is_ok() => Ok(bytes),
            Ok((status, _)) => fail(status),
            Err(_) => fail(StatusCode::TimeOut),
        }
    }

    /// Fire-and-forget enqueue; ring saturation reports through the
    /// callback, as every other asynchronous failure does.
    fn async_call<P>(
        &self,
        poller: &P,
        op: RqstOperation,
        key: RawBytes,
        value: RawBytes,
        reserved: Option<u64>,
        cb: KvCallback,
    ) where
        P: Poller<Rqst = Rqst> + ?Sized,
    {
        let mut rqst = RQST_POOL.take(op, key, value, Some(cb));
        rqst.reserved = reserved;
        if let Err(mut rqst) = poller.enqueue(rqst) {
            rqst.complete(StatusCode::QueueFullError, &[]);
            RQST_POOL.put_back(rqst);
        }
    }

    /////////////////////////////////////////////////////////////////////////

    pub fn put(
        &self,
        key: Key,
        value: Value,
        options: &PutOptions,
    ) -> OpResult<()> {
        if options.attr & ATTR_LONG_TERM != 0 {
            // values are promoted to the long-term tier via Update
            self.free_key(key);
            return fail(StatusCode::NotImplemented);
        }
        let result = match self.local_for(&key) {
            Some(engine) => {
                let poller = self.pick_poller(engine, options.poller_id)?;
                let reserved = value.reserved;
                self.sync_call(
                    poller.as_ref(),
                    RqstOperation::Put,
                    key.data().to_vec(),
                    value.into_bytes(),
                    reserved,
                )
                .map(|_| ())
            }
            None => self.remote_node(&key).and_then(|node| {
                self.dht.client().put(&node, key.data(), value.data())
            }),
        };
        self.free_key(key);
        result
    }

    pub fn put_async(
        &self,
        key: Key,
        value: Value,
        cb: KvCallback,
        options: &PutOptions,
    ) -> OpResult<()> {
        if options.attr & ATTR_LONG_TERM != 0 {
            self.free_key(key);
            return fail(StatusCode::NotImplemented);
        }
        match self.local_for(&key) {
            Some(engine) => {
                let poller = self.pick_poller(engine, options.poller_id)?;
                let reserved = value.reserved;
                self.async_call(
                    poller.as_ref(),
                    RqstOperation::Put,
                    key.data().to_vec(),
                    value.into_bytes(),
                    reserved,
                    cb,
                );
            }
            None => {
                let status = self
                    .remote_node(&key)
                    .and_then(|node| {
                        self.dht.client().put(&node, key.data(), value.data())
                    })
                    .map(|_| StatusCode::Ok)
                    .unwrap_or_else(|e| e.status);
                cb(status, key.data(), &[]);
            }
        }
        self.free_key(key);
        Ok(())
    }

    pub fn get(&self, key: &Key, options: &GetOptions) -> OpResult<Value> {
        match self.local_for(key) {
            Some(engine) => {
                let bytes = if options.attr & ATTR_LONG_TERM != 0 {
                    let offload = engine
                        .offload
                        .as_deref()
                        .ok_or(StatusCode::OffloadDisabledError)?;
                    self.sync_call(
                        offload,
                        RqstOperation::Get,
                        key.data().to_vec(),
                        Vec::new(),
                        None,
                    )?
                } else {
                    let poller = self.pick_poller(engine, options.poller_id)?;
                    self.sync_call(
                        poller.as_ref(),
                        RqstOperation::Get,
                        key.data().to_vec(),
                        Vec::new(),
                        None,
                    )?
                };
                Ok(Value::new(bytes))
            }
            None => {
                let node = self.remote_node(key)?;
                self.dht.client().get(&node, key.data()).map(Value::new)
            }
        }
    }

    pub fn get_async(
        &self,
        key: &Key,
        cb: KvCallback,
        options: &GetOptions,
    ) -> OpResult<()> {
        match self.local_for(key) {
            Some(engine) => {
                if options.attr & ATTR_LONG_TERM != 0 {
                    let offload = engine
                        .offload
                        .as_deref()
                        .ok_or(StatusCode::OffloadDisabledError)?;
                    self.async_call(
                        offload,
                        RqstOperation::Get,
                        key.data().to_vec(),
                        Vec::new(),
                        None,
                        cb,
                    );
                } else {
                    let poller = self.pick_poller(engine, options.poller_id)?;
                    self.async_call(
                        poller.as_ref(),
                        RqstOperation::Get,
                        key.data().to_vec(),
                        Vec::new(),
                        None,
                        cb,
                    );
                }
            }
            None => {
                let (status, payload) = match self
                    .remote_node(key)
                    .and_then(|node| self.dht.client().get(&node, key.data()))
                {
                    Ok(bytes) => (StatusCode::Ok, bytes),
                    Err(e) => (e.status, Vec::new()),
                };
                cb(status, key.data(), &payload);
            }
        }
        Ok(())
    }

    /// Promote (or overwrite) a value on the long-term tier. `None` value
    /// moves the current pmem-resident bytes.
    pub fn update(
        &self,
        key: &Key,
        value: Option<Value>,
        options: &UpdateOptions,
    ) -> OpResult<()> {
        if options.attr & ATTR_LONG_TERM == 0 {
            // nothing else an update can express yet
            return fail(StatusCode::NotImplemented);
        }
        let engine = match self.local_for(key) {
            Some(engine) => engine,
            None => return fail(StatusCode::NotSupported),
        };
        let offload = engine
            .offload
            .as_deref()
            .ok_or(StatusCode::OffloadDisabledError)?;
        self.sync_call(
            offload,
            RqstOperation::Update,
            key.data().to_vec(),
            value.map(Value::into_bytes).unwrap_or_default(),
            None,
        )
        .map(|_| ())
    }

    pub fn update_async(
        &self,
        key: &Key,
        value: Option<Value>,
        cb: KvCallback,
        options: &UpdateOptions,
    ) -> OpResult<()> {
        if options.attr & ATTR_LONG_TERM == 0 {
            return fail(StatusCode::NotImplemented);
        }
        let engine = match self.local_for(key) {
            Some(engine) => engine,
            None => return fail(StatusCode::NotSupported),
        };
        let offload = engine
            .offload
            .as_deref()
            .ok_or(StatusCode::OffloadDisabledError)?;
        self.async_call(
            offload,
            RqstOperation::Update,
            key.data().to_vec(),
            value.map(Value::into_bytes).unwrap_or_default(),
            None,
            cb,
        );
        Ok(())
    }

    pub fn remove(&self, key: &Key) -> OpResult<()> {
        match self.local_for(key) {
            Some(engine) => {
                let poller = self.pick_poller(engine, None)?;
                self.sync_call(
                    poller.as_ref(),
                    RqstOperation::Remove,
                    key.data().to_vec(),
                    Vec::new(),
                    None,
                )
                .map(|_| ())
            }
            None => {
                let node = self.remote_node(key)?;
                self.dht.client().remove(&node, key.data())
            }
        }
    }

    pub fn remove_async(&self, key: &Key, cb: KvCallback) -> OpResult<()> {
        match self.local_for(key) {
            Some(engine) => {
                let poller = self.pick_poller(engine, None)?;
                self.async_call(
                    poller.as_ref(),
                    RqstOperation::Remove,
                    key.data().to_vec(),
                    Vec::new(),
                    None,
                    cb,
                );
            }
            None => {
                let status = self
                    .remote_node(key)
                    .and_then(|node| {
                        self.dht.client().remove(&node, key.data())
                    })
                    .map(|_| StatusCode::Ok)
                    .unwrap_or_else(|e| e.status);
                cb(status, key.data(), &[]);
            }
        }
        Ok(())
    }

    /// Pop one ready primary key, reconstructed into a full key buffer.
    pub fn get_any(&self, _options: &GetOptions) -> OpResult<Key> {
        let engine = self.local_engine()?;
        let ready = engine
            .ready_keys
            .as_ref()
            .ok_or(StatusCode::NotSupported)?;
        let bytes = ready.dequeue_next()?;
        let mut key = self.alloc_key();
        key.buf.copy_from_slice(&bytes);
        Ok(key)
    }

    pub fn get_any_async(&self, _cb: KvCallback) -> OpResult<()> {
        fail(StatusCode::NotImplemented)
    }

    /// Reserve pool space for this key's value up front.
    pub fn alloc(
        &self,
        key: &Key,
        size: usize,
        _options: &AllocOptions,
    ) -> OpResult<Value> {
        match self.local_for(key) {
            Some(engine) => {
                let off =
                    engine.index.alloc_value_for_key(key, size as u64)?;
                Ok(Value::reserved(vec![0u8; size], off))
            }
            // remote values travel over the wire anyway
            None => Ok(Value::new(vec![0u8; size])),
        }
    }

    /// An engine-owned key sized for this store's layout.
    pub fn alloc_key(&self) -> Key {
        self.dht.client().alloc_key()
    }

    /// Return a key to wherever it came from.
    pub fn free_key(&self, key: Key) {
        self.dht.client().free(key);
    }

    /// Release a value, including an unused pool reservation.
    pub fn free_value(&self, value: Value) -> OpResult<()> {
        if let Some(off) = value.reserved {
            self.local_engine()?.index.free_reserved(off)?;
        }
        Ok(())
    }

    pub fn is_offloaded(&self, key: &Key) -> OpResult<bool> {
        let engine = self.local_engine()?;
        match engine.index.get(key) {
            Ok(ctx) => Ok(ctx.location == ValLocation::Disk),
            Err(_) => Ok(false),
        }
    }

    pub fn get_property(&self, name: &str) -> String {
        match name {
            "fragstore.dht.id" => self.options.dht.id.to_string(),
            "fragstore.dht.port" => self.options.dht.port.to_string(),
            "fragstore.dht.status" => {
                let active = self
                    .server
                    .lock()
                    .as_ref()
                    .map(|s| s.state() == DhtServerState::Ready)
                    .unwrap_or(false);
                format!(
                    "DHT server: {}:{}\nDHT server: {}",
                    self.dht.local_node().ip(),
                    self.options.dht.port,
                    if active { "active" } else { "inactive" }
                )
            }
            "fragstore.dht.neighbours" => {
                let neighbors: Vec<_> = self
                    .dht
                    .neighbors()
                    .iter()
                    .map(|n| {
                        let connected = self.dht.client().ping(n);
                        json!({
                            "ip": n.ip(),
                            "port": n.port(),
                            "session": n.session_id(),
                            "state": n.state().to_string(),
                            "connected": connected,
                        })
                    })
                    .collect();
                json!(neighbors).to_string()
            }
            "fragstore.pmem.path" => self.options.pmem.pool_path.clone(),
            "fragstore.pmem.size" => self.options.pmem.total_size.to_string(),
            "fragstore.pmem.alloc_unit_size" => {
                self.options.pmem.alloc_unit_size.to_string()
            }
            _ => String::new(),
        }
    }

    /// Quiesce pollers, stop the DHT endpoint, flush the pool. Idempotent;
    /// also runs on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing store");
        self.keep_running.store(false, Ordering::Release);
        for t in self.threads.lock().drain(..) {
            let _ = t.join();
        }
        if let Some(engine) = &self.local {
            if let Some(finalize) = &engine.finalize {
                finalize.quiesce();
            }
        }
        if let Some(mut server) = self.server.lock().take() {
            server.stop();
        }
        if let Some(engine) = &self.local {
            if let Err(e) = engine.pool.flush() {
                warn!("pool flush on close failed: {:?}", e.status);
            }
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.close();
    }
}

fn stop_threads(
    keep_running: &Arc<AtomicBool>,
    threads: &mut Vec<JoinHandle<()>>,
) {
    keep_running.store(false, Ordering::Release);
    for t in threads.drain(..) {
        let _ = t.join();
    }
}

fn spawn_poller<P>(
    name: &str,
    p: Arc<P>,
    keep_running: &Arc<AtomicBool>,
    core: usize,
) -> OpResult<JoinHandle<()>>
where
    P: Poller + 'static,
{
    poller::spawn(name, p, keep_running.clone(), Some(core))
        .map_err(|_| StatusCode::UnknownError.into())
}
