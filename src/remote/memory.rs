/// In-memory transport
///
/// Records every write instead of touching the network. Used to embed the
/// pool and dispatcher without sockets, by the benchmarks, and by tests that
/// need to steer buffered bytes or liveness directly.
use super::{BackendAddress, Connection, Endpoint, EndpointFactory, EndpointSettings, EndpointState};
use crate::error::{RelayError, RelayResult};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct MemoryConnection {
    writes: Mutex<Vec<Bytes>>,
    buffered: AtomicUsize,
    destroyed: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every accepted write, in order
    pub fn writes(&self) -> Vec<Bytes> {
        lock(&self.writes).clone()
    }

    /// All accepted bytes, concatenated
    pub fn written(&self) -> Vec<u8> {
        lock(&self.writes).iter().flat_map(|b| b.iter().copied()).collect()
    }

    pub fn set_buffered(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::Release);
    }

    /// Simulate the remote end going away
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
}

impl Connection for MemoryConnection {
    fn write(&self, data: Bytes) -> RelayResult<()> {
        if self.fail_writes.load(Ordering::Acquire) || self.is_destroyed() {
            return Err(RelayError::transport("memory", "write refused"));
        }
        lock(&self.writes).push(data);
        Ok(())
    }

    fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

/// Factory producing endpoints over [`MemoryConnection`]s.
///
/// Addresses are parsed like the real factory. Stream endpoints start up
/// unless `start_down` is set; packet endpoints are always up.
#[derive(Debug, Default)]
pub struct MemoryFactory {
    settings: EndpointSettings,
    start_down: AtomicBool,
    opened: Mutex<Vec<(String, Arc<MemoryConnection>)>>,
}

impl MemoryFactory {
    pub fn new(settings: EndpointSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            ..Default::default()
        })
    }

    /// Subsequent stream endpoints stay down, as if the backend never answered
    pub fn set_start_down(&self, down: bool) {
        self.start_down.store(down, Ordering::Release);
    }

    /// How many times `name` was connected (initial plus reconnects)
    pub fn connect_count(&self, name: &str) -> usize {
        lock(&self.opened).iter().filter(|(n, _)| n == name).count()
    }

    /// Most recent connection opened for `name`
    pub fn connection(&self, name: &str) -> Option<Arc<MemoryConnection>> {
        lock(&self.opened)
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, c)| Arc::clone(c))
    }
}

impl EndpointFactory for MemoryFactory {
    fn connect(&self, name: &str, _reconnect: bool) -> RelayResult<Arc<Endpoint>> {
        let address: BackendAddress = name.parse()?;
        let connection = MemoryConnection::new();
        let endpoint = Endpoint::new(
            name,
            address.kind(),
            connection.clone(),
            EndpointState::new(),
            self.settings,
        );

        if !address.kind().is_stream() || !self.start_down.load(Ordering::Acquire) {
            endpoint.mark_up();
        }

        lock(&self.opened).push((name.to_string(), connection));
        Ok(Arc::new(endpoint))
    }
}
