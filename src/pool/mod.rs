/// Remote pool: topology, endpoints, live set and the monitors that keep
/// them current
///
/// The pool owns one [`Endpoint`] per unique backend address. A periodic
/// health check walks every group in configured order and picks the first
/// usable endpoint; the resulting live set is published wholesale through an
/// `ArcSwap` so dispatchers always read a complete snapshot. A second
/// periodic task replaces endpoints that are down with fresh connections.
use crate::config::Topology;
use crate::core::Context;
use crate::error::RelayResult;
use crate::metrics::counter_line;
use crate::remote::{Endpoint, EndpointFactory, TransportFactory};
use arc_swap::ArcSwap;
use fnv::FnvHashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// One chosen endpoint per healthy group, in topology order, optionally
/// followed by the overflow endpoint
pub type LiveSet = Vec<Arc<Endpoint>>;

/// Aggregate health counters, as last computed by the monitors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounters {
    pub healthy_remotes: u64,
    pub unhealthy_remotes: u64,
    pub slow_remotes: u64,
    pub unavailable_remotes: u64,
    pub healthy_chains: u64,
    pub unhealthy_chains: u64,
}

#[derive(Debug, Default)]
struct Counters {
    healthy_remotes: AtomicU64,
    unhealthy_remotes: AtomicU64,
    slow_remotes: AtomicU64,
    unavailable_remotes: AtomicU64,
    healthy_chains: AtomicU64,
    unhealthy_chains: AtomicU64,
}

#[derive(Default)]
struct Monitors {
    startup: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    statsd: Option<JoinHandle<()>>,
}

impl Monitors {
    fn handles(&mut self) -> impl Iterator<Item = JoinHandle<()>> {
        [
            self.startup.take(),
            self.health.take(),
            self.reconnect.take(),
            self.statsd.take(),
        ]
        .into_iter()
        .flatten()
    }
}

pub struct RemotePool {
    ctx: Arc<Context>,
    topology: Topology,
    overflow: Option<String>,
    factory: Arc<dyn EndpointFactory>,
    endpoints: RwLock<FnvHashMap<String, Arc<Endpoint>>>,
    live: ArcSwap<LiveSet>,
    /// Chain health as of the previous health check, for edge-triggered logs
    chains: tokio::sync::Mutex<Vec<bool>>,
    counters: Counters,
    monitors: Mutex<Monitors>,
}

impl RemotePool {
    pub fn new(ctx: Arc<Context>, factory: Arc<dyn EndpointFactory>) -> Arc<Self> {
        let topology = ctx.config().servers.clone();
        let overflow = ctx.config().overflow.clone();

        Arc::new(Self {
            ctx,
            topology,
            overflow,
            factory,
            endpoints: RwLock::new(FnvHashMap::default()),
            live: ArcSwap::from_pointee(Vec::new()),
            chains: tokio::sync::Mutex::new(Vec::new()),
            counters: Counters::default(),
            monitors: Mutex::new(Monitors::default()),
        })
    }

    /// Pool backed by real sockets and files
    pub fn with_transports(ctx: Arc<Context>) -> Arc<Self> {
        let factory = Arc::new(TransportFactory::new(Arc::clone(&ctx)));
        Self::new(ctx, factory)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn overflow(&self) -> Option<&str> {
        self.overflow.as_deref()
    }

    fn connect_endpoint(&self, name: &str, reconnect: bool) -> RelayResult<Arc<Endpoint>> {
        // reconnects are noisy, only show them when tracing
        if self.ctx.trace() {
            let pre = if reconnect { "Re-" } else { "" };
            trace!("{}Connecting to remote {}", pre, name);
        } else if !reconnect {
            info!("RemotePool: Connecting to remote {}", name);
        }

        self.factory.connect(name, reconnect)
    }

    /// Connect every backend in the topology (and the overflow sink) that
    /// has no endpoint yet, schedule the monitors and call `on_ready`.
    ///
    /// Connections complete in the background; none is guaranteed to be up
    /// when `on_ready` runs. A malformed address aborts with an error.
    pub async fn connect_to_servers<F>(self: &Arc<Self>, on_ready: F) -> RelayResult<()>
    where
        F: FnOnce(&Arc<Self>),
    {
        {
            let mut endpoints = self.endpoints.write().await;
            let names = self
                .topology
                .backends()
                .map(|(_, name)| name)
                .chain(self.overflow.as_deref());

            for name in names {
                if endpoints.contains_key(name) {
                    continue;
                }
                let endpoint = self.connect_endpoint(name, false)?;
                endpoints.insert(name.to_string(), endpoint);
            }
        }

        let delay = self.ctx.config().pool.monitor_delay();
        let pool = Arc::downgrade(self);
        let startup = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(pool) = pool.upgrade() {
                pool.install_monitors();
            }
        });
        if let Some(previous) = self.lock_monitors().startup.replace(startup) {
            previous.abort();
        }

        on_ready(self);
        Ok(())
    }

    fn lock_monitors(&self) -> std::sync::MutexGuard<'_, Monitors> {
        self.monitors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the periodic tasks. Each one is started at most once per pool.
    pub fn install_monitors(self: &Arc<Self>) {
        let pool_config = &self.ctx.config().pool;
        let mut monitors = self.lock_monitors();

        if monitors.health.is_none() {
            trace!("Installing health checks");
            let health = self.spawn_periodic(pool_config.monitor_interval(), |pool| {
                Box::pin(async move { pool.refresh_live_set().await })
            });
            monitors.health = Some(health);
        }

        if monitors.reconnect.is_none() {
            trace!("Installing reconnect monitor");
            let reconnect = self.spawn_periodic(pool_config.reconnect_interval(), |pool| {
                Box::pin(async move { pool.reconnect_to_servers().await })
            });
            monitors.reconnect = Some(reconnect);
        }

        if self.ctx.stats_sink().is_some() && monitors.statsd.is_none() {
            trace!("Installing statsd metrics");
            let statsd = self.spawn_periodic(pool_config.statsd_interval(), |pool| {
                Box::pin(async move { pool.send_health_stats() })
            });
            monitors.statsd = Some(statsd);
        }
    }

    /// Whether the health and reconnect monitors are running
    pub fn monitors_installed(&self) -> bool {
        let monitors = self.lock_monitors();
        monitors.health.is_some() && monitors.reconnect.is_some()
    }

    /// Run `tick` every `period`, first after one full period. The task
    /// holds only a weak reference and ends once the pool is dropped.
    fn spawn_periodic<F>(self: &Arc<Self>, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let pool: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match pool.upgrade() {
                    Some(pool) => tick(pool).await,
                    None => break,
                }
            }
        })
    }

    /// Pick the first usable endpoint of every group.
    ///
    /// Calls `check_if_slow` on every endpoint it visits. An available
    /// endpoint whose transport is gone is marked down and skipped. Groups
    /// without a usable endpoint contribute nothing; if there are any and
    /// the overflow endpoint is usable, it is appended once.
    pub async fn health_check(&self) -> LiveSet {
        let endpoints = self.endpoints.read().await;
        let mut live = Vec::with_capacity(self.topology.len() + 1);
        let mut chain_health = Vec::with_capacity(self.topology.len());

        for group in self.topology.groups() {
            let chosen = group
                .iter()
                .filter_map(|name| endpoints.get(name))
                .find(|endpoint| Self::is_usable(endpoint));

            chain_health.push(chosen.is_some());
            if let Some(endpoint) = chosen {
                live.push(Arc::clone(endpoint));
            }
        }

        let healthy = chain_health.iter().filter(|h| **h).count() as u64;
        let unhealthy = chain_health.len() as u64 - healthy;
        self.counters.healthy_chains.store(healthy, Ordering::Relaxed);
        self.counters.unhealthy_chains.store(unhealthy, Ordering::Relaxed);

        if unhealthy > 0 {
            match self.overflow.as_deref().and_then(|name| endpoints.get(name)) {
                Some(overflow) if Self::is_usable(overflow) => live.push(Arc::clone(overflow)),
                _ => trace!("No overflow stream; dropping messages to {} chain(s)", unhealthy),
            }
        }

        let mut previous = self.chains.lock().await;
        for (id, (now, before)) in chain_health.iter().zip(previous.iter()).enumerate() {
            if now != before {
                if *now {
                    error!("Chain id {} recovered - traffic resuming", id);
                } else {
                    error!("Chain id {} has no healthy servers - dropping traffic", id);
                }
            }
        }
        *previous = chain_health;

        live
    }

    fn is_usable(endpoint: &Endpoint) -> bool {
        endpoint.check_if_slow();
        if !endpoint.is_available() {
            return false;
        }
        if endpoint.connection().is_destroyed() {
            debug!("Server {} unavailable - marking for reconnect", endpoint.name());
            endpoint.mark_down();
            return false;
        }
        true
    }

    /// Recompute and publish the live set
    pub async fn refresh_live_set(&self) {
        let live = self.health_check().await;
        self.live.store(Arc::new(live));
    }

    /// Snapshot of the live set as of the last health check
    pub fn live_set(&self) -> Arc<LiveSet> {
        self.live.load_full()
    }

    /// Replace every endpoint that is down with a fresh connection.
    ///
    /// A file sink whose file was renamed or removed (log rotation) is
    /// marked down first, so it is reopened at its configured path. Slow
    /// endpoints that are still up keep their connection. Failures to build
    /// a replacement are logged and retried on the next tick.
    pub async fn reconnect_to_servers(&self) {
        let mut up = 0;
        let mut slow = 0;
        let mut down = Vec::new();

        {
            let endpoints = self.endpoints.read().await;
            for (name, endpoint) in endpoints.iter() {
                if !endpoint.is_down() && endpoint.connection().rotated().await {
                    info!("RemotePool: {} was rotated - reopening", name);
                    endpoint.mark_down();
                }
                if endpoint.is_down() {
                    down.push(name.clone());
                } else if endpoint.is_slow() {
                    slow += 1;
                } else {
                    up += 1;
                }
            }
        }

        let unavailable = down.len() as u64;
        for name in down {
            match self.connect_endpoint(&name, true) {
                Ok(endpoint) => {
                    self.endpoints.write().await.insert(name, endpoint);
                }
                Err(e) => warn!("RemotePool: Could not reconnect to {}: {}", name, e),
            }
        }

        self.counters.healthy_remotes.store(up, Ordering::Relaxed);
        self.counters.unhealthy_remotes.store(unavailable + slow, Ordering::Relaxed);
        self.counters.slow_remotes.store(slow, Ordering::Relaxed);
        self.counters.unavailable_remotes.store(unavailable, Ordering::Relaxed);

        if unavailable > 0 {
            trace!("Attempted to reconnect {} nodes", unavailable);
        }
        if slow > 0 {
            trace!("Currently {} slow nodes", slow);
        }
    }

    /// Push the aggregate counters to the stats sink, if there is one
    pub fn send_health_stats(&self) {
        let Some(sink) = self.ctx.stats_sink() else {
            return;
        };
        let (prefix, suffix) = match &self.ctx.config().statsd {
            Some(statsd) => (statsd.prefix.as_str(), statsd.suffix.as_str()),
            None => ("", ""),
        };

        let counters = self.counters();
        let lines = [
            ("pool.remotes.healthy", counters.healthy_remotes),
            ("pool.remotes.unhealthy", counters.unhealthy_remotes),
            ("pool.remotes.slow", counters.slow_remotes),
            ("pool.remotes.unavailable", counters.unavailable_remotes),
            ("pool.chains.healthy", counters.healthy_chains),
            ("pool.chains.unhealthy", counters.unhealthy_chains),
        ];
        for (name, value) in lines {
            sink.send(&counter_line(prefix, name, suffix, value));
        }
    }

    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            healthy_remotes: self.counters.healthy_remotes.load(Ordering::Relaxed),
            unhealthy_remotes: self.counters.unhealthy_remotes.load(Ordering::Relaxed),
            slow_remotes: self.counters.slow_remotes.load(Ordering::Relaxed),
            unavailable_remotes: self.counters.unavailable_remotes.load(Ordering::Relaxed),
            healthy_chains: self.counters.healthy_chains.load(Ordering::Relaxed),
            unhealthy_chains: self.counters.unhealthy_chains.load(Ordering::Relaxed),
        }
    }

    /// Every known endpoint, sorted by address
    pub async fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        let endpoints = self.endpoints.read().await;
        let mut all: Vec<_> = endpoints.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub async fn endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.read().await.get(name).cloned()
    }

    /// Stop all periodic tasks. Open connections are left to drop with
    /// the pool.
    pub fn shutdown(&self) {
        for handle in self.lock_monitors().handles() {
            handle.abort();
        }
        debug!("RemotePool: monitors stopped");
    }
}

impl std::fmt::Debug for RemotePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePool")
            .field("topology", &self.topology)
            .field("overflow", &self.overflow)
            .field("live", &self.live.load().len())
            .finish()
    }
}
