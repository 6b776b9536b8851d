/// Process-wide listener statistics
use super::ListenerKind;
use crate::utils::now_secs;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic counters, bumped from every listener
#[derive(Debug)]
pub struct ProcessStats {
    start_time: u64,
    started: Instant,
    admin: AtomicU64,
    tcp: AtomicU64,
    udp: AtomicU64,
    socket: AtomicU64,
    stdin: AtomicU64,
    file: AtomicU64,
    total: AtomicU64,
    failed: AtomicU64,
    last: AtomicU64,
}

/// Point-in-time copy of [`ProcessStats`], as served by the admin interface
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub connections: ConnectionCounters,
    pub start_time: u64,
    pub uptime: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCounters {
    pub admin: u64,
    pub tcp: u64,
    pub udp: u64,
    pub socket: u64,
    pub stdin: u64,
    pub file: u64,
    pub total: u64,
    pub last: u64,
    pub idle: u64,
    pub failed: u64,
}

impl ProcessStats {
    pub fn new() -> Self {
        Self {
            start_time: now_secs(),
            started: Instant::now(),
            admin: AtomicU64::new(0),
            tcp: AtomicU64::new(0),
            udp: AtomicU64::new(0),
            socket: AtomicU64::new(0),
            stdin: AtomicU64::new(0),
            file: AtomicU64::new(0),
            total: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last: AtomicU64::new(0),
        }
    }

    fn counter(&self, kind: ListenerKind) -> &AtomicU64 {
        match kind {
            ListenerKind::Admin => &self.admin,
            ListenerKind::Tcp => &self.tcp,
            ListenerKind::Udp => &self.udp,
            ListenerKind::Socket => &self.socket,
            ListenerKind::Stdin => &self.stdin,
            ListenerKind::File => &self.file,
        }
    }

    /// Record one unit of inbound activity on a listener
    pub fn incr(&self, kind: ListenerKind) {
        self.counter(kind).fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        self.last.store(now_secs(), Ordering::Relaxed);
    }

    /// Record an inbound connection that could not be set up
    pub fn incr_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, kind: ListenerKind) -> u64 {
        self.counter(kind).load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Seconds since startup
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Seconds since the last listener activity, or uptime if there was none
    pub fn idle_secs(&self) -> u64 {
        match self.last.load(Ordering::Relaxed) {
            0 => self.uptime_secs(),
            last => now_secs().saturating_sub(last),
        }
    }

    /// Copy the counters, recomputing uptime and idle time
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: ConnectionCounters {
                admin: self.admin.load(Ordering::Relaxed),
                tcp: self.tcp.load(Ordering::Relaxed),
                udp: self.udp.load(Ordering::Relaxed),
                socket: self.socket.load(Ordering::Relaxed),
                stdin: self.stdin.load(Ordering::Relaxed),
                file: self.file.load(Ordering::Relaxed),
                total: self.total.load(Ordering::Relaxed),
                last: self.last.load(Ordering::Relaxed),
                idle: self.idle_secs(),
                failed: self.failed.load(Ordering::Relaxed),
            },
            start_time: self.start_time,
            uptime: self.uptime_secs(),
        }
    }
}

impl Default for ProcessStats {
    fn default() -> Self {
        Self::new()
    }
}
