/// Core abstractions shared by the pool, the dispatcher and the listeners
pub mod stats;

pub use stats::{ConnectionCounters, ProcessStats, StatsSnapshot};

use crate::config::Config;
use crate::metrics::StatsSink;
use crate::remote::Kind;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Type of a local listener, used for per-listener counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerKind {
    Admin,
    Tcp,
    Udp,
    Socket,
    Stdin,
    File,
}

impl ListenerKind {
    /// Whether this listener hands out connections (stream) or raw data
    pub fn kind(&self) -> Kind {
        match self {
            ListenerKind::Udp | ListenerKind::File => Kind::Packet,
            ListenerKind::Admin
            | ListenerKind::Tcp
            | ListenerKind::Socket
            | ListenerKind::Stdin => Kind::Stream,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerKind::Admin => "admin",
            ListenerKind::Tcp => "tcp",
            ListenerKind::Udp => "udp",
            ListenerKind::Socket => "socket",
            ListenerKind::Stdin => "stdin",
            ListenerKind::File => "file",
        }
    }
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local listener as seen by the dispatcher
#[derive(Debug, Clone)]
pub struct Listener {
    pub kind: ListenerKind,
    pub name: String,
}

impl Listener {
    pub fn new<S: Into<String>>(kind: ListenerKind, name: S) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn is_stream(&self) -> bool {
        self.kind.kind().is_stream()
    }
}

/// Process-wide context, built once at startup and handed to every component
pub struct Context {
    config: Config,
    stats: ProcessStats,
    stats_sink: Option<Arc<dyn StatsSink>>,
}

impl Context {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_stats_sink(config, None)
    }

    pub fn with_stats_sink(
        config: Config,
        stats_sink: Option<Arc<dyn StatsSink>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            stats: ProcessStats::new(),
            stats_sink,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &ProcessStats {
        &self.stats
    }

    pub fn stats_sink(&self) -> Option<&Arc<dyn StatsSink>> {
        self.stats_sink.as_ref()
    }

    /// Trace output requested; also unlocks reconnect chatter
    pub fn trace(&self) -> bool {
        self.config.logging.trace
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .field("stats_sink", &self.stats_sink.is_some())
            .finish()
    }
}
