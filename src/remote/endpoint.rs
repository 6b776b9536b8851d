/// A single outbound backend: connection plus availability and usage state
use super::{Connection, Kind};
use crate::config::RelayConfig;
use crate::utils::now_secs;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Transport tuning applied to every endpoint
#[derive(Debug, Clone, Copy)]
pub struct EndpointSettings {
    /// Buffered outbound bytes above which a stream endpoint is slow
    pub max_buffer_size: usize,
    /// Largest datagram payload for packet endpoints
    pub max_packet_size: usize,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for EndpointSettings {
    fn from(relay: &RelayConfig) -> Self {
        Self {
            max_buffer_size: relay.max_buffer_size,
            max_packet_size: relay.udp_max_size.max(1),
        }
    }
}

/// Availability and usage state of one endpoint.
///
/// Shared with the connection's background task, which flips it when the
/// connect completes or a datagram send fails. Every `mark_up`/`mark_down`
/// call counts as a state change, even when the flag already had that value.
#[derive(Debug)]
pub struct EndpointState {
    down: AtomicBool,
    slow: AtomicBool,
    state_changed_at: AtomicU64,
    state_changes: AtomicU64,
    last_sent_at: AtomicU64,
    messages: AtomicU64,
}

impl EndpointState {
    /// New endpoints start down until their transport reports connected
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            down: AtomicBool::new(true),
            slow: AtomicBool::new(false),
            state_changed_at: AtomicU64::new(now_secs()),
            state_changes: AtomicU64::new(0),
            last_sent_at: AtomicU64::new(0),
            messages: AtomicU64::new(0),
        })
    }

    fn record_change(&self) {
        self.state_changed_at.store(now_secs(), Ordering::Relaxed);
        self.state_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_up(&self, name: &str) {
        trace!("HEALTHY: {}", name);
        self.down.store(false, Ordering::Release);
        self.record_change();
    }

    pub fn mark_down(&self, name: &str) {
        trace!("UNHEALTHY: {}", name);
        self.down.store(true, Ordering::Release);
        self.record_change();
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    pub fn is_slow(&self) -> bool {
        self.slow.load(Ordering::Acquire)
    }

    /// Set the slow flag; returns true if this was a transition
    fn set_slow(&self, slow: bool) -> bool {
        let previous = self.slow.swap(slow, Ordering::AcqRel);
        if previous != slow {
            self.record_change();
            true
        } else {
            false
        }
    }

    pub fn state_changes(&self) -> u64 {
        self.state_changes.load(Ordering::Relaxed)
    }

    fn touch_last_sent(&self) {
        self.last_sent_at.store(now_secs(), Ordering::Relaxed);
    }

    fn incr_messages(&self) {
        self.touch_last_sent();
        self.messages.fetch_add(1, Ordering::Relaxed);
    }
}

/// Diagnostics for one endpoint, as served by the admin interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub available: bool,
    pub slow: bool,
    pub down: bool,
    /// Unix seconds of the last send, if anything was ever sent
    pub last_sent: Option<u64>,
    pub messages: u64,
    pub state_changes: u64,
    pub seconds_since_state_change: u64,
    pub idle_seconds: u64,
}

/// One outbound backend.
///
/// The connection is owned for the endpoint's whole life; a reconnect builds
/// a new `Endpoint` rather than touching this one.
pub struct Endpoint {
    name: String,
    kind: Kind,
    connection: Arc<dyn Connection>,
    state: Arc<EndpointState>,
    settings: EndpointSettings,
}

impl Endpoint {
    pub fn new<S: Into<String>>(
        name: S,
        kind: Kind,
        connection: Arc<dyn Connection>,
        state: Arc<EndpointState>,
        settings: EndpointSettings,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            connection,
            state,
            settings,
        }
    }

    /// Configured backend address; the endpoint's identity
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn is_stream(&self) -> bool {
        self.kind.is_stream()
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn state(&self) -> &Arc<EndpointState> {
        &self.state
    }

    pub fn settings(&self) -> &EndpointSettings {
        &self.settings
    }

    pub fn is_down(&self) -> bool {
        self.state.is_down()
    }

    pub fn is_slow(&self) -> bool {
        self.state.is_slow()
    }

    pub fn is_available(&self) -> bool {
        !self.is_down() && !self.is_slow()
    }

    pub fn mark_up(&self) {
        self.state.mark_up(&self.name);
    }

    pub fn mark_down(&self) {
        self.state.mark_down(&self.name);
    }

    /// Compare the outbound buffer against `max_buffer_size`.
    ///
    /// Only a crossing of the threshold counts as a state change. Packet
    /// endpoints are never slow.
    pub fn check_if_slow(&self) -> bool {
        if !self.is_stream() {
            return false;
        }

        let buffered = self.connection.buffered_bytes();
        let slow = buffered > self.settings.max_buffer_size;

        if self.state.set_slow(slow) {
            if slow {
                warn!(
                    "{} is slow: {} bytes buffered (max {})",
                    self.name, buffered, self.settings.max_buffer_size
                );
            } else {
                debug!("{} caught up: {} bytes buffered", self.name, buffered);
            }
        }

        slow
    }

    /// Send one unit of data.
    ///
    /// Streams get the bytes as-is. Packet endpoints split the payload into
    /// datagrams of at most `max_packet_size` bytes; a failed send marks the
    /// endpoint down, although a successful one proves nothing about delivery.
    pub fn send(&self, data: Bytes) {
        match self.kind {
            Kind::Stream => {
                if let Err(e) = self.connection.write(data) {
                    // the health check's liveness probe catches dead streams
                    trace!("{}", e);
                }
            }
            Kind::Packet => self.send_packets(data),
        }
    }

    fn send_packets(&self, data: Bytes) {
        let max = self.settings.max_packet_size;
        let len = data.len();

        if len <= max {
            self.send_packet(data);
            return;
        }

        trace!(
            "Packet too large for UDP ({}), breaking up in {} slices of {}",
            len,
            len.div_ceil(max),
            max
        );

        let mut start = 0;
        while start < len {
            let end = (start + max).min(len);
            if !self.send_packet(data.slice(start..end)) {
                return;
            }
            start = end;
        }
    }

    fn send_packet(&self, chunk: Bytes) -> bool {
        match self.connection.write(chunk) {
            Ok(()) => true,
            Err(e) => {
                warn!("{}", e);
                if !self.is_down() {
                    self.mark_down();
                }
                false
            }
        }
    }

    /// Bookkeeping for one dispatch to this endpoint
    pub fn incr_stats(&self) {
        self.state.incr_messages();
    }

    /// Bookkeeping for one forwarded chunk of an inbound stream
    pub fn touch_last_sent(&self) {
        self.state.touch_last_sent();
    }

    /// Snapshot of this endpoint's diagnostics. `uptime` is reported as the
    /// idle time if nothing was ever sent.
    pub fn stats(&self, uptime: u64) -> EndpointStats {
        let now = now_secs();
        let last_sent = match self.state.last_sent_at.load(Ordering::Relaxed) {
            0 => None,
            at => Some(at),
        };

        EndpointStats {
            available: self.is_available(),
            slow: self.is_slow(),
            down: self.is_down(),
            last_sent,
            messages: self.state.messages.load(Ordering::Relaxed),
            state_changes: self.state.state_changes(),
            seconds_since_state_change: now
                .saturating_sub(self.state.state_changed_at.load(Ordering::Relaxed)),
            idle_seconds: last_sent.map_or(uptime, |at| now.saturating_sub(at)),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("down", &self.is_down())
            .field("slow", &self.is_slow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryConnection;

    fn endpoint(kind: Kind, settings: EndpointSettings) -> (Endpoint, Arc<MemoryConnection>) {
        let conn = MemoryConnection::new();
        let ep = Endpoint::new("test", kind, conn.clone(), EndpointState::new(), settings);
        (ep, conn)
    }

    #[test]
    fn test_new_endpoint_starts_down() {
        let (ep, _) = endpoint(Kind::Stream, EndpointSettings::default());
        assert!(ep.is_down());
        assert!(!ep.is_available());
        assert_eq!(ep.stats(7).state_changes, 0);
    }

    #[test]
    fn test_mark_calls_always_count() {
        let (ep, _) = endpoint(Kind::Stream, EndpointSettings::default());
        ep.mark_up();
        ep.mark_up();
        assert!(ep.is_available());
        assert_eq!(ep.state().state_changes(), 2);

        ep.mark_down();
        assert!(!ep.is_available());
        assert_eq!(ep.state().state_changes(), 3);
    }

    #[test]
    fn test_check_if_slow_is_edge_triggered() {
        let settings = EndpointSettings {
            max_buffer_size: 10,
            max_packet_size: 512,
        };
        let (ep, conn) = endpoint(Kind::Stream, settings);
        ep.mark_up();
        let base = ep.state().state_changes();

        conn.set_buffered(11);
        assert!(ep.check_if_slow());
        assert!(ep.check_if_slow());
        assert!(!ep.is_available());
        assert!(!ep.is_down());
        assert_eq!(ep.state().state_changes(), base + 1);

        conn.set_buffered(10);
        assert!(!ep.check_if_slow());
        assert!(!ep.check_if_slow());
        assert!(ep.is_available());
        assert_eq!(ep.state().state_changes(), base + 2);
    }

    #[test]
    fn test_packet_endpoint_is_never_slow() {
        let settings = EndpointSettings {
            max_buffer_size: 0,
            max_packet_size: 512,
        };
        let (ep, conn) = endpoint(Kind::Packet, settings);
        conn.set_buffered(1_000);
        assert!(!ep.check_if_slow());
        assert!(!ep.is_slow());
    }

    #[test]
    fn test_stream_send_is_not_chunked() {
        let settings = EndpointSettings {
            max_buffer_size: 1024,
            max_packet_size: 2,
        };
        let (ep, conn) = endpoint(Kind::Stream, settings);
        ep.send(Bytes::from_static(b"hello"));
        assert_eq!(conn.writes(), vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn test_udp_chunking_hello() {
        let settings = EndpointSettings {
            max_buffer_size: 1024,
            max_packet_size: 2,
        };
        let (ep, conn) = endpoint(Kind::Packet, settings);
        ep.send(Bytes::from_static(b"hello"));

        let lengths: Vec<usize> = conn.writes().iter().map(|b| b.len()).collect();
        assert_eq!(lengths, vec![2, 2, 1]);
        assert_eq!(conn.written(), b"hello".to_vec());
    }

    #[test]
    fn test_udp_chunking_two_and_a_half_packets() {
        let max = 512;
        let settings = EndpointSettings {
            max_buffer_size: 1024,
            max_packet_size: max,
        };
        let (ep, conn) = endpoint(Kind::Packet, settings);
        let payload: Vec<u8> = (0..(max * 5 / 2)).map(|i| (i % 251) as u8).collect();
        ep.send(Bytes::from(payload.clone()));

        let writes = conn.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes.iter().map(|b| b.len()).sum::<usize>(), payload.len());
        assert_eq!(conn.written(), payload);
    }

    #[test]
    fn test_udp_exact_multiple_has_no_empty_tail() {
        let settings = EndpointSettings {
            max_buffer_size: 1024,
            max_packet_size: 4,
        };
        let (ep, conn) = endpoint(Kind::Packet, settings);
        ep.send(Bytes::from_static(b"abcdefgh"));
        assert_eq!(conn.writes().len(), 2);
    }

    #[test]
    fn test_udp_send_failure_marks_down_once() {
        let (ep, conn) = endpoint(Kind::Packet, EndpointSettings::default());
        ep.mark_up();
        conn.fail_writes(true);

        ep.send(Bytes::from_static(b"x"));
        assert!(ep.is_down());
        let changes = ep.state().state_changes();

        ep.send(Bytes::from_static(b"y"));
        assert_eq!(ep.state().state_changes(), changes);
    }

    #[test]
    fn test_stream_send_failure_keeps_state() {
        let (ep, conn) = endpoint(Kind::Stream, EndpointSettings::default());
        ep.mark_up();
        conn.fail_writes(true);

        ep.send(Bytes::from_static(b"x"));
        assert!(ep.is_available());
    }

    #[test]
    fn test_stats_idle_defaults_to_uptime() {
        let (ep, _) = endpoint(Kind::Stream, EndpointSettings::default());
        let stats = ep.stats(42);
        assert_eq!(stats.last_sent, None);
        assert_eq!(stats.idle_seconds, 42);
        assert_eq!(stats.messages, 0);

        ep.incr_stats();
        ep.incr_stats();
        let stats = ep.stats(42);
        assert_eq!(stats.messages, 2);
        assert!(stats.last_sent.is_some());
        assert!(stats.idle_seconds < 42);
    }
}
