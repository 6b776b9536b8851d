/// External stats collector
///
/// The pool pushes its health counters through a [`StatsSink`] on the
/// stats-flush tick. The only real sink is statsd over UDP, which reuses the
/// packet endpoint machinery.
use crate::config::StatsdConfig;
use crate::remote::packet::UdpConnection;
use crate::remote::{Endpoint, EndpointSettings, EndpointState, Kind, LogPolicy};
use bytes::Bytes;
use std::sync::Arc;

/// Fire-and-forget receiver of metric lines
pub trait StatsSink: Send + Sync {
    fn send(&self, line: &str);
}

/// Render one counter in statsd line format
pub fn counter_line(prefix: &str, name: &str, suffix: &str, value: u64) -> String {
    format!("{}{}{}:{}|c\n", prefix, name, suffix, value)
}

/// statsd sink backed by a UDP endpoint named `statsd`
pub struct StatsdSink {
    endpoint: Endpoint,
}

impl StatsdSink {
    pub const NAME: &'static str = "statsd";

    /// Must be called from within a tokio runtime
    pub fn connect(config: &StatsdConfig, settings: EndpointSettings) -> Self {
        let state = EndpointState::new();
        let policy = LogPolicy {
            reconnect: false,
            trace: false,
        };
        let connection = UdpConnection::open(
            Self::NAME,
            config.host.to_lowercase(),
            config.port,
            state.clone(),
            policy,
        );

        let endpoint = Endpoint::new(Self::NAME, Kind::Packet, connection, state, settings);
        endpoint.mark_up();
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl StatsSink for StatsdSink {
    fn send(&self, line: &str) {
        self.endpoint.send(Bytes::copy_from_slice(line.as_bytes()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    #[test]
    fn test_counter_line() {
        assert_eq!(
            counter_line("", "pool.remotes.healthy", "", 3),
            "pool.remotes.healthy:3|c\n"
        );
        assert_eq!(
            counter_line("prod.", "pool.chains.unhealthy", ".host1", 0),
            "prod.pool.chains.unhealthy.host1:0|c\n"
        );
    }

    #[tokio::test]
    async fn test_statsd_sink_sends_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = StatsdConfig {
            host: "127.0.0.1".to_string(),
            port: receiver.local_addr().unwrap().port(),
            prefix: String::new(),
            suffix: String::new(),
        };

        let sink = StatsdSink::connect(&config, EndpointSettings::default());
        assert!(sink.endpoint().is_available());
        assert_eq!(sink.endpoint().name(), "statsd");

        sink.send("pool.remotes.healthy:2|c\n");
        let mut buf = [0u8; 128];
        let n = tokio::time::timeout(Duration::from_secs(2), receiver.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"pool.remotes.healthy:2|c\n");
    }
}
