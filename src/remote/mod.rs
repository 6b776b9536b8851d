/// Outbound connections to backends
///
/// An [`Endpoint`] wraps one [`Connection`] and tracks whether the backend
/// is usable. Connections come in two kinds: streams (TCP, unix socket,
/// append-mode file, stdout), which can be piped into, and packets (UDP),
/// where every send is explicit and large payloads are split.
pub mod address;
pub mod endpoint;
pub mod memory;
pub mod packet;
pub mod stream;

pub use address::{BackendAddress, Kind};
pub use endpoint::{Endpoint, EndpointSettings, EndpointState, EndpointStats};

use crate::core::Context;
use crate::error::{RelayError, RelayResult};
use bytes::Bytes;
use futures::future::{self, BoxFuture};
use std::fmt;
use std::sync::Arc;

/// Capability every transport offers to its endpoint
pub trait Connection: Send + Sync + fmt::Debug {
    /// Queue bytes for delivery without waiting for the transport.
    /// Stream connections write them verbatim; packet connections send
    /// exactly one datagram per call.
    fn write(&self, data: Bytes) -> RelayResult<()>;

    /// Bytes accepted but not yet handed to the transport
    fn buffered_bytes(&self) -> usize;

    /// The transport is gone: remote closed, fatal error, or failed connect
    fn is_destroyed(&self) -> bool;

    /// Resolves once at most `limit` bytes are buffered or the transport is
    /// gone. Pipes wait on this before reading more input.
    fn drained(&self, _limit: usize) -> BoxFuture<'_, ()> {
        Box::pin(future::ready(()))
    }

    /// The file behind this connection was renamed or removed since it was
    /// opened. Only file sinks can rotate.
    fn rotated(&self) -> BoxFuture<'_, bool> {
        Box::pin(future::ready(false))
    }
}

/// Builds endpoints from backend address strings
pub trait EndpointFactory: Send + Sync {
    /// Parse `name` and open a connection to it. Stream connections are
    /// established in the background; the endpoint stays down until then.
    fn connect(&self, name: &str, reconnect: bool) -> RelayResult<Arc<Endpoint>>;
}

/// Opens real sockets and files
pub struct TransportFactory {
    ctx: Arc<Context>,
}

impl TransportFactory {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

/// How chatty connection errors should be
#[derive(Debug, Clone, Copy)]
pub struct LogPolicy {
    pub reconnect: bool,
    pub trace: bool,
}

impl LogPolicy {
    /// Initial connects always report errors; reconnects only under trace
    pub fn report_errors(&self) -> bool {
        self.trace || !self.reconnect
    }
}

impl EndpointFactory for TransportFactory {
    fn connect(&self, name: &str, reconnect: bool) -> RelayResult<Arc<Endpoint>> {
        let address: BackendAddress = name.parse()?;
        let settings = EndpointSettings::from(&self.ctx.config().relay);
        let state = EndpointState::new();
        let policy = LogPolicy {
            reconnect,
            trace: self.ctx.trace(),
        };

        let endpoint = match address {
            BackendAddress::Udp { host, port } => {
                let connection =
                    packet::UdpConnection::open(name, host, port, state.clone(), policy);
                let endpoint = Endpoint::new(name, Kind::Packet, connection, state, settings);
                // no handshake: datagram endpoints are usable right away
                endpoint.mark_up();
                endpoint
            }
            other => {
                let target = stream::StreamTarget::try_from(other)?;
                let connection =
                    stream::StreamConnection::open(name, target, state.clone(), policy);
                Endpoint::new(name, Kind::Stream, connection, state, settings)
            }
        };

        Ok(Arc::new(endpoint))
    }
}

impl TryFrom<BackendAddress> for stream::StreamTarget {
    type Error = RelayError;

    fn try_from(address: BackendAddress) -> Result<Self, Self::Error> {
        match address {
            BackendAddress::Stdout => Ok(stream::StreamTarget::Stdout),
            BackendAddress::Tcp { host, port } => Ok(stream::StreamTarget::Tcp { host, port }),
            BackendAddress::Socket(path) => Ok(stream::StreamTarget::Unix(path)),
            BackendAddress::File(path) => Ok(stream::StreamTarget::File(path)),
            udp @ BackendAddress::Udp { .. } => Err(RelayError::internal(format!(
                "{} is not a stream address",
                udp
            ))),
        }
    }
}
