/// Fan-out of inbound data to the live endpoints
///
/// `dispatch` takes one snapshot of the pool's live set and delivers the
/// payload to each endpoint in it. Raw data is sent directly. An inbound
/// stream is attached instead: stream endpoints get a pipe into their
/// connection, packet endpoints get every chunk forwarded through `send`.
/// The bytes themselves move once the listener starts pumping the stream,
/// and pumping pauses while any piped connection holds more than its
/// `max_buffer_size`.
use crate::core::{Context, Listener};
use crate::pool::RemotePool;
use crate::remote::{Connection, Endpoint};
use bytes::{Bytes, BytesMut};
use fnv::FnvHashSet;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

const READ_CHUNK: usize = 16 * 1024;

/// What a listener hands to the dispatcher
#[derive(Debug, Clone)]
pub enum Payload {
    /// A connection whose data has yet to arrive
    Stream(Arc<InboundStream>),
    /// One complete unit of data: a datagram or a line
    Data(Bytes),
}

enum Target {
    /// Bytes go straight into the outbound connection
    Pipe {
        name: String,
        connection: Arc<dyn Connection>,
        limit: usize,
    },
    /// Every chunk is sent through the endpoint
    Forward(Arc<Endpoint>),
}

/// An inbound connection shared by every endpoint it was dispatched to.
///
/// Closing the inbound side never closes an outbound connection: several
/// inbound streams may feed the same backend.
pub struct InboundStream {
    name: String,
    targets: Mutex<Vec<Target>>,
}

impl InboundStream {
    pub fn new<S: Into<String>>(name: S) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            targets: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn targets(&self) -> std::sync::MutexGuard<'_, Vec<Target>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pipe(&self, endpoint: &Endpoint) {
        self.targets().push(Target::Pipe {
            name: endpoint.name().to_string(),
            connection: Arc::clone(endpoint.connection()),
            limit: endpoint.settings().max_buffer_size,
        });
    }

    fn forward(&self, endpoint: Arc<Endpoint>) {
        self.targets().push(Target::Forward(endpoint));
    }

    /// Number of endpoints attached
    pub fn fan_out(&self) -> usize {
        self.targets().len()
    }

    /// Hand one chunk to every attached endpoint
    pub fn deliver(&self, chunk: &Bytes) {
        for target in self.targets().iter() {
            match target {
                Target::Pipe { name, connection, .. } => {
                    if let Err(e) = connection.write(chunk.clone()) {
                        trace!("Pipe from {} to {} failed: {}", self.name, name, e);
                    }
                }
                Target::Forward(endpoint) => {
                    endpoint.send(chunk.clone());
                    endpoint.touch_last_sent();
                }
            }
        }
    }

    /// Wait until every piped connection is back under its buffer limit
    async fn backpressure(&self) {
        let pipes: Vec<(Arc<dyn Connection>, usize)> = self
            .targets()
            .iter()
            .filter_map(|target| match target {
                Target::Pipe { connection, limit, .. } => Some((Arc::clone(connection), *limit)),
                Target::Forward(_) => None,
            })
            .collect();

        for (connection, limit) in pipes {
            connection.drained(limit).await;
        }
    }

    /// Read `reader` to the end, delivering every chunk. Returns the number
    /// of bytes read. Reading stalls while a piped backend is not keeping up.
    pub async fn pump<R>(&self, mut reader: R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut total = 0u64;
        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        loop {
            buf.reserve(READ_CHUNK);
            let n = reader.read_buf(&mut buf).await?;
            if n == 0 {
                trace!("{} closed after {} bytes", self.name, total);
                return Ok(total);
            }
            total += n as u64;
            let chunk = buf.split().freeze();
            self.deliver(&chunk);
            self.backpressure().await;
        }
    }
}

impl fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundStream")
            .field("name", &self.name)
            .field("fan_out", &self.fan_out())
            .finish()
    }
}

/// Routes inbound payloads to the pool's live endpoints
#[derive(Debug, Clone)]
pub struct Dispatcher {
    ctx: Arc<Context>,
    pool: Arc<RemotePool>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<Context>, pool: Arc<RemotePool>) -> Self {
        Self { ctx, pool }
    }

    pub fn pool(&self) -> &Arc<RemotePool> {
        &self.pool
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Deliver `payload` from `listener` to every live endpoint, at most
    /// once per endpoint when `no_duplicates` is set. Returns the number of
    /// endpoints it was delivered or attached to.
    pub fn dispatch(&self, listener: &Listener, payload: &Payload) -> usize {
        self.ctx.stats().incr(listener.kind);

        let no_duplicates = self.ctx.config().relay.no_duplicates;
        let live = self.pool.live_set();
        let mut seen = FnvHashSet::default();
        let mut delivered = 0;

        for endpoint in live.iter() {
            if no_duplicates && !seen.insert(endpoint.name()) {
                trace!(
                    "Already sent packet to \"{}\" - not sending duplicate",
                    endpoint.name()
                );
                continue;
            }

            endpoint.incr_stats();

            match payload {
                Payload::Stream(inbound) if listener.is_stream() && endpoint.is_stream() => {
                    trace!("Piping from {} to {}", listener.kind, endpoint.name());
                    inbound.pipe(endpoint);
                }
                Payload::Stream(inbound) => {
                    trace!("Manual send from {} to {}", listener.kind, endpoint.name());
                    inbound.forward(Arc::clone(endpoint));
                }
                Payload::Data(data) => {
                    trace!("Manual send from {} to {}", listener.kind, endpoint.name());
                    endpoint.send(data.clone());
                }
            }
            delivered += 1;
        }

        delivered
    }
}
