/// UDP transport
use super::{Connection, EndpointState, LogPolicy};
use crate::error::{RelayError, RelayResult};
use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tracing::{error, trace};

/// Outbound datagram socket. Every `write` is one datagram.
pub struct UdpConnection {
    name: String,
    tx: mpsc::UnboundedSender<Bytes>,
    destroyed: Arc<AtomicBool>,
}

impl UdpConnection {
    /// Resolve the target and bind a local socket in the background.
    /// Setup or send failures mark `state` down.
    pub fn open(
        name: &str,
        host: String,
        port: u16,
        state: Arc<EndpointState>,
        policy: LogPolicy,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let destroyed = Arc::new(AtomicBool::new(false));

        let task_name = name.to_string();
        let task_destroyed = Arc::clone(&destroyed);
        tokio::spawn(async move {
            if let Err(e) = run(&task_name, &host, port, &state, rx).await {
                if policy.report_errors() {
                    error!("ERROR: {}: {}", task_name, e);
                } else {
                    trace!("ERROR: {}: {}", task_name, e);
                }
                if !state.is_down() {
                    state.mark_down(&task_name);
                }
                task_destroyed.store(true, Ordering::Release);
            }
        });

        Arc::new(Self {
            name: name.to_string(),
            tx,
            destroyed,
        })
    }
}

async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    lookup_host((host, port)).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address found for {}:{}", host, port),
        )
    })
}

async fn run(
    name: &str,
    host: &str,
    port: u16,
    state: &EndpointState,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) -> io::Result<()> {
    let target = resolve(host, port).await?;
    let local: SocketAddr = if target.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(local).await?;

    while let Some(datagram) = rx.recv().await {
        // We only learn that the datagram left, not that it arrived
        if let Err(e) = socket.send_to(&datagram, target).await {
            error!("{}: Failed sending {} bytes: {}", name, datagram.len(), e);
            if !state.is_down() {
                state.mark_down(name);
            }
        }
    }

    Ok(())
}

impl Connection for UdpConnection {
    fn write(&self, data: Bytes) -> RelayResult<()> {
        self.tx
            .send(data)
            .map_err(|_| RelayError::transport(&self.name, "socket closed"))
    }

    fn buffered_bytes(&self) -> usize {
        0
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpConnection")
            .field("name", &self.name)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
