/// Stream transports: TCP, unix domain socket, append-mode file, stdout
///
/// Each connection is a background task that owns the transport. Writes are
/// queued on an unbounded channel and counted as buffered until the task has
/// written them out, which is what the slow check looks at. Pipes bound that
/// queue by waiting for it to drain before reading more. Socket transports
/// also watch the read side so a remote close flips the connection to
/// destroyed, the signal the health check's liveness probe acts on.
use super::{Connection, EndpointState, LogPolicy};
use crate::error::{RelayError, RelayResult};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::fmt;
use std::fs::Metadata;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, trace};

/// Where a stream connection goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
    File(PathBuf),
    Stdout,
}

#[derive(Debug, Default)]
struct Shared {
    buffered: AtomicUsize,
    destroyed: AtomicBool,
    /// Woken whenever `buffered` shrinks or the transport goes away
    drained: Notify,
    /// Device and inode of an opened file sink
    file_id: OnceLock<(u64, u64)>,
}

impl Shared {
    fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.drained.notify_waiters();
    }
}

/// Outbound stream connection
pub struct StreamConnection {
    name: String,
    tx: mpsc::UnboundedSender<Bytes>,
    shared: Arc<Shared>,
    /// Path of a file sink, checked for rotation
    file: Option<PathBuf>,
}

impl StreamConnection {
    /// Start connecting in the background. `state` is marked up once the
    /// transport is connected; a failed connect leaves it down and the
    /// connection destroyed.
    pub fn open(
        name: &str,
        target: StreamTarget,
        state: Arc<EndpointState>,
        policy: LogPolicy,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let file = match &target {
            StreamTarget::File(path) => Some(path.clone()),
            _ => None,
        };

        let task = ConnectionTask {
            name: name.to_string(),
            shared: Arc::clone(&shared),
            state,
            policy,
        };
        tokio::spawn(task.run(target, rx));

        Arc::new(Self {
            name: name.to_string(),
            tx,
            shared,
            file,
        })
    }
}

#[cfg(unix)]
fn file_id(meta: &Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_id(_meta: &Metadata) -> Option<(u64, u64)> {
    None
}

impl Connection for StreamConnection {
    fn write(&self, data: Bytes) -> RelayResult<()> {
        if self.shared.destroyed.load(Ordering::Acquire) {
            return Err(RelayError::transport(&self.name, "connection destroyed"));
        }

        let len = data.len();
        self.shared.buffered.fetch_add(len, Ordering::AcqRel);
        self.tx.send(data).map_err(|_| {
            self.shared.buffered.fetch_sub(len, Ordering::AcqRel);
            RelayError::transport(&self.name, "connection closed")
        })
    }

    fn buffered_bytes(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    fn drained(&self, limit: usize) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            loop {
                let notified = self.shared.drained.notified();
                tokio::pin!(notified);
                // register before checking so a wakeup in between is not lost
                notified.as_mut().enable();
                if self.buffered_bytes() <= limit || self.is_destroyed() {
                    return;
                }
                notified.await;
            }
        })
    }

    fn rotated(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let (Some(path), Some(opened)) = (&self.file, self.shared.file_id.get()) else {
                return false;
            };
            match tokio::fs::metadata(path).await {
                Ok(meta) => file_id(&meta).is_some_and(|id| id != *opened),
                Err(e) => e.kind() == io::ErrorKind::NotFound,
            }
        })
    }
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("name", &self.name)
            .field("buffered", &self.buffered_bytes())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

struct ConnectionTask {
    name: String,
    shared: Arc<Shared>,
    state: Arc<EndpointState>,
    policy: LogPolicy,
}

impl ConnectionTask {
    async fn run(self, target: StreamTarget, rx: mpsc::UnboundedReceiver<Bytes>) {
        let result = match target {
            StreamTarget::Tcp { host, port } => {
                match TcpStream::connect((host.as_str(), port)).await {
                    Ok(stream) => {
                        if let Err(e) = configure_backend_stream(&stream) {
                            debug!("Failed to configure stream to {}: {}", self.name, e);
                        }
                        self.connected();
                        self.pump_duplex(stream, rx).await
                    }
                    Err(e) => Err(e),
                }
            }
            StreamTarget::Unix(path) => match connect_unix(&path).await {
                Ok(stream) => {
                    self.connected();
                    self.pump_duplex(stream, rx).await
                }
                Err(e) => Err(e),
            },
            StreamTarget::File(path) => {
                match tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                {
                    Ok(file) => {
                        if let Some(id) = file.metadata().await.ok().as_ref().and_then(file_id) {
                            self.shared.file_id.get_or_init(|| id);
                        }
                        self.connected();
                        self.pump_sink(file, rx).await
                    }
                    Err(e) => Err(e),
                }
            }
            StreamTarget::Stdout => {
                self.connected();
                self.pump_sink(tokio::io::stdout(), rx).await
            }
        };

        self.shared.destroy();

        if let Err(e) = result {
            // reconnect attempts get very chatty, so hide them behind trace
            if self.policy.report_errors() {
                error!("ERROR: {}: {}", self.name, e);
            } else {
                trace!("ERROR: {}: {}", self.name, e);
            }
        }
    }

    fn connected(&self) {
        info!("Connected to {}", self.name);
        self.state.mark_up(&self.name);
    }

    async fn write_chunk<W>(&self, writer: &mut W, chunk: Bytes) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let len = chunk.len();
        writer.write_all(&chunk).await?;
        writer.flush().await?;
        self.shared.buffered.fetch_sub(len, Ordering::AcqRel);
        self.shared.drained.notify_waiters();
        Ok(())
    }

    /// Socket transports: write queued data, discard anything the backend
    /// sends back, stop when either side closes.
    async fn pump_duplex<S>(
        &self,
        stream: S,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut scratch = [0u8; 4096];

        loop {
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(chunk) => self.write_chunk(&mut writer, chunk).await?,
                    // endpoint was replaced or dropped
                    None => return Ok(()),
                },
                read = reader.read(&mut scratch) => match read {
                    Ok(0) => {
                        debug!("Remote {} closed the connection", self.name);
                        return Ok(());
                    }
                    Ok(n) => trace!("Discarding {} bytes from {}", n, self.name),
                    Err(e) => return Err(e),
                },
            }
        }
    }

    /// Write-only transports
    async fn pump_sink<W>(
        &self,
        mut writer: W,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(chunk) = rx.recv().await {
            self.write_chunk(&mut writer, chunk).await?;
        }
        Ok(())
    }
}

/// Configure backend stream for low latency and dead peer detection
fn configure_backend_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    socket2::SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}

#[cfg(unix)]
async fn connect_unix(path: &std::path::Path) -> io::Result<tokio::net::UnixStream> {
    tokio::net::UnixStream::connect(path).await
}

#[cfg(not(unix))]
async fn connect_unix(path: &std::path::Path) -> io::Result<TcpStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("unix sockets are not supported here: {}", path.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn policy() -> LogPolicy {
        LogPolicy {
            reconnect: false,
            trace: false,
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_connect_refused_destroys_connection() {
        // bind then drop to find a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let state = EndpointState::new();
        let conn = StreamConnection::open(
            "tcp://127.0.0.1",
            StreamTarget::Tcp {
                host: "127.0.0.1".to_string(),
                port,
            },
            state.clone(),
            policy(),
        );

        assert!(wait_for(|| conn.is_destroyed()).await);
        assert!(state.is_down());
        assert_eq!(state.state_changes(), 0);
        assert!(conn.write(Bytes::from_static(b"x")).is_err());
    }

    #[tokio::test]
    async fn test_remote_close_is_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = EndpointState::new();
        let conn = StreamConnection::open(
            "tcp://peer",
            StreamTarget::Tcp {
                host: "127.0.0.1".to_string(),
                port,
            },
            state.clone(),
            policy(),
        );

        let (accepted, _) = listener.accept().await.unwrap();
        assert!(wait_for(|| !state.is_down()).await);
        assert!(!conn.is_destroyed());

        drop(accepted);
        assert!(wait_for(|| conn.is_destroyed()).await);
        // the liveness probe, not the transport, flips the endpoint down
        assert!(!state.is_down());
    }

    #[tokio::test]
    async fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        std::fs::write(&path, b"existing\n").unwrap();

        let state = EndpointState::new();
        let conn = StreamConnection::open(
            "file://out.log",
            StreamTarget::File(path.clone()),
            state.clone(),
            policy(),
        );

        conn.write(Bytes::from_static(b"one\n")).unwrap();
        conn.write(Bytes::from_static(b"two\n")).unwrap();

        assert!(wait_for(|| !state.is_down() && conn.buffered_bytes() == 0).await);
        assert_eq!(std::fs::read(&path).unwrap(), b"existing\none\ntwo\n".to_vec());
    }

    #[tokio::test]
    async fn test_drained_waits_for_a_stalled_backend() {
        // accepted but never read from
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = EndpointState::new();
        let conn = StreamConnection::open(
            "tcp://stalled",
            StreamTarget::Tcp {
                host: "127.0.0.1".to_string(),
                port,
            },
            state.clone(),
            policy(),
        );
        let (accepted, _) = listener.accept().await.unwrap();
        assert!(wait_for(|| !state.is_down()).await);

        // far more than the kernel buffers hold
        let chunk = Bytes::from(vec![b'x'; 1024 * 1024]);
        for _ in 0..64 {
            conn.write(chunk.clone()).unwrap();
        }
        assert!(conn.buffered_bytes() > 32 * 1024 * 1024);

        let waited = tokio::time::timeout(Duration::from_millis(300), conn.drained(1024)).await;
        assert!(waited.is_err());

        // the backend going away releases the waiter
        drop(accepted);
        tokio::time::timeout(Duration::from_secs(5), conn.drained(1024))
            .await
            .unwrap();
        assert!(conn.is_destroyed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_sink_notices_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overflow.log");

        let state = EndpointState::new();
        let conn = StreamConnection::open(
            "file://overflow.log",
            StreamTarget::File(path.clone()),
            state.clone(),
            policy(),
        );
        assert!(wait_for(|| !state.is_down()).await);
        assert!(!conn.rotated().await);

        std::fs::rename(&path, dir.path().join("overflow.log.1")).unwrap();
        assert!(conn.rotated().await);

        std::fs::write(&path, b"").unwrap();
        assert!(conn.rotated().await);
    }

    #[tokio::test]
    async fn test_socket_stream_never_rotates() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = EndpointState::new();
        let conn = StreamConnection::open(
            "tcp://peer",
            StreamTarget::Tcp {
                host: "127.0.0.1".to_string(),
                port,
            },
            state.clone(),
            policy(),
        );
        let _accepted = listener.accept().await.unwrap();
        assert!(wait_for(|| !state.is_down()).await);
        assert!(!conn.rotated().await);
    }

    #[tokio::test]
    async fn test_file_sink_in_missing_directory_fails() {
        let state = EndpointState::new();
        let conn = StreamConnection::open(
            "file:///nonexistent/dir/out.log",
            StreamTarget::File(PathBuf::from("/nonexistent/dir/out.log")),
            state.clone(),
            policy(),
        );

        assert!(wait_for(|| conn.is_destroyed()).await);
        assert!(state.is_down());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let state = EndpointState::new();
        let conn = StreamConnection::open(
            "socket://backend.sock",
            StreamTarget::Unix(path.clone()),
            state.clone(),
            policy(),
        );

        let (mut accepted, _) = listener.accept().await.unwrap();
        conn.write(Bytes::from_static(b"abc")).unwrap();

        let mut buf = [0u8; 3];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
        assert!(wait_for(|| !state.is_down()).await);
    }
}
