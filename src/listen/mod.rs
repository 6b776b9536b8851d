/// Local listeners
///
/// Every listener turns its input into [`Payload`]s and hands them to the
/// dispatcher. TCP and unix-socket connections and stdin are streams; UDP
/// datagrams and lines appended to tailed files are plain data.
use crate::config::ListenConfig;
use crate::core::{Listener, ListenerKind};
use crate::dispatch::{Dispatcher, InboundStream, Payload};
use crate::error::RelayResult;
use crate::utils::format_bytes;
use bytes::{Bytes, BytesMut};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Any accepted inbound connection
pub trait InboundIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> InboundIo for T {}

pub type BoxedIo = Box<dyn InboundIo>;

/// Stream-accepting socket: TCP or unix domain
#[derive(Debug)]
pub enum Acceptor {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, PathBuf),
}

impl Acceptor {
    pub async fn bind_tcp(address: &str, port: u16) -> io::Result<Self> {
        Ok(Acceptor::Tcp(TcpListener::bind((address, port)).await?))
    }

    #[cfg(unix)]
    pub fn bind_unix(path: &Path) -> io::Result<Self> {
        let listener = tokio::net::UnixListener::bind(path)?;
        Ok(Acceptor::Unix(listener, path.to_path_buf()))
    }

    #[cfg(not(unix))]
    pub fn bind_unix(path: &Path) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unix sockets are not supported here: {}", path.display()),
        ))
    }

    /// Accept one connection, returning it with a printable peer name
    pub async fn accept(&self) -> io::Result<(BoxedIo, String)> {
        match self {
            Acceptor::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                }
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Acceptor::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), path.display().to_string()))
            }
        }
    }

    /// Address this acceptor is bound to, in backend address notation
    pub fn local_name(&self) -> String {
        match self {
            Acceptor::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => format!("tcp://{}", addr),
                Err(_) => "tcp://unknown".to_string(),
            },
            #[cfg(unix)]
            Acceptor::Unix(_, path) => format!("socket://{}", path.display()),
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Acceptor::Tcp(listener) => listener.local_addr().ok().map(|a| a.port()),
            #[cfg(unix)]
            Acceptor::Unix(..) => None,
        }
    }
}

/// The running set of local listeners
#[derive(Debug, Default)]
pub struct LocalListeners {
    names: Vec<String>,
    handles: Vec<JoinHandle<()>>,
}

impl LocalListeners {
    /// Bind every configured listener and start serving. Any bind failure
    /// aborts startup.
    pub async fn start(config: &ListenConfig, dispatcher: &Dispatcher) -> RelayResult<Self> {
        let mut listeners = Self::default();

        if let Some(port) = config.tcp_port {
            let acceptor = Acceptor::bind_tcp(&config.bind_address, port).await?;
            listeners.spawn_streams(ListenerKind::Tcp, acceptor, dispatcher);
        }

        if let Some(port) = config.udp_port {
            let socket = UdpSocket::bind((config.bind_address.as_str(), port)).await?;
            let name = match socket.local_addr() {
                Ok(addr) => format!("udp://{}", addr),
                Err(_) => format!("udp://{}:{}", config.bind_address, port),
            };
            let listener = Listener::new(ListenerKind::Udp, name);
            let name = listener.name.clone();
            listeners.spawn(name, serve_datagrams(socket, listener, dispatcher.clone()));
        }

        if let Some(path) = &config.unix_socket {
            let acceptor = Acceptor::bind_unix(path)?;
            listeners.spawn_streams(ListenerKind::Socket, acceptor, dispatcher);
        }

        if config.stdin {
            let listener = Listener::new(ListenerKind::Stdin, "stdin");
            listeners.spawn("stdin".to_string(), serve_stdin(listener, dispatcher.clone()));
        }

        let rescan = Duration::from_millis(config.rescan_interval_ms.max(1));
        for path in &config.files {
            let listener = Listener::new(ListenerKind::File, format!("file://{}", path.display()));
            let tail = FileTail::open(path).await;
            let name = listener.name.clone();
            listeners.spawn(name, serve_file(tail, rescan, listener, dispatcher.clone()));
        }

        Ok(listeners)
    }

    fn spawn_streams(&mut self, kind: ListenerKind, acceptor: Acceptor, dispatcher: &Dispatcher) {
        let listener = Listener::new(kind, acceptor.local_name());
        self.spawn(listener.name.clone(), serve_streams(acceptor, listener, dispatcher.clone()));
    }

    fn spawn<F>(&mut self, name: String, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!("Listening on {}", name);
        self.names.push(name);
        self.handles.push(tokio::spawn(task));
    }

    /// Names of the running listeners, in start order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop accepting input. Streams already being pumped are left alone.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// Accept loop for TCP and unix-socket listeners
pub async fn serve_streams(acceptor: Acceptor, listener: Listener, dispatcher: Dispatcher) {
    loop {
        match acceptor.accept().await {
            Ok((io, peer)) => {
                trace!("{} accepted connection from {}", listener.name, peer);
                let inbound = InboundStream::new(format!("{} {}", listener.kind, peer));
                dispatcher.dispatch(&listener, &Payload::Stream(inbound.clone()));

                tokio::spawn(async move {
                    match inbound.pump(io).await {
                        Ok(bytes) => trace!("{} done after {} bytes", inbound.name(), bytes),
                        Err(e) => debug!("{} failed: {}", inbound.name(), e),
                    }
                });
            }
            Err(e) => {
                warn!("{} failed to accept: {}", listener.name, e);
                dispatcher.context().stats().incr_failed();
                // usually fd exhaustion, give it a moment
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Receive loop for the UDP listener: one dispatch per datagram
pub async fn serve_datagrams(socket: UdpSocket, listener: Listener, dispatcher: Dispatcher) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, peer)) => {
                trace!("{} received {} bytes from {}", listener.name, n, peer);
                let data = Bytes::copy_from_slice(&buf[..n]);
                dispatcher.dispatch(&listener, &Payload::Data(data));
            }
            Err(e) => warn!("{} failed to receive: {}", listener.name, e),
        }
    }
}

/// Relay standard input until it closes
pub async fn serve_stdin(listener: Listener, dispatcher: Dispatcher) {
    let inbound = InboundStream::new("stdin");
    dispatcher.dispatch(&listener, &Payload::Stream(inbound.clone()));

    match inbound.pump(tokio::io::stdin()).await {
        Ok(bytes) => info!("stdin closed after {}", format_bytes(bytes)),
        Err(e) => warn!("Reading stdin failed: {}", e),
    }
}

/// Poll a tailed file and dispatch every new line
pub async fn serve_file(
    mut tail: FileTail,
    rescan: Duration,
    listener: Listener,
    dispatcher: Dispatcher,
) {
    let mut ticker = tokio::time::interval(rescan);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match tail.poll().await {
            Ok(lines) => {
                for line in lines {
                    dispatcher.dispatch(&listener, &Payload::Data(line));
                }
            }
            Err(e) => debug!("{}: {}", listener.name, e),
        }
    }
}

/// `tail -F` for one file.
///
/// Starts at the end of the file if it exists. A file that shrinks is
/// assumed truncated or rotated and is read again from the start. Complete
/// lines are returned with their trailing newline; a partial last line is
/// held back until it is finished.
#[derive(Debug)]
pub struct FileTail {
    path: PathBuf,
    offset: u64,
    partial: BytesMut,
}

impl FileTail {
    pub async fn open(path: &Path) -> Self {
        let offset = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        Self {
            path: path.to_path_buf(),
            offset,
            partial: BytesMut::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read whatever was appended since the last poll
    pub async fn poll(&mut self) -> io::Result<Vec<Bytes>> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        if len < self.offset {
            debug!("{} was truncated, reading from the start", self.path.display());
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut appended = Vec::with_capacity((len - self.offset) as usize);
        let read = file.take(len - self.offset).read_to_end(&mut appended).await?;
        self.offset += read as u64;
        self.partial.extend_from_slice(&appended);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            lines.push(self.partial.split_to(pos + 1).freeze());
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Topology};
    use crate::core::Context;
    use crate::pool::RemotePool;
    use crate::remote::memory::MemoryFactory;
    use crate::remote::EndpointSettings;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    async fn dispatcher(groups: Vec<Vec<&str>>) -> (Dispatcher, Arc<MemoryFactory>) {
        let mut config = Config::default();
        config.servers = Topology::new(
            groups
                .into_iter()
                .map(|g| g.into_iter().map(String::from).collect())
                .collect(),
        );
        config.pool.monitor_delay_ms = 3_600_000;
        let factory = MemoryFactory::new(EndpointSettings::default());
        let ctx = Context::new(config);
        let pool = RemotePool::new(Arc::clone(&ctx), factory.clone());
        pool.connect_to_servers(|_| {}).await.unwrap();
        pool.refresh_live_set().await;
        (Dispatcher::new(ctx, pool), factory)
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
    async fn test_file_tail_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"old line\n").unwrap();

        let mut tail = FileTail::open(&path).await;
        assert!(tail.poll().await.unwrap().is_empty());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut file, b"one\ntw").unwrap();
        assert_eq!(tail.poll().await.unwrap(), vec![Bytes::from_static(b"one\n")]);

        std::io::Write::write_all(&mut file, b"o\n").unwrap();
        assert_eq!(tail.poll().await.unwrap(), vec![Bytes::from_static(b"two\n")]);
    }

    #[tokio::test]
    async fn test_file_tail_truncation_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"a fairly long first line\n").unwrap();

        let mut tail = FileTail::open(&path).await;
        std::fs::write(&path, b"new\n").unwrap();
        assert_eq!(tail.poll().await.unwrap(), vec![Bytes::from_static(b"new\n")]);
    }

    #[tokio::test]
    async fn test_file_tail_waits_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.log");

        let mut tail = FileTail::open(&path).await;
        assert!(tail.poll().await.unwrap().is_empty());

        std::fs::write(&path, b"first\n").unwrap();
        assert_eq!(tail.poll().await.unwrap(), vec![Bytes::from_static(b"first\n")]);
    }

    #[tokio::test]
    async fn test_tcp_listener_pipes_to_backend() {
        let (dispatcher, factory) = dispatcher(vec![vec!["tcp://h:1"]]).await;
        let acceptor = Acceptor::bind_tcp("127.0.0.1", 0).await.unwrap();
        let port = acceptor.port().unwrap();
        let listener = Listener::new(ListenerKind::Tcp, acceptor.local_name());
        let task = tokio::spawn(serve_streams(acceptor, listener, dispatcher.clone()));

        let mut client = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"hello\n").await.unwrap();
        client.shutdown().await.unwrap();

        let connection = factory.connection("tcp://h:1").unwrap();
        assert!(wait_for(|| connection.written() == b"hello\n".to_vec()).await);
        assert_eq!(dispatcher.context().stats().count(ListenerKind::Tcp), 1);

        task.abort();
        dispatcher.pool().shutdown();
    }

    #[tokio::test]
    async fn test_udp_listener_dispatches_datagrams() {
        let (dispatcher, factory) = dispatcher(vec![vec!["udp://h:1"]]).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let listener = Listener::new(ListenerKind::Udp, "udp");
        let task = tokio::spawn(serve_datagrams(socket, listener, dispatcher.clone()));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"ping", addr).await.unwrap();

        let connection = factory.connection("udp://h:1").unwrap();
        assert!(wait_for(|| connection.writes() == vec![Bytes::from_static(b"ping")]).await);
        assert_eq!(dispatcher.context().stats().count(ListenerKind::Udp), 1);

        task.abort();
        dispatcher.pool().shutdown();
    }

    #[tokio::test]
    async fn test_start_binds_configured_listeners() {
        let (dispatcher, _) = dispatcher(vec![vec!["tcp://h:1"]]).await;
        let dir = tempfile::tempdir().unwrap();
        let tailed = dir.path().join("tailed.log");

        let config = ListenConfig {
            tcp_port: Some(0),
            udp_port: Some(0),
            files: vec![tailed.clone()],
            ..ListenConfig::default()
        };
        let listeners = LocalListeners::start(&config, &dispatcher).await.unwrap();
        assert_eq!(listeners.len(), 3);
        assert!(listeners.names()[0].starts_with("tcp://127.0.0.1:"));
        assert!(listeners.names()[1].starts_with("udp://127.0.0.1:"));
        assert_eq!(listeners.names()[2], format!("file://{}", tailed.display()));

        listeners.shutdown();
        dispatcher.pool().shutdown();
    }
}
