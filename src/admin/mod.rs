/// Admin interface
///
/// A small text protocol: one command per line, answered with plain text or
/// pretty-printed JSON. Command failures of any kind, panics included, are
/// turned into an error line so a bad command can never take the admin
/// listener down.
use crate::config::AdminConfig;
use crate::core::{Context, ListenerKind, StatsSnapshot};
use crate::error::{RelayError, RelayResult};
use crate::listen::{Acceptor, BoxedIo};
use crate::pool::{PoolCounters, RemotePool};
use crate::remote::EndpointStats;
use crate::utils::generate_id;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

pub const HELP: &str = "Try any of: config, ping, stats, help\n";

/// Text-in, text-out command handling
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &str) -> RelayResult<String>;
}

/// Response to `stats`
#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub stats: StatsSnapshot,
    pub pool: PoolCounters,
    pub active_servers: Vec<String>,
    pub all_servers: BTreeMap<String, EndpointStats>,
}

/// Read-only view over the process stats, the pool and the config
pub struct AdminInterface {
    ctx: Arc<Context>,
    pool: Arc<RemotePool>,
}

impl AdminInterface {
    pub fn new(ctx: Arc<Context>, pool: Arc<RemotePool>) -> Self {
        Self { ctx, pool }
    }

    pub async fn stats_report(&self) -> StatsReport {
        // recomputes uptime and idle time
        let stats = self.ctx.stats().snapshot();
        let all_servers = self
            .pool
            .endpoints()
            .await
            .iter()
            .map(|endpoint| (endpoint.name().to_string(), endpoint.stats(stats.uptime)))
            .collect();
        let active_servers = self
            .pool
            .live_set()
            .iter()
            .map(|endpoint| endpoint.name().to_string())
            .collect();

        StatsReport {
            stats,
            pool: self.pool.counters(),
            active_servers,
            all_servers,
        }
    }

    async fn dump(&self) {
        for endpoint in self.pool.endpoints().await {
            debug!("{:?} => {:?}", endpoint, endpoint.stats(self.ctx.stats().uptime_secs()));
        }
        debug!("live set: {:?}", self.pool.live_set());
        debug!("counters: {:?}", self.pool.counters());
    }
}

fn to_json<T: Serialize>(command: &str, value: &T) -> RelayResult<String> {
    serde_json::to_string_pretty(value).map_err(|e| RelayError::admin(command, e.to_string()))
}

#[async_trait]
impl CommandHandler for AdminInterface {
    async fn handle(&self, command: &str) -> RelayResult<String> {
        match command {
            "stats" => to_json(command, &self.stats_report().await),
            "config" => to_json(command, self.ctx.config()),
            "ping" => Ok("pong".to_string()),
            "__dump" => {
                self.dump().await;
                Ok("OK".to_string())
            }
            "help" => Ok(HELP.to_string()),
            unknown => {
                let out = format!("ADMIN ERROR: UNKNOWN COMMAND {}\n", unknown);
                debug!("{}", out.trim_end());
                Ok(out)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Run one command; never fails
pub async fn execute(handler: &dyn CommandHandler, command: &str) -> String {
    debug!("Got admin command: {}", command);

    let message = match AssertUnwindSafe(handler.handle(command)).catch_unwind().await {
        Ok(Ok(out)) => return out,
        Ok(Err(RelayError::Admin { message, .. })) => message,
        Ok(Err(e)) => e.to_string(),
        Err(panic) => panic_message(panic.as_ref()),
    };

    let out = format!("ADMIN ERROR on '{}': {}", command, message);
    info!("{}", out);
    out
}

/// How admin input bytes are turned into a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Ascii,
    Utf8,
}

impl Encoding {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Encoding::Utf8,
            _ => Encoding::Ascii,
        }
    }

    /// Ascii drops the high bit of every byte; utf8 replaces invalid
    /// sequences
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Encoding::Ascii => bytes.iter().map(|b| char::from(b & 0x7f)).collect(),
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// Line-framed admin listener
pub struct AdminServer {
    acceptor: Acceptor,
    handler: Arc<dyn CommandHandler>,
    ctx: Arc<Context>,
    encoding: Encoding,
}

impl AdminServer {
    /// Bind per `config.port`: digits only means a TCP port, anything else
    /// is a unix socket path.
    pub async fn bind(
        config: &AdminConfig,
        ctx: Arc<Context>,
        handler: Arc<dyn CommandHandler>,
    ) -> RelayResult<Self> {
        let port = config.port.trim();
        let acceptor = if port.chars().all(|c| c.is_ascii_digit()) {
            let port: u16 = port
                .parse()
                .map_err(|_| RelayError::internal(format!("invalid admin port '{}'", port)))?;
            debug!("Starting admin server on tcp://{}:{}", config.bind_address, port);
            Acceptor::bind_tcp(&config.bind_address, port).await?
        } else {
            debug!("Starting admin server on socket://{}", port);
            Acceptor::bind_unix(Path::new(port))?
        };

        let encoding = Encoding::from_name(&ctx.config().relay.encoding);
        Ok(Self {
            acceptor,
            handler,
            ctx,
            encoding,
        })
    }

    pub fn local_name(&self) -> String {
        self.acceptor.local_name()
    }

    pub fn port(&self) -> Option<u16> {
        self.acceptor.port()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.serve())
    }

    pub async fn serve(self) {
        info!("Admin interface listening on {}", self.local_name());
        loop {
            match self.acceptor.accept().await {
                Ok((io, peer)) => {
                    self.ctx.stats().incr(ListenerKind::Admin);
                    let id = generate_id("admin");
                    debug!("Admin session {} opened from {}", id, peer);
                    let handler = Arc::clone(&self.handler);
                    let encoding = self.encoding;
                    tokio::spawn(async move {
                        match session(io, handler, encoding).await {
                            Ok(()) => debug!("Admin session {} closed", id),
                            Err(e) => debug!("Admin session {} ended: {}", id, e),
                        }
                    });
                }
                Err(e) => {
                    debug!("Admin accept failed: {}", e);
                    self.ctx.stats().incr_failed();
                }
            }
        }
    }
}

async fn session(
    io: BoxedIo,
    handler: Arc<dyn CommandHandler>,
    encoding: Encoding,
) -> std::io::Result<()> {
    let (reader, mut writer) = tokio::io::split(io);
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }

        let command = encoding.decode(&line);
        let command = command.trim();
        if command.is_empty() {
            continue;
        }
        trace!("admin: {}", command);

        let mut out = execute(handler.as_ref(), command).await;
        if !out.ends_with('\n') {
            out.push('\n');
        }
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
}
