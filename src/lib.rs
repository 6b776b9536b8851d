/// Piped - a fan-out traffic relay
///
/// Piped accepts data on local listeners (TCP, UDP, unix sockets, stdin,
/// tailed files) and relays every message to one backend per redundancy
/// group. Backends are health checked continuously: the first usable backend
/// of each group receives traffic, slow or dead ones are skipped, and dead
/// ones are reconnected in the background.
pub mod admin;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod listen;
pub mod metrics;
pub mod pool;
pub mod remote;
pub mod utils;

pub use crate::config::Config;
pub use crate::core::Context;
pub use crate::dispatch::{Dispatcher, Payload};
pub use crate::error::{RelayError, RelayResult};
pub use crate::pool::RemotePool;

use crate::admin::{AdminInterface, AdminServer};
use crate::listen::LocalListeners;
use crate::metrics::{StatsSink, StatsdSink};
use crate::remote::EndpointSettings;
use log::{info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A running relay: pool, dispatcher, admin interface and listeners
pub struct Piped {
    ctx: Arc<Context>,
    pool: Arc<RemotePool>,
    dispatcher: Dispatcher,
    admin: Option<(String, JoinHandle<()>)>,
    listeners: LocalListeners,
}

impl Piped {
    /// Validate `config`, connect to the backends and start listening.
    ///
    /// Returns once everything is bound; backend connections are still being
    /// established in the background.
    pub async fn start(config: Config) -> RelayResult<Self> {
        config.validate()?;

        let stats_sink = config.statsd.as_ref().map(|statsd| {
            info!("Sending stats to statsd at {}:{}", statsd.host, statsd.port);
            let settings = EndpointSettings::from(&config.relay);
            Arc::new(StatsdSink::connect(statsd, settings)) as Arc<dyn StatsSink>
        });
        let ctx = Context::with_stats_sink(config, stats_sink);

        let pool = RemotePool::with_transports(Arc::clone(&ctx));
        pool.connect_to_servers(|pool| {
            info!(
                "Remote pool ready: {} group(s), overflow {}",
                pool.topology().len(),
                pool.overflow().unwrap_or("disabled")
            );
        })
        .await?;

        let dispatcher = Dispatcher::new(Arc::clone(&ctx), Arc::clone(&pool));

        let admin = if ctx.config().admin.port.trim().is_empty() {
            info!("Admin interface disabled");
            None
        } else {
            let handler = Arc::new(AdminInterface::new(Arc::clone(&ctx), Arc::clone(&pool)));
            let server = AdminServer::bind(&ctx.config().admin, Arc::clone(&ctx), handler).await?;
            Some((server.local_name(), server.spawn()))
        };

        let listeners = LocalListeners::start(&ctx.config().listen, &dispatcher).await?;
        info!("Piped started with {} listener(s)", listeners.len());

        Ok(Self {
            ctx,
            pool,
            dispatcher,
            admin,
            listeners,
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn pool(&self) -> &Arc<RemotePool> {
        &self.pool
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Where the admin interface listens, if enabled
    pub fn admin_address(&self) -> Option<&str> {
        self.admin.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn listener_names(&self) -> &[String] {
        self.listeners.names()
    }

    /// Run until ctrl-c, then shut down
    pub async fn run(self) -> RelayResult<()> {
        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");
        self.shutdown();
        Ok(())
    }

    /// Stop listeners, the admin interface and the pool monitors. In-flight
    /// pipes are not drained.
    pub fn shutdown(self) {
        self.listeners.shutdown();
        if let Some((name, handle)) = self.admin {
            handle.abort();
            info!("Admin interface on {} stopped", name);
        }
        self.pool.shutdown();

        let stats = self.ctx.stats().snapshot();
        if stats.connections.failed > 0 {
            warn!("{} inbound connection(s) failed during this run", stats.connections.failed);
        }
        info!(
            "Piped stopped after {} with {} inbound message(s)",
            utils::format_duration(std::time::Duration::from_secs(stats.uptime)),
            stats.connections.total
        );
    }
}
