pub mod handler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{DagsError, Result};
use crate::sched::state::SchedulingState;
use crate::server::handler::{handle_connection, HandlerContext};
use crate::store::Store;

/// Accepts connections and bounds concurrency: at most `max_connections`
/// sockets open, at most `max_workers` handlers running. On shutdown it
/// stops accepting, drains in-flight handlers, flushes unsynced scores,
/// and closes the store.
pub struct Server {
    listener: TcpListener,
    ctx: Arc<HandlerContext>,
}

impl Server {
    pub async fn bind(
        config: Arc<Config>,
        state: Arc<SchedulingState>,
        store: Option<Store>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.server.port)).await?;
        let server = Self {
            listener,
            ctx: Arc::new(HandlerContext {
                state,
                store,
                config,
            }),
        };
        server.log_settings()?;
        Ok(server)
    }

    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn log_settings(&self) -> Result<()> {
        let cfg = &self.ctx.config;
        tracing::info!(
            addr = %self.listener.local_addr()?,
            max_connections = cfg.server.max_connections,
            max_workers = cfg.server.max_workers,
            load_balancing = cfg.balance.enabled,
            ideal_interval_secs = cfg.balance.ideal_contact_interval_secs,
            wait_fraction = cfg.balance.wait_fraction,
            sync_percent = cfg.store.sync_percent,
            group_sync = cfg.store.group_sync,
            memory_short = cfg.store.memory_short,
            db = %cfg.store.db_path,
            "scheduler listening"
        );
        Ok(())
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let workers = Arc::new(Semaphore::new(self.ctx.config.server.max_workers));
        let max_connections = self.ctx.config.server.max_connections;
        let conn_seq = AtomicU64::new(0);
        let mut handlers: JoinSet<()> = JoinSet::new();

        loop {
            // Reap finished handlers so the open-connection count is live.
            while handlers.try_join_next().is_some() {}

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if handlers.len() >= max_connections {
                        tracing::warn!(%peer, open = handlers.len(), "connection limit reached, refusing");
                        drop(stream);
                        continue;
                    }
                    let conn_id = conn_seq.fetch_add(1, Ordering::Relaxed);
                    let ctx = Arc::clone(&self.ctx);
                    let workers = Arc::clone(&workers);
                    handlers.spawn(async move {
                        let permit = match workers.acquire_owned().await {
                            Ok(p) => p,
                            Err(_) => return, // semaphore closed during shutdown
                        };
                        handle_connection(ctx, stream, peer, conn_id).await;
                        drop(permit);
                    });
                }
            }
        }

        let in_flight = handlers.len();
        if in_flight > 0 {
            tracing::info!(in_flight, "waiting for in-flight exchanges");
        }
        while handlers.join_next().await.is_some() {}

        if let Some(store) = self.ctx.store.as_ref() {
            for (group_id, scores) in self.ctx.state.drain_all_unsynced() {
                if let Err(e) = store.write_scores(group_id, &scores).await {
                    tracing::error!(group_id, error = %e, "final score flush failed");
                }
            }
            store.close().await;
        }
        tracing::info!("scheduler stopped");
        Ok(())
    }
}

/// Convenience used by the CLI and integration tests: build the state,
/// load it from the store when one is configured, and bind.
pub async fn bootstrap(config: Arc<Config>) -> Result<Server> {
    config.validate()?;
    let state = Arc::new(SchedulingState::new(config.store.memory_short));
    let store = if config.store.db_path.is_empty() {
        if config.store.memory_short {
            return Err(DagsError::Config(
                "store.memory_short requires store.db_path".into(),
            ));
        }
        None
    } else {
        let store = Store::open(&config.store.db_path).await?;
        let loaded = store.load_into(&state, config.store.memory_short).await?;
        if loaded > 0 {
            tracing::info!(groups = loaded, "scheduling state rebuilt from store");
        }
        Some(store)
    };
    Server::bind(config, state, store).await
}
