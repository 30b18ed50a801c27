//! Stagehand build server.
//!
//! Serves the agent RPC API and build cancellation on top of the manager, the
//! stage queue and the configured store.

use clap::Parser;
use stagehand_core::{System, now};
use stagehand_db::{Stores, create_pool, run_migrations};
use stagehand_manager::{
    DirectoryConfigService, Hub, LiveLog, Manager, ManagerConfig, NoopStatus,
    PassthroughConverter, Services, TokenNetrcService,
};
use stagehand_rpc::{RpcState, ServerConfig};
use stagehand_scheduler::{MemoryQueue, QueueConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Parser)]
#[command(name = "stagehand-server")]
#[command(about = "Stagehand build server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "STAGEHAND_ADDR", default_value = "0.0.0.0:3000")]
    addr: SocketAddr,

    /// Shared secret agents authenticate with
    #[arg(long, env = "STAGEHAND_RPC_SECRET", hide_env_values = true)]
    rpc_secret: String,

    /// PostgreSQL connection string; state is kept in memory when unset
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Maximum number of queued stages
    #[arg(long, env = "STAGEHAND_QUEUE_CAPACITY", default_value_t = 1024)]
    queue_capacity: usize,

    /// Seconds between reconciliations of the queue with the store
    #[arg(long, env = "STAGEHAND_QUEUE_SYNC_INTERVAL", default_value_t = 60)]
    queue_sync_interval: u64,

    /// Directory holding pipeline configuration files
    #[arg(long, env = "STAGEHAND_CONFIG_ROOT", default_value = ".")]
    config_root: PathBuf,

    /// Public URL of this server
    #[arg(long, env = "STAGEHAND_SERVER_URL", default_value = "http://localhost:3000")]
    server_url: String,

    /// Seconds an agent's request for work may block
    #[arg(long, env = "STAGEHAND_REQUEST_TIMEOUT", default_value_t = 30)]
    request_timeout: u64,

    /// Seconds an agent's watch for cancellation may block
    #[arg(long, env = "STAGEHAND_WATCH_TIMEOUT", default_value_t = 30)]
    watch_timeout: u64,

    /// Hand out clone credentials for public repositories too
    #[arg(long, env = "STAGEHAND_PRIVATE_MODE")]
    private_mode: bool,

    /// Delete builds older than this many days
    #[arg(long, env = "STAGEHAND_RETENTION_DAYS")]
    retention_days: Option<u64>,

    /// Emit logs as JSON
    #[arg(long, env = "STAGEHAND_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn system(&self) -> System {
        let (proto, host) = match self.server_url.split_once("://") {
            Some((proto, host)) => (proto, host.trim_end_matches('/')),
            None => ("http", self.server_url.trim_end_matches('/')),
        };
        System {
            proto: proto.to_string(),
            host: host.to_string(),
            link: format!("{proto}://{host}"),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            request_timeout: Duration::from_secs(self.request_timeout),
            watch_timeout: Duration::from_secs(self.watch_timeout),
        }
    }

    /// The HTTP layer waits slightly longer than the manager so the manager's
    /// own deadline is what callers normally observe.
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            secret: self.rpc_secret.clone(),
            request_timeout: Duration::from_secs(self.request_timeout + 5),
            watch_timeout: Duration::from_secs(self.watch_timeout + 5),
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn open_stores(database_url: Option<&str>) -> anyhow::Result<Stores> {
    let Some(url) = database_url else {
        warn!("DATABASE_URL not set, using in-memory store");
        return Ok(Stores::memory());
    };
    info!("Connecting to database...");
    let pool = create_pool(url).await?;
    run_migrations(&pool).await?;
    info!("Database connected");
    Ok(Stores::postgres(pool))
}

/// Periodically delete builds older than the retention window.
fn spawn_purge(stores: Stores, retention: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            let before = now() - retention.as_secs() as i64;
            match stores.builds.purge(before).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "Purged old builds"),
                Err(err) => warn!(error = %err, "Cannot purge builds"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    if args.rpc_secret.trim().is_empty() {
        anyhow::bail!("STAGEHAND_RPC_SECRET must not be empty");
    }

    let stores = open_stores(args.database_url.as_deref()).await?;

    let queue = Arc::new(MemoryQueue::new(QueueConfig {
        capacity: args.queue_capacity,
    }));
    let restored = queue.sync(stores.stages.as_ref()).await?;
    info!(restored, "Queue restored");
    queue.clone().spawn_sync(
        stores.stages.clone(),
        Duration::from_secs(args.queue_sync_interval.max(1)),
    );

    if let Some(days) = args.retention_days {
        spawn_purge(stores.clone(), Duration::from_secs(days * 24 * 60 * 60));
    }

    let services = Services {
        config: Arc::new(DirectoryConfigService::new(args.config_root.clone())),
        converter: Arc::new(PassthroughConverter),
        events: Arc::new(Hub::new()),
        logz: Arc::new(LiveLog::new()),
        netrcs: Arc::new(TokenNetrcService::new(args.private_mode)),
        status: Arc::new(NoopStatus),
    };
    let manager = Manager::new(
        stores,
        queue,
        services,
        args.system(),
        args.manager_config(),
    );

    let canceler = manager.canceler();

    let state =
        RpcState::new(Arc::new(manager), args.server_config()).with_canceler(Arc::new(canceler));
    let app = stagehand_rpc::router(state).layer(TraceLayer::new_for_http());

    info!(addr = %args.addr, "Starting server");
    let listener = TcpListener::bind(args.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
