//! # pexd entry point
//!
//! Parses command-line arguments, wires the data plane together, and
//! runs the three long-lived pieces: the plain-HTTP listener, the HTTPS
//! (peer) listener, and the advertisement loop. Exit code 0 on a clean
//! shutdown, 1 on an initialization failure or a fatal server error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum_server::tls_rustls::RustlsConfig;
use clap::{Args, Parser, Subcommand};
use libp2p::identity::Keypair;
use libp2p::Multiaddr;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pex_api::{ApiConfig, AppState, PromMetrics};
use pex_cache::{CacheConfig, ChunkCache, DEFAULT_MAX_COST};
use pex_files::{AzureUrlParser, FilesStore, StoreConfig};
use pex_oci::{advertise, MemoryStore, OciStore};
use pex_routing::{
    ContentRouter, DhtRouter, EventRecorder, LogRecorder, PeerNetwork, RouterConfig, StaticLeader,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// pexd — peer-to-peer pull-through cache for content-addressed
/// artifacts.
#[derive(Parser, Debug)]
#[command(name = "pexd", version, about, long_about = None)]
struct Cli {
    /// Log level: one of debug, info, warn, error.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Plain HTTP listener address.
    #[arg(long, default_value = "127.0.0.1:5000")]
    http_addr: SocketAddr,

    /// HTTPS listener address; serves peers with the node identity
    /// certificate.
    #[arg(long, default_value = "0.0.0.0:5001")]
    https_addr: SocketAddr,

    /// libp2p host bind address.
    #[arg(long, default_value = "0.0.0.0:5003")]
    router_addr: SocketAddr,

    /// Prefetch pool size; 0 disables prefetching.
    #[arg(long, default_value_t = 50)]
    prefetch_workers: usize,

    /// Directory for cached chunk files.
    #[arg(long, default_value = "/var/cache/pexd")]
    cache_dir: PathBuf,

    /// Chunk cache capacity in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_COST)]
    cache_size_bytes: u64,

    /// This node's name; defaults to the HOSTNAME environment variable.
    #[arg(long)]
    node_name: Option<String>,

    /// Multiaddr of the elected leader used to bootstrap the DHT
    /// (including its /p2p/<peer-id> suffix). Absent means this node
    /// leads.
    #[arg(long)]
    bootstrap_peer: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
    };

    match result {
        Ok(()) => {
            info!("server shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = format!("{err:#}"), "server error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let node_name = args
        .node_name
        .clone()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "pexd".to_owned());

    let events: Arc<dyn EventRecorder> = Arc::new(LogRecorder);
    events.initializing();

    let result = serve(args, node_name, Arc::clone(&events)).await;
    if result.is_err() {
        events.failed();
    }
    result
}

async fn serve(
    args: RunArgs,
    node_name: String,
    events: Arc<dyn EventRecorder>,
) -> anyhow::Result<()> {
    let keypair = Keypair::generate_ed25519();
    let network = Arc::new(PeerNetwork::new(&keypair).context("peer network")?);

    let leader = match &args.bootstrap_peer {
        Some(addr) => {
            let addr: Multiaddr = addr.parse().context("bootstrap peer multiaddr")?;
            StaticLeader::new(addr)
        }
        None => StaticLeader::own(),
    };

    let router = Arc::new(
        DhtRouter::start(
            RouterConfig {
                listen_addr: args.router_addr,
                registry_port: args.https_addr.port(),
            },
            keypair,
            Arc::new(leader),
            Arc::clone(&events),
        )
        .await
        .context("router")?,
    );

    let cache = Arc::new(
        ChunkCache::new(CacheConfig {
            max_cost: args.cache_size_bytes,
            ..CacheConfig::new(&args.cache_dir)
        })
        .context("chunk cache")?,
    );

    let prom = Arc::new(PromMetrics::new(&node_name));
    let files = FilesStore::new(
        Arc::clone(&cache),
        router.clone(),
        Arc::clone(&network),
        prom.clone(),
        Arc::new(AzureUrlParser),
        StoreConfig {
            prefetch_workers: args.prefetch_workers,
            node_name: node_name.clone(),
            ..StoreConfig::default()
        },
    );

    // The OCI store client is deployment-specific; standalone nodes run
    // with the in-memory store and mirror only file chunks.
    let oci = Arc::new(MemoryStore::new());
    oci.verify().await.context("oci store")?;

    let cancel = CancellationToken::new();

    let chunk_events = files
        .subscribe()
        .context("files store already subscribed")?;
    let advertiser = tokio::spawn(advertise::advertise(
        router.clone(),
        oci.clone(),
        chunk_events,
        cancel.child_token(),
    ));

    let state = AppState {
        files,
        oci,
        router: router.clone(),
        network: Arc::clone(&network),
        metrics: prom.clone(),
        prom: Some(prom),
        config: ApiConfig {
            node_name,
            ..ApiConfig::default()
        },
    };
    let app = pex_api::app(state);

    // Plain HTTP listener.
    let http_listener = tokio::net::TcpListener::bind(args.http_addr)
        .await
        .with_context(|| format!("bind {}", args.http_addr))?;
    let http_cancel = cancel.clone();
    let http_app = app.clone();
    let http = tokio::spawn(async move {
        axum::serve(http_listener, http_app)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await
    });

    // HTTPS listener with the node identity certificate.
    let tls = RustlsConfig::from_config(network.server_config());
    let https_handle = axum_server::Handle::new();
    let https = {
        let handle = https_handle.clone();
        let app = app.clone();
        tokio::spawn(async move {
            axum_server::bind_rustls(args.https_addr, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        })
    };

    info!(
        http = %args.http_addr,
        https = %args.https_addr,
        router = %args.router_addr,
        "server start"
    );

    shutdown_signal().await;
    info!("shutdown signal received");

    cancel.cancel();
    https_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    router.close().await;

    let http_result = tokio::time::timeout(SHUTDOWN_GRACE, http)
        .await
        .context("http listener did not drain in time")?;
    http_result.context("http listener task")??;
    https.await.context("https listener task")??;
    advertiser.await.context("advertiser task")?;

    Ok(())
}

/// Resolves on SIGTERM or ctrl-c.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("sigterm handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
