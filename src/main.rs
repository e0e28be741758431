use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use storage_cluster::bucket::handlers as bucket_handlers;
use storage_cluster::bucket::store::{BlobStore, BlobStoreSnapshot};
use storage_cluster::directory::handlers as directory_handlers;
use storage_cluster::directory::index::{Directory, DirectoryData};
use storage_cluster::directory::protocol::{
    AddUserRequest, AddUserResponse, ENDPOINT_HEARTBEAT, ENDPOINT_REGISTER_BUCKET, ENDPOINT_USER,
    HeartbeatRequest, RegisterBucketRequest,
};
use storage_cluster::directory::types::{BucketId, UserId};

#[derive(Parser)]
#[command(version, about = "Content-addressed storage cluster node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the index directory node
    Index(IndexArgs),
    /// Run a bucket storage node
    Bucket(BucketArgs),
    /// Provision a user account on a running index
    AddUser(AddUserArgs),
}

#[derive(Args)]
struct IndexArgs {
    /// Listen address for the index HTTP server
    #[arg(long, env = "STORAGE_INDEX_BIND", default_value = "127.0.0.1:7000")]
    bind: SocketAddr,

    /// How long a reservation may stay pending before it is reclaimed
    #[arg(long, env = "STORAGE_LEASE_TIMEOUT_SECS", default_value_t = 300)]
    lease_timeout_secs: u64,

    /// Interval of the background sweep for expired leases
    #[arg(long, env = "STORAGE_RECLAIM_INTERVAL_SECS", default_value_t = 30)]
    reclaim_interval_secs: u64,

    /// State snapshot file, loaded at startup and written on shutdown
    #[arg(long, env = "STORAGE_INDEX_SNAPSHOT")]
    snapshot: Option<PathBuf>,
}

#[derive(Args)]
struct BucketArgs {
    /// Listen address for the bucket HTTP server
    #[arg(long, env = "STORAGE_BUCKET_BIND", default_value = "127.0.0.1:7100")]
    bind: SocketAddr,

    /// Address advertised to the index (defaults to the bind address)
    #[arg(long, env = "STORAGE_BUCKET_ADVERTISE")]
    advertise: Option<SocketAddr>,

    /// Base URL of the index node
    #[arg(long, env = "STORAGE_INDEX_URL", default_value = "http://127.0.0.1:7000")]
    index: String,

    /// Total capacity in bytes this bucket offers the cluster
    #[arg(long, env = "STORAGE_BUCKET_CAPACITY", default_value_t = 1_073_741_824)]
    capacity: u64,

    /// Heartbeat interval towards the index
    #[arg(long, env = "STORAGE_HEARTBEAT_SECS", default_value_t = 5)]
    heartbeat_secs: u64,

    /// State snapshot file, loaded at startup and written on shutdown
    #[arg(long, env = "STORAGE_BUCKET_SNAPSHOT")]
    snapshot: Option<PathBuf>,
}

#[derive(Args)]
struct AddUserArgs {
    /// Base URL of the index node
    #[arg(long, env = "STORAGE_INDEX_URL", default_value = "http://127.0.0.1:7000")]
    index: String,

    /// Identity of the account to create
    #[arg(long)]
    user_id: String,

    /// Quota ceiling in bytes
    #[arg(long)]
    byte_limit: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    match Cli::parse().command {
        Command::Index(args) => run_index(args).await,
        Command::Bucket(args) => run_bucket(args).await,
        Command::AddUser(args) => run_add_user(args).await,
    }
}

async fn run_index(args: IndexArgs) -> Result<()> {
    let lease_timeout = Duration::from_secs(args.lease_timeout_secs);

    let data = match &args.snapshot {
        Some(path) if path.exists() => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read snapshot {}", path.display()))?;
            let data: DirectoryData =
                bincode::deserialize(&bytes).context("failed to decode directory snapshot")?;
            tracing::info!("Restored directory state from {}", path.display());
            data
        }
        _ => DirectoryData::default(),
    };
    let directory = Arc::new(Directory::restore(data, lease_timeout));

    // Background sweep so stale reservations never pin capacity for long.
    let reclaimer = directory.clone();
    let reclaim_interval = Duration::from_secs(args.reclaim_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reclaim_interval);
        loop {
            interval.tick().await;
            let reclaimed = reclaimer.reclaim_expired().await;
            if reclaimed > 0 {
                tracing::info!("Background sweep reclaimed {} expired leases", reclaimed);
            }
        }
    });

    let app = directory_handlers::router(directory.clone());
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!("Index directory listening on {}", args.bind);
    tracing::info!("Press Ctrl+C to shutdown");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(path) = &args.snapshot {
        let bytes = bincode::serialize(&directory.snapshot().await)
            .context("failed to encode directory snapshot")?;
        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write snapshot {}", path.display()))?;
        tracing::info!("Wrote directory snapshot to {}", path.display());
    }

    Ok(())
}

async fn run_bucket(args: BucketArgs) -> Result<()> {
    let store = match &args.snapshot {
        Some(path) if path.exists() => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read snapshot {}", path.display()))?;
            let snapshot: BlobStoreSnapshot =
                bincode::deserialize(&bytes).context("failed to decode bucket snapshot")?;
            tracing::info!(
                "Restored {} blobs for bucket {:?} from {}",
                snapshot.blobs.len(),
                snapshot.bucket_id,
                path.display()
            );
            BlobStore::from_snapshot(snapshot, args.capacity)
        }
        _ => BlobStore::new(BucketId::new(), args.capacity),
    };
    let store = Arc::new(store);
    tracing::info!("Bucket node id: {:?}", store.id());

    // Register with the index, then keep heartbeating. A heartbeat the index
    // does not recognize triggers re-registration.
    let agent_store = store.clone();
    let index_url = args.index.trim_end_matches('/').to_string();
    let advertise = args.advertise.unwrap_or(args.bind);
    let capacity = args.capacity;
    let heartbeat_interval = Duration::from_secs(args.heartbeat_secs);
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let version = env!("CARGO_PKG_VERSION").to_string();
        let mut interval = tokio::time::interval(heartbeat_interval);
        let mut registered = false;

        loop {
            if registered {
                let req = HeartbeatRequest {
                    bucket_id: agent_store.id().clone(),
                    version: version.clone(),
                };
                match client
                    .post(format!("{}{}", index_url, ENDPOINT_HEARTBEAT))
                    .json(&req)
                    .send()
                    .await
                {
                    Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                        tracing::warn!("Index no longer knows this bucket, re-registering");
                        registered = false;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Heartbeat failed: {}", e),
                }
            } else {
                let req = RegisterBucketRequest {
                    bucket_id: agent_store.id().clone(),
                    addr: advertise.to_string(),
                    capacity,
                    version: version.clone(),
                };
                match client
                    .post(format!("{}{}", index_url, ENDPOINT_REGISTER_BUCKET))
                    .json(&req)
                    .send()
                    .await
                {
                    Ok(resp) if resp.status().is_success() => {
                        tracing::info!("Registered with index at {}", index_url);
                        registered = true;
                    }
                    Ok(resp) => tracing::warn!("Index refused registration: {}", resp.status()),
                    Err(e) => tracing::warn!("Failed to reach index for registration: {}", e),
                }
            }

            interval.tick().await;
        }
    });

    let app = bucket_handlers::router(store.clone());
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!("Bucket node listening on {}", args.bind);
    tracing::info!("Press Ctrl+C to shutdown");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(path) = &args.snapshot {
        let bytes =
            bincode::serialize(&store.snapshot()).context("failed to encode bucket snapshot")?;
        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write snapshot {}", path.display()))?;
        tracing::info!("Wrote bucket snapshot to {}", path.display());
    }

    Ok(())
}

async fn run_add_user(args: AddUserArgs) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}{}", args.index.trim_end_matches('/'), ENDPOINT_USER);

    let response = client
        .post(url)
        .json(&AddUserRequest {
            user_id: UserId(args.user_id.clone()),
            byte_limit: args.byte_limit,
        })
        .send()
        .await
        .context("failed to reach the index node")?;

    let status = response.status();
    let body: AddUserResponse = response
        .json()
        .await
        .context("index returned an unreadable response")?;

    if body.success {
        println!(
            "Added user {} with byte limit {}",
            args.user_id, args.byte_limit
        );
        Ok(())
    } else {
        anyhow::bail!("index refused ({}): {:?}", status, body.error)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
