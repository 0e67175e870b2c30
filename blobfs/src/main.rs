use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use blobfs::bus::{LocalBus, MessageBus};
use blobfs::cadapter::{BlobStore, InMemoryBlobStore, S3BlobStore, S3Config};
use blobfs::config::{DEFAULT_GID, DEFAULT_SUBSCRIPTION, DEFAULT_UID, FsConfig, INVALIDATION_TOPIC};
use blobfs::daemon::{InvalidationListener, LeaseRenewer};
use blobfs::fuse::BlobFuse;
use blobfs::fuse::mount::mount_unprivileged;
use blobfs::vfs::{FilesystemService, FsContext};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blobfs")]
#[command(about = "Mount blob containers as a filesystem", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Memory,
    S3,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Mount the store on an empty directory until interrupted")]
    Mount {
        #[arg(value_name = "MOUNT_POINT")]
        mount_point: PathBuf,

        /// Path prefix inside the store that becomes the mount root
        #[arg(long, env = "BLOBFS_PREFIX", default_value = "")]
        prefix: String,

        #[arg(long, env = "BLOBFS_BACKEND", value_enum, default_value = "memory")]
        backend: Backend,

        #[arg(long, env = "BLOBFS_S3_ENDPOINT")]
        s3_endpoint: Option<String>,

        #[arg(long, env = "BLOBFS_S3_REGION", default_value = "us-east-1")]
        s3_region: String,

        /// Publish invalidations on the invalidation topic and apply those received.
        /// This binary only wires the in-process bus, so only handles in this process see
        /// them; peer mounts need a cross-process `MessageBus` supplied through the library.
        #[arg(long, env = "BLOBFS_CLUSTER")]
        cluster: bool,

        #[arg(long, env = "BLOBFS_SUBSCRIPTION", default_value = DEFAULT_SUBSCRIPTION)]
        subscription: String,

        #[arg(long, env = "BLOBFS_UID", default_value_t = DEFAULT_UID)]
        uid: u32,

        #[arg(long, env = "BLOBFS_GID", default_value_t = DEFAULT_GID)]
        gid: u32,

        /// Convert block files to append files when opened with O_APPEND
        #[arg(long, env = "BLOBFS_AUTO_CONVERT_TO_APPEND")]
        auto_convert_to_append: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("blobfs=info")),
        )
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Mount {
            mount_point,
            prefix,
            backend,
            s3_endpoint,
            s3_region,
            cluster,
            subscription,
            uid,
            gid,
            auto_convert_to_append,
        } => {
            let store: Arc<dyn BlobStore> = match backend {
                Backend::Memory => Arc::new(InMemoryBlobStore::new()),
                Backend::S3 => {
                    let config = S3Config {
                        endpoint: s3_endpoint,
                        region: s3_region,
                        ..S3Config::default()
                    };
                    Arc::new(
                        S3BlobStore::connect(config)
                            .await
                            .context("failed to connect to s3 backend")?,
                    )
                }
            };
            let bus = Arc::new(LocalBus::new());
            bus.subscribe(INVALIDATION_TOPIC, &subscription);
            let bus: Arc<dyn MessageBus> = bus;

            let config = FsConfig::default()
                .with_prefix(prefix)
                .with_cluster(cluster)
                .with_owner(uid, gid)
                .with_auto_convert_to_append(auto_convert_to_append);
            run_mount(config, store, bus, subscription, mount_point).await
        }
    }
}

async fn run_mount(
    config: FsConfig,
    store: Arc<dyn BlobStore>,
    bus: Arc<dyn MessageBus>,
    subscription: String,
    mount_point: PathBuf,
) -> anyhow::Result<()> {
    let ctx = FsContext::new(config, store, bus);
    let token = CancellationToken::new();

    let workers = vec![
        tokio::spawn(LeaseRenewer::new(ctx.clone()).run(token.clone())),
        tokio::spawn(InvalidationListener::new(ctx.clone(), subscription).run(token.clone())),
    ];

    let fs = BlobFuse::new(FilesystemService::new(ctx));
    let handle = mount_unprivileged(fs, &mount_point)
        .await
        .with_context(|| format!("failed to mount at {}", mount_point.display()))?;
    info!(mount_point = %mount_point.display(), "blobfs mounted");

    wait_for_shutdown().await;
    info!("shutting down");

    token.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            error!("worker exited abnormally: {e}");
        }
    }
    handle.unmount().await.context("failed to unmount")?;
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => error!("failed to install SIGTERM handler: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl_c: {e:?}");
    }
}
