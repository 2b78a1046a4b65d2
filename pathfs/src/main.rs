use std::path::Path;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, instrument, warn};
use tracing_subscriber::EnvFilter;

use pathfs::adapter::Adapter;
use pathfs::config::{Args, EngineKind, MountConfig};
use pathfs::engine::{DirEngine, MemoryEngine, StorageEngine};
use pathfs::fuse::PathFs;
use pathfs::fuse::mount::mount;
use pathfs::ops::OperationTable;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = MountConfig::from_args(&args).context("invalid mount options")?;

    match args.engine {
        EngineKind::Dir => run::<DirEngine>(&args.mountpoint, &args.backing, &config).await,
        EngineKind::Memory => run::<MemoryEngine>(&args.mountpoint, &args.backing, &config).await,
    }
}

#[instrument(skip(config), fields(engine = std::any::type_name::<E>()))]
async fn run<E>(mountpoint: &Path, backing: &Path, config: &MountConfig) -> anyhow::Result<()>
where
    E: StorageEngine + 'static,
{
    let engine = E::init(backing)
        .await
        .with_context(|| format!("failed to initialize engine at {}", backing.display()))?;

    let table = OperationTable::STANDARD;
    info!(operations = ?table.names(), "registered operations");
    let fs = PathFs::new(Adapter::new(engine), table);

    let mut mount_handle = mount(fs, mountpoint, config)
        .await
        .with_context(|| format!("failed to mount at {}", mountpoint.display()))?;
    info!(fs_name = %config.fs_name, "mounted; press Ctrl+C to unmount");

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => res.context("fuse session ended with an error")?,
        _ = signal::ctrl_c() => {
            info!("unmounting");
            if let Err(e) = mount_handle.unmount().await {
                warn!(error = %e, "unmount failed");
            }
        }
    }
    Ok(())
}
