#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Result, anyhow};
use crm_directory::{HttpDirectoryClient, InMemoryDirectory, RemoteDirectory};
use tracing::info;

use crate::{
    bridge::ContactBridge,
    config::Config,
    db::BridgeDb,
    store::BridgeStore,
    sync::{FullResyncPaginator, ResyncReport, SyncScheduler},
};

pub mod bridge;
pub mod cache;
pub mod config;
pub mod db;
pub mod queue;
pub mod schema;
pub mod store;
pub mod sync;

/// Wired components for one bridge process. The scheduler is not running yet.
pub struct BridgeRuntime {
    pub bridge: ContactBridge,
    pub store: BridgeStore,
    pub directory: Arc<dyn RemoteDirectory>,
    pub scheduler: SyncScheduler,
}

/// Opens the configured store, applying the schema when it is Postgres.
pub async fn connect_store(config: &Config) -> Result<BridgeStore> {
    match config.db_url.as_deref() {
        Some(url) => {
            let db = Arc::new(BridgeDb::connect(url).await?);
            db.apply_schema().await?;
            Ok(BridgeStore::postgres(db))
        }
        None => {
            tracing::warn!("no DB_URL configured, cache and queue are in memory only");
            Ok(BridgeStore::memory())
        }
    }
}

pub fn build_directory(config: &Config, offline: bool) -> Result<Arc<dyn RemoteDirectory>> {
    if offline {
        tracing::warn!("offline mode, writes are pushed to an in-process directory");
        return Ok(Arc::new(InMemoryDirectory::default()));
    }
    let http = config.http_directory_config().ok_or_else(|| {
        anyhow!("CRM_DIRECTORY_API_TOKEN is required unless running with --offline")
    })?;
    let client = HttpDirectoryClient::new(http).map_err(|error| anyhow!(error))?;
    Ok(Arc::new(client))
}

pub async fn build_bridge_state(config: &Config, offline: bool) -> Result<BridgeRuntime> {
    let store = connect_store(config).await?;
    let directory = build_directory(config, offline)?;
    let scheduler = SyncScheduler::new(
        store.clone(),
        directory.clone(),
        config.drain.clone(),
        config.refresh.clone(),
    );
    let bridge = ContactBridge::new(
        store.clone(),
        scheduler.trigger(),
        scheduler.status(),
        config.queue_max_attempts,
    );
    Ok(BridgeRuntime {
        bridge,
        store,
        directory,
        scheduler,
    })
}

pub async fn run_resync(config: &Config, runtime: &BridgeRuntime) -> Result<ResyncReport> {
    let paginator = FullResyncPaginator::new(
        runtime.directory.clone(),
        runtime.store.cache.clone(),
        config.resync.clone(),
    );
    Ok(paginator.run().await?)
}

/// Runs the sync loops until Ctrl-C.
pub async fn serve(config: Config, offline: bool) -> Result<()> {
    let runtime = build_bridge_state(&config, offline).await?;

    if config.resync_on_empty_cache && runtime.store.cache.count().await? == 0 {
        info!("contact cache is empty, running full resync");
        match run_resync(&config, &runtime).await {
            Ok(report) => info!(upserted = report.upserted, "cold start resync finished"),
            Err(error) => tracing::warn!(reason = %error, "cold start resync failed"),
        }
    }

    let handle = runtime.scheduler.spawn();
    info!(
        store = runtime.store.backend_name(),
        offline, "crm bridge running"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    handle.shutdown().await;
    Ok(())
}
