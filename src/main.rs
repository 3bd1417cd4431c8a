//! Master server discovery daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::signal;
use tokio::sync::watch;

use mastersrv::cleaner::{Cleaner, Refresher, RetryLimits};
use mastersrv::clock;
use mastersrv::config::{Config, StoreKind};
use mastersrv::probe::Goal;
use mastersrv::prober::{DetailsProber, PortProber, Probers, Runner};
use mastersrv::query::UdpQuery;
use mastersrv::repository::shared::{self, EtcdStore, Keyspace, LockManager};
use mastersrv::repository::{memory, Repositories};

const ETCD_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

async fn repositories(cfg: &Config) -> anyhow::Result<Repositories> {
    let clock = clock::system();
    match cfg.store {
        StoreKind::Memory => Ok(memory::repositories(clock)),
        StoreKind::Etcd => {
            let store = Arc::new(
                EtcdStore::connect(cfg.etcd_endpoints.clone(), ETCD_CONNECT_TIMEOUT).await?,
            );
            let locks = LockManager::new(store.clone())
                .with_ttl(cfg.lock_ttl())
                .with_attempts(cfg.lock_attempts);
            Ok(shared::repositories(
                store,
                Keyspace::new(cfg.etcd_prefix.clone()),
                locks,
                clock,
            ))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting mastersrv with config: {:?}", cfg);

    let repos = repositories(&cfg).await?;
    let clock = clock::system();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Prober runner
    let probers = Probers::new(
        Arc::new(PortProber::with_offsets(UdpQuery, cfg.port_offsets.clone())),
        Arc::new(DetailsProber::new(UdpQuery)),
    );
    let runner = Runner::start(cfg.runner(), repos.clone(), probers, clock.clone());

    // Retention sweeps
    let cleaner = Cleaner::new(
        repos.clone(),
        clock.clone(),
        cfg.server_retention(),
        cfg.instance_retention(),
    );
    let cleaner_handle = tokio::spawn(cleaner.run(cfg.cleaner_interval(), shutdown_rx.clone()));

    // Details refresh
    let refresher = Refresher::new(
        repos.clone(),
        clock,
        cfg.refresh_interval(),
        cfg.refresh_active(),
        RetryLimits {
            port: cfg.port_max_retries,
            details: cfg.details_max_retries,
        },
    );
    let refresher_handle = tokio::spawn(refresher.run(shutdown_rx));

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    let stats = runner.stats();
    let _ = shutdown_tx.send(true);
    runner.stop().await;
    for (name, handle) in [("cleaner", cleaner_handle), ("refresher", refresher_handle)] {
        if let Err(e) = handle.await {
            error!("{} task failed: {}", name, e);
        }
    }

    for goal in Goal::ALL {
        info!("{} probes: {:?}", goal, stats.goal(goal));
    }
    info!("Shutdown complete.");
    Ok(())
}
