//! Periodic maintenance: dropping stale servers and instances, and queueing
//! rediscovery probes for live servers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::clock::SharedClock;
use crate::error::RepoError;
use crate::filterset::{InstanceFilterSet, ServerFilterSet};
use crate::probe::{Goal, Probe};
use crate::prober::runner::stopped;
use crate::repository::Repositories;
use crate::server::Server;
use crate::status::DiscoveryStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub servers_removed: usize,
    /// Stale when listed but written to again before the removal landed.
    pub servers_kept: usize,
    pub instances_removed: usize,
}

pub struct Cleaner {
    repos: Repositories,
    clock: SharedClock,
    server_retention: chrono::Duration,
    instance_retention: chrono::Duration,
}

impl Cleaner {
    pub fn new(
        repos: Repositories,
        clock: SharedClock,
        server_retention: chrono::Duration,
        instance_retention: chrono::Duration,
    ) -> Self {
        Self {
            repos,
            clock,
            server_retention,
            instance_retention,
        }
    }

    pub async fn sweep(&self) -> Result<CleanReport, RepoError> {
        let now = self.clock.now();
        let mut report = CleanReport::default();

        let stale = self
            .repos
            .servers
            .filter(&ServerFilterSet::new().updated_before(now - self.server_retention))
            .await?;
        for server in stale {
            let declined = AtomicBool::new(false);
            let keep = |_: &mut Server| {
                declined.store(true, Ordering::Relaxed);
                false
            };
            match self.repos.servers.remove(&server, &keep).await {
                Ok(()) if declined.load(Ordering::Relaxed) => report.servers_kept += 1,
                Ok(()) => report.servers_removed += 1,
                Err(e) if e.is_contention() => {
                    warn!("Skipping removal of {}: {}", server.addr, e);
                    report.servers_kept += 1;
                }
                Err(e) => return Err(e),
            }
        }

        report.instances_removed = self
            .repos
            .instances
            .clear(&InstanceFilterSet::new().updated_before(now - self.instance_retention))
            .await?;
        Ok(report)
    }

    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }
            match self.sweep().await {
                Ok(report) if report == CleanReport::default() => {}
                Ok(report) => info!(
                    "Removed {} servers ({} kept) and {} instances",
                    report.servers_removed, report.servers_kept, report.instances_removed
                ),
                Err(e) => error!("Cleanup failed: {}", e),
            }
        }
        debug!("Cleaner exiting");
    }
}

/// Retry ceilings for the probes a refresh sweep queues.
#[derive(Debug, Clone, Copy)]
pub struct RetryLimits {
    pub port: u32,
    pub details: u32,
}

/// Keeps live servers discovered: details are re-fetched for servers with a
/// known query port, and port discovery is re-attempted for those without one.
pub struct Refresher {
    repos: Repositories,
    clock: SharedClock,
    interval: chrono::Duration,
    active_window: chrono::Duration,
    retries: RetryLimits,
}

impl Refresher {
    pub fn new(
        repos: Repositories,
        clock: SharedClock,
        interval: chrono::Duration,
        active_window: chrono::Duration,
        retries: RetryLimits,
    ) -> Self {
        Self {
            repos,
            clock,
            interval,
            active_window,
            retries,
        }
    }

    /// Queues one probe per live server and returns how many were queued. The
    /// probes expire when the next sweep would queue their replacements.
    pub async fn sweep(&self) -> Result<usize, RepoError> {
        let now = self.clock.now();
        let live = ServerFilterSet::new().active_after(now - self.active_window);
        let expires_at = now + self.interval;

        let with_port = self
            .repos
            .servers
            .filter(&live.with_status(DiscoveryStatus::PORT))
            .await?;
        let without_port = self
            .repos
            .servers
            .filter(&live.no_status(DiscoveryStatus::PORT | DiscoveryStatus::PORT_RETRY))
            .await?;

        let probes = with_port
            .iter()
            .map(|server| {
                Probe::new(server.addr, server.query_port, Goal::Details, self.retries.details)
            })
            .chain(without_port.iter().map(|server| {
                Probe::new(server.addr, server.addr.port(), Goal::Port, self.retries.port)
            }));
        let mut queued = 0;
        for probe in probes {
            self.repos
                .probes
                .add_between(probe, None, Some(expires_at))
                .await?;
            queued += 1;
        }
        Ok(queued)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.interval.to_std().unwrap_or(Duration::from_secs(60));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }
            match self.sweep().await {
                Ok(queued) => debug!("Queued {} refresh probes", queued),
                Err(e) => error!("Refresh failed: {}", e),
            }
        }
        debug!("Refresher exiting");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration as TimeDelta;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::repository::{decline, memory};

    fn server(addr: &str) -> Server {
        Server::new(addr.parse().unwrap(), 10481)
    }

    #[tokio::test]
    async fn removes_only_stale_servers() {
        let clock = Arc::new(ManualClock::default());
        let repos = memory::repositories(clock.clone());
        repos.servers.add(server("1.1.1.1:10480"), &decline).await.unwrap();
        clock.advance(TimeDelta::minutes(30));
        repos.servers.add(server("2.2.2.2:10480"), &decline).await.unwrap();
        clock.advance(TimeDelta::minutes(40));

        let cleaner = Cleaner::new(
            repos.clone(),
            clock.clone(),
            TimeDelta::hours(1),
            TimeDelta::minutes(10),
        );
        let report = cleaner.sweep().await.unwrap();
        assert_eq!(report.servers_removed, 1);
        assert_eq!(report.servers_kept, 0);
        assert_eq!(repos.servers.count().await.unwrap(), 1);
        assert!(repos.servers.get(&"2.2.2.2:10480".parse().unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn refreshes_live_servers() {
        let clock = Arc::new(ManualClock::default());
        let repos = memory::repositories(clock.clone());

        let mut live = server("1.1.1.1:10480");
        live.update_discovery_status(DiscoveryStatus::PORT);
        live.refresh(clock.now());
        repos.servers.add(live, &decline).await.unwrap();

        let mut idle = server("2.2.2.2:10480");
        idle.update_discovery_status(DiscoveryStatus::PORT);
        idle.refresh(clock.now() - TimeDelta::hours(1));
        repos.servers.add(idle, &decline).await.unwrap();

        let mut portless = server("3.3.3.3:10480");
        portless.refresh(clock.now());
        repos.servers.add(portless, &decline).await.unwrap();

        let mut retrying = server("4.4.4.4:10480");
        retrying.update_discovery_status(DiscoveryStatus::PORT_RETRY);
        retrying.refresh(clock.now());
        repos.servers.add(retrying, &decline).await.unwrap();

        let refresher = Refresher::new(
            repos.clone(),
            clock.clone(),
            TimeDelta::minutes(1),
            TimeDelta::minutes(5),
            RetryLimits { port: 2, details: 3 },
        );
        assert_eq!(refresher.sweep().await.unwrap(), 2);
        let (probes, _) = repos.probes.pop_many(10).await.unwrap();
        assert_eq!(probes.len(), 2);
        let details = probes.iter().find(|p| p.goal == Goal::Details).unwrap();
        assert_eq!(details.addr, "1.1.1.1:10480".parse().unwrap());
        assert_eq!(details.port, 10481);
        assert_eq!(details.max_retries, 3);
        let port = probes.iter().find(|p| p.goal == Goal::Port).unwrap();
        assert_eq!(port.addr, "3.3.3.3:10480".parse().unwrap());
        assert_eq!(port.port, 10480);
        assert_eq!(port.max_retries, 2);

        // not picked up before the next sweep: gone
        refresher.sweep().await.unwrap();
        clock.advance(TimeDelta::minutes(1));
        let (probes, expired) = repos.probes.pop_many(10).await.unwrap();
        assert!(probes.is_empty());
        assert_eq!(expired, 2);
    }
}
