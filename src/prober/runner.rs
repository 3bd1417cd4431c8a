//! Prober runner.
//!
//! A scheduler ticks at a fixed interval, pops as many ready probes as there
//! are idle workers and hands them over a bounded channel to a fixed pool of
//! workers. A tick that finds every worker busy pops nothing; the probes stay
//! queued for a later tick.
//!
//! A failed probe is requeued `e^retries` seconds out until it reaches its
//! retry ceiling, after which the server is marked as failed for that goal.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{ProbeResult, Prober, Probers};
use crate::clock::SharedClock;
use crate::error::{QueryError, RepoError};
use crate::probe::{Goal, Probe};
use crate::repository::Repositories;
use crate::server::Server;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub workers: usize,
    pub tick: Duration,
    pub probe_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            tick: Duration::from_millis(250),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

/// Delay before the `retries`-th retry.
pub fn retry_delay(retries: u32) -> chrono::Duration {
    let millis = (f64::from(retries).exp() * 1000.0) as i64;
    chrono::Duration::milliseconds(millis)
}

#[derive(Debug, Default)]
struct GoalCounters {
    success: AtomicU64,
    retry: AtomicU64,
    failure: AtomicU64,
    error: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GoalStats {
    pub success: u64,
    pub retry: u64,
    pub failure: u64,
    pub error: u64,
}

/// Outcome counters per goal, plus probes found expired in the queue.
#[derive(Debug, Default)]
pub struct RunnerStats {
    goals: [GoalCounters; 2],
    expired: AtomicU64,
}

impl RunnerStats {
    pub fn goal(&self, goal: Goal) -> GoalStats {
        let c = &self.goals[goal.index()];
        GoalStats {
            success: c.success.load(Ordering::Relaxed),
            retry: c.retry.load(Ordering::Relaxed),
            failure: c.failure.load(Ordering::Relaxed),
            error: c.error.load(Ordering::Relaxed),
        }
    }

    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    fn counters(&self, goal: Goal) -> &GoalCounters {
        &self.goals[goal.index()]
    }
}

#[derive(Debug)]
struct Gauges {
    total: usize,
    busy: AtomicUsize,
}

impl Gauges {
    fn available(&self) -> usize {
        self.total.saturating_sub(self.busy.load(Ordering::Relaxed))
    }
}

/// Everything a worker needs to carry out one probe.
struct Context {
    repos: Repositories,
    probers: Probers,
    clock: SharedClock,
    timeout: Duration,
    stats: Arc<RunnerStats>,
}

enum Outcome {
    Success,
    Retry,
    Failure,
    /// The server went away before it could be probed.
    Skipped,
}

pub struct Runner {
    shutdown: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<RunnerStats>,
    gauges: Arc<Gauges>,
}

impl Runner {
    /// Spawns the worker pool and the scheduler onto the current runtime.
    pub fn start(
        config: RunnerConfig,
        repos: Repositories,
        probers: Probers,
        clock: SharedClock,
    ) -> Self {
        let workers = config.workers.max(1);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (work_tx, work_rx) = mpsc::channel::<Probe>(workers);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let stats = Arc::new(RunnerStats::default());
        let gauges = Arc::new(Gauges {
            total: workers,
            busy: AtomicUsize::new(0),
        });
        let ctx = Arc::new(Context {
            repos: repos.clone(),
            probers,
            clock,
            timeout: config.probe_timeout,
            stats: stats.clone(),
        });

        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(work(
                    id,
                    ctx.clone(),
                    work_rx.clone(),
                    gauges.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();
        let scheduler = tokio::spawn(schedule(
            config.tick,
            repos,
            work_tx,
            gauges.clone(),
            stats.clone(),
            shutdown_rx,
        ));
        info!("Prober runner started with {} workers", workers);

        Self {
            shutdown,
            scheduler,
            workers: handles,
            stats,
            gauges,
        }
    }

    pub fn stats(&self) -> Arc<RunnerStats> {
        self.stats.clone()
    }

    /// (busy, available) workers.
    pub fn workers(&self) -> (usize, usize) {
        let busy = self.gauges.busy.load(Ordering::Relaxed);
        (busy, self.gauges.total.saturating_sub(busy))
    }

    /// Stops scheduling, abandons in-flight probes and waits for every task.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.scheduler.await {
            error!("Prober scheduler panicked: {}", e);
        }
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!("Prober worker panicked: {}", e);
            }
        }
        info!("Prober runner stopped");
    }
}

/// Resolves once shutdown was requested or the runner went away.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn schedule(
    tick: Duration,
    repos: Repositories,
    work_tx: mpsc::Sender<Probe>,
    gauges: Arc<Gauges>,
    stats: Arc<RunnerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }

        let capacity = gauges.available().min(work_tx.capacity());
        if capacity == 0 {
            continue;
        }
        let (probes, expired) = match repos.probes.pop_many(capacity).await {
            Ok(popped) => popped,
            Err(e) => {
                error!("Failed to pop probes: {}", e);
                continue;
            }
        };
        if expired > 0 {
            debug!("Discarded {} expired probes", expired);
            stats.expired.fetch_add(expired as u64, Ordering::Relaxed);
        }
        for probe in probes {
            match work_tx.try_send(probe) {
                Ok(()) => {}
                Err(TrySendError::Full(probe)) | Err(TrySendError::Closed(probe)) => {
                    warn!("No worker for probe {} ({}), requeueing", probe.addr, probe.goal);
                    if let Err(e) = repos.probes.add(probe).await {
                        error!("Failed to requeue probe: {}", e);
                    }
                }
            }
        }
    }
    debug!("Prober scheduler exiting");
}

async fn work(
    id: usize,
    ctx: Arc<Context>,
    work_rx: Arc<Mutex<mpsc::Receiver<Probe>>>,
    gauges: Arc<Gauges>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            _ = stopped(&mut shutdown) => None,
            probe = async { work_rx.lock().await.recv().await } => probe,
        };
        let Some(probe) = next else {
            break;
        };
        debug!("Worker {} picked {} probe of {}", id, probe.goal, probe.addr);

        gauges.busy.fetch_add(1, Ordering::Relaxed);
        let goal = probe.goal;
        let addr = probe.addr;
        let finished = tokio::select! {
            _ = stopped(&mut shutdown) => false,
            outcome = ctx.run(probe) => {
                let counters = ctx.stats.counters(goal);
                match outcome {
                    Ok(Outcome::Success) => counters.success.fetch_add(1, Ordering::Relaxed),
                    Ok(Outcome::Retry) => counters.retry.fetch_add(1, Ordering::Relaxed),
                    Ok(Outcome::Failure) => counters.failure.fetch_add(1, Ordering::Relaxed),
                    Ok(Outcome::Skipped) => 0,
                    Err(e) => {
                        error!("Worker {}: {} probe of {} failed: {}", id, goal, addr, e);
                        counters.error.fetch_add(1, Ordering::Relaxed)
                    }
                };
                true
            }
        };
        gauges.busy.fetch_sub(1, Ordering::Relaxed);
        if !finished {
            break;
        }
    }
    debug!("Prober worker {} exiting", id);
}

impl Context {
    async fn run(&self, mut probe: Probe) -> Result<Outcome, RepoError> {
        let prober = self.probers.get(probe.goal).clone();
        let server = match self.repos.servers.get(&probe.addr).await {
            Ok(server) => server,
            Err(RepoError::NotFound) => {
                debug!("Server {} is gone, dropping {} probe", probe.addr, probe.goal);
                return Ok(Outcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let result = match tokio::time::timeout(
            self.timeout,
            prober.probe(probe.addr, probe.port, self.timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout),
        };

        match result {
            Ok(result) => {
                let next = match prober.handle_success(&result, server) {
                    Ok(next) => next,
                    Err(e) => {
                        warn!(
                            "{} prober returned an unusable result for {}: {}",
                            probe.goal, probe.addr, e
                        );
                        return Ok(Outcome::Failure);
                    }
                };
                self.persist_success(prober.as_ref(), &result, next).await?;
                debug!("{} probe of {} succeeded", probe.goal, probe.addr);
                Ok(Outcome::Success)
            }
            Err(e) => {
                debug!("{} probe of {} failed: {}", probe.goal, probe.addr, e);
                match probe.inc_retries() {
                    Some(retries) => {
                        let delay = retry_delay(retries);
                        let not_before = retry_at(self.clock.now(), retries);
                        info!(
                            "Retrying {} probe of {} in {}ms (retry {}/{})",
                            probe.goal,
                            probe.addr,
                            delay.num_milliseconds(),
                            retries,
                            probe.max_retries
                        );
                        let next = prober.handle_retry(server);
                        self.repos
                            .probes
                            .add_between(probe, Some(not_before), None)
                            .await?;
                        let retry = |stored: &mut Server| {
                            *stored = prober.handle_retry(stored.clone());
                            true
                        };
                        self.persist(next, &retry).await?;
                        Ok(Outcome::Retry)
                    }
                    None => {
                        info!(
                            "Giving up on {} probe of {} after {} retries",
                            probe.goal, probe.addr, probe.retries
                        );
                        let next = prober.handle_failure(server);
                        let fail = |stored: &mut Server| {
                            *stored = prober.handle_failure(stored.clone());
                            true
                        };
                        self.persist(next, &fail).await?;
                        Ok(Outcome::Failure)
                    }
                }
            }
        }
    }

    async fn persist_success(
        &self,
        prober: &dyn Prober,
        result: &ProbeResult,
        next: Server,
    ) -> Result<(), RepoError> {
        let reapply = |stored: &mut Server| match prober.handle_success(result, stored.clone()) {
            Ok(resolved) => {
                *stored = resolved;
                true
            }
            Err(_) => false,
        };
        self.persist(next, &reapply).await
    }

    /// Writes `next`, replaying the transition on the stored copy if it moved.
    async fn persist(
        &self,
        next: Server,
        on_conflict: &(dyn Fn(&mut Server) -> bool + Send + Sync),
    ) -> Result<(), RepoError> {
        let addr = next.addr;
        match self.repos.servers.update(next, on_conflict).await {
            Ok(_) => Ok(()),
            Err(RepoError::NotFound) => {
                debug!("Server {} was removed while being probed", addr);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn retry_at(now: DateTime<Utc>, retries: u32) -> DateTime<Utc> {
    now.checked_add_signed(retry_delay(retries))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
