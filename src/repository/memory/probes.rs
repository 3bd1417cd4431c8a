use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::clock::SharedClock;
use crate::error::RepoError;
use crate::probe::Probe;
use crate::repository::{window_is_empty, ProbeRepository};

struct Queued {
    ready_at: DateTime<Utc>,
    seq: u64,
    expires_at: Option<DateTime<Utc>>,
    probe: Probe,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ready_at, self.seq).cmp(&(other.ready_at, other.seq))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<Queued>>,
    seq: u64,
}

/// Readiness-ordered probe queue. Items that are not ready yet stay at the
/// back of the heap and stop the scan.
pub struct ProbeMemoryRepo {
    clock: SharedClock,
    queue: Mutex<Queue>,
}

impl ProbeMemoryRepo {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            queue: Mutex::new(Queue::default()),
        }
    }
}

#[async_trait]
impl ProbeRepository for ProbeMemoryRepo {
    async fn add(&self, probe: Probe) -> Result<(), RepoError> {
        self.add_between(probe, None, None).await
    }

    async fn add_between(
        &self,
        probe: Probe,
        not_before: Option<DateTime<Utc>>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepoError> {
        if window_is_empty(not_before, expires_at) {
            return Ok(());
        }
        let ready_at = not_before.unwrap_or_else(|| self.clock.now());
        let mut queue = self.queue.lock().await;
        queue.seq += 1;
        let seq = queue.seq;
        queue.heap.push(Reverse(Queued {
            ready_at,
            seq,
            expires_at,
            probe,
        }));
        Ok(())
    }

    async fn pop(&self) -> Result<Probe, RepoError> {
        let (mut probes, _) = self.pop_many(1).await?;
        probes.pop().ok_or(RepoError::QueueEmpty)
    }

    async fn pop_many(&self, count: usize) -> Result<(Vec<Probe>, usize), RepoError> {
        let now = self.clock.now();
        let mut queue = self.queue.lock().await;
        let mut probes = Vec::with_capacity(count.min(queue.heap.len()));
        let mut expired = 0;
        while probes.len() < count {
            match queue.heap.peek() {
                Some(Reverse(item)) if item.ready_at <= now => {}
                _ => break,
            }
            let Some(Reverse(item)) = queue.heap.pop() else {
                break;
            };
            if item.expires_at.is_some_and(|exp| exp <= now) {
                expired += 1;
                continue;
            }
            probes.push(item.probe);
        }
        Ok((probes, expired))
    }

    async fn count(&self) -> Result<usize, RepoError> {
        Ok(self.queue.lock().await.heap.len())
    }
}
