//! Declarative queries for the repository `filter`/`clear` operations.
//!
//! Every predicate is optional; an absent predicate places no constraint on
//! its dimension. Bits given to one `with_status`/`no_status` call are ORed
//! into the mask, dimensions are ANDed together. Time bounds are exclusive.

use chrono::{DateTime, Utc};

use crate::status::DiscoveryStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerFilterSet {
    with_status: Option<DiscoveryStatus>,
    no_status: Option<DiscoveryStatus>,
    updated_before: Option<DateTime<Utc>>,
    updated_after: Option<DateTime<Utc>>,
    active_before: Option<DateTime<Utc>>,
    active_after: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

impl ServerFilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches servers that have all of the given bits.
    pub fn with_status(mut self, status: DiscoveryStatus) -> Self {
        self.with_status = Some(self.with_status.unwrap_or_default() | status);
        self
    }

    /// Matches servers that have none of the given bits.
    pub fn no_status(mut self, status: DiscoveryStatus) -> Self {
        self.no_status = Some(self.no_status.unwrap_or_default() | status);
        self
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn updated_after(mut self, at: DateTime<Utc>) -> Self {
        self.updated_after = Some(at);
        self
    }

    pub fn active_before(mut self, at: DateTime<Utc>) -> Self {
        self.active_before = Some(at);
        self
    }

    pub fn active_after(mut self, at: DateTime<Utc>) -> Self {
        self.active_after = Some(at);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn get_with_status(&self) -> Option<DiscoveryStatus> {
        self.with_status
    }

    pub fn get_no_status(&self) -> Option<DiscoveryStatus> {
        self.no_status
    }

    pub fn get_updated_range(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (self.updated_after, self.updated_before)
    }

    pub fn get_active_range(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (self.active_after, self.active_before)
    }

    pub fn get_limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn has_active_bounds(&self) -> bool {
        self.active_after.is_some() || self.active_before.is_some()
    }

    pub fn matches_status(&self, status: DiscoveryStatus) -> bool {
        if let Some(with) = self.with_status {
            if !status.contains(with) {
                return false;
            }
        }
        if let Some(without) = self.no_status {
            if !status.is_disjoint(without) {
                return false;
            }
        }
        true
    }

    pub fn matches_updated(&self, updated_at: DateTime<Utc>) -> bool {
        in_range(updated_at, self.updated_after, self.updated_before)
    }

    /// A server that never reported liveness fails any activity bound.
    pub fn matches_active(&self, refreshed_at: Option<DateTime<Utc>>) -> bool {
        if !self.has_active_bounds() {
            return true;
        }
        match refreshed_at {
            Some(at) => in_range(at, self.active_after, self.active_before),
            None => false,
        }
    }

    pub fn matches(
        &self,
        status: DiscoveryStatus,
        updated_at: DateTime<Utc>,
        refreshed_at: Option<DateTime<Utc>>,
    ) -> bool {
        self.matches_status(status)
            && self.matches_updated(updated_at)
            && self.matches_active(refreshed_at)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceFilterSet {
    updated_before: Option<DateTime<Utc>>,
}

impl InstanceFilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn matches_updated(&self, updated_at: DateTime<Utc>) -> bool {
        in_range(updated_at, None, self.updated_before)
    }
}

fn in_range(
    at: DateTime<Utc>,
    after: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
) -> bool {
    after.map_or(true, |after| at > after) && before.map_or(true, |before| at < before)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let fs = ServerFilterSet::new();
        assert!(fs.matches(DiscoveryStatus::NONE, t(0), None));
        assert!(fs.matches(DiscoveryStatus::MASTER, t(10), Some(t(5))));
    }

    #[test]
    fn status_include_exclude() {
        let fs = ServerFilterSet::new()
            .with_status(DiscoveryStatus::MASTER)
            .with_status(DiscoveryStatus::INFO)
            .no_status(DiscoveryStatus::NO_PORT);
        assert!(fs.matches_status(DiscoveryStatus::MASTER | DiscoveryStatus::INFO));
        assert!(!fs.matches_status(DiscoveryStatus::MASTER));
        assert!(!fs.matches_status(
            DiscoveryStatus::MASTER | DiscoveryStatus::INFO | DiscoveryStatus::NO_PORT
        ));
    }

    #[test]
    fn time_bounds_are_exclusive() {
        let fs = ServerFilterSet::new().updated_after(t(0)).updated_before(t(10));
        assert!(!fs.matches_updated(t(0)));
        assert!(fs.matches_updated(t(0) + Duration::milliseconds(1)));
        assert!(!fs.matches_updated(t(10)));
    }

    #[test]
    fn activity_requires_refresh() {
        let fs = ServerFilterSet::new().active_after(t(0));
        assert!(!fs.matches_active(None));
        assert!(fs.matches_active(Some(t(1))));
        assert!(!fs.matches_active(Some(t(-1))));
    }

    #[test]
    fn instance_filter() {
        let fs = InstanceFilterSet::new().updated_before(t(5));
        assert!(fs.matches_updated(t(4)));
        assert!(!fs.matches_updated(t(5)));
        assert!(InstanceFilterSet::new().matches_updated(t(100)));
    }
}
