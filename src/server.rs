//! Server entity and the game state attached to it.
//!
//! A [`Server`] is a point-in-time copy. The repository owns the canonical
//! state; every change goes back through its conflict-aware write path, which
//! is what `version` is for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::addr::Addr;
use crate::status::DiscoveryStatus;

/// Summary of a server as reported in its status response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInfo {
    pub hostname: String,
    pub map_name: String,
    pub game_type: String,
    pub game_variant: String,
    pub game_version: String,
    pub password_protected: bool,
    pub players_current: u32,
    pub players_max: u32,
    pub round_number: u32,
    pub round_limit: u32,
    pub time_left: u32,
    pub time_limit: u32,
    pub swat_score: i32,
    pub suspects_score: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    pub score: i32,
    pub ping: u32,
    pub team: u32,
    pub kills: u32,
    pub deaths: u32,
    pub vip: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,
    pub status: u32,
}

/// Extended game state: map, players and objectives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Details {
    pub info: GameInfo,
    pub players: Vec<Player>,
    pub objectives: Vec<Objective>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub addr: Addr,
    pub query_port: u16,
    pub discovery_status: DiscoveryStatus,
    pub info: GameInfo,
    pub details: Details,
    /// Last liveness signal. `None` until the server has been heard from.
    pub refreshed_at: Option<DateTime<Utc>>,
    /// Write counter, advanced by the repository on every accepted write.
    pub version: u64,
}

impl Server {
    pub fn new(addr: Addr, query_port: u16) -> Self {
        Self {
            addr,
            query_port,
            discovery_status: DiscoveryStatus::NEW,
            info: GameInfo::default(),
            details: Details::default(),
            refreshed_at: None,
            version: 0,
        }
    }

    /// Sets `status` bits. The `new` bit goes away once any other bit is set.
    pub fn update_discovery_status(&mut self, status: DiscoveryStatus) {
        self.discovery_status.insert(status);
        let mut rest = status;
        rest.remove(DiscoveryStatus::NEW);
        if !rest.is_empty() {
            self.discovery_status.remove(DiscoveryStatus::NEW);
        }
    }

    pub fn clear_discovery_status(&mut self, status: DiscoveryStatus) {
        self.discovery_status.remove(status);
    }

    pub fn has_discovery_status(&self, status: DiscoveryStatus) -> bool {
        self.discovery_status.contains(status)
    }

    pub fn update_info(&mut self, info: GameInfo) {
        self.info = info;
    }

    /// Details carry their own copy of the info summary; both are kept in sync.
    pub fn update_details(&mut self, details: Details) {
        self.info = details.info.clone();
        self.details = details;
    }

    pub fn refresh(&mut self, at: DateTime<Utc>) {
        self.refreshed_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Server {
        Server::new("1.1.1.1:10480".parse().unwrap(), 10481)
    }

    #[test]
    fn starts_new_and_unversioned() {
        let svr = server();
        assert_eq!(svr.discovery_status, DiscoveryStatus::NEW);
        assert_eq!(svr.version, 0);
        assert!(svr.refreshed_at.is_none());
    }

    #[test]
    fn new_bit_cleared_by_first_other_bit() {
        let mut svr = server();
        svr.update_discovery_status(DiscoveryStatus::NEW);
        assert_eq!(svr.discovery_status, DiscoveryStatus::NEW);

        svr.update_discovery_status(DiscoveryStatus::MASTER);
        assert_eq!(svr.discovery_status, DiscoveryStatus::MASTER);

        svr.update_discovery_status(DiscoveryStatus::INFO | DiscoveryStatus::PORT);
        assert!(svr.has_discovery_status(
            DiscoveryStatus::MASTER | DiscoveryStatus::INFO | DiscoveryStatus::PORT
        ));

        svr.clear_discovery_status(DiscoveryStatus::PORT);
        assert!(!svr.has_discovery_status(DiscoveryStatus::PORT));
    }

    #[test]
    fn details_update_info() {
        let mut svr = server();
        let details = Details {
            info: GameInfo {
                hostname: "Swat4 Server".into(),
                map_name: "A-Bomb Nightclub".into(),
                ..Default::default()
            },
            players: vec![Player {
                name: "Mosquito".into(),
                ..Default::default()
            }],
            objectives: Vec::new(),
        };
        svr.update_details(details.clone());
        assert_eq!(svr.info.hostname, "Swat4 Server");
        assert_eq!(svr.details, details);
    }

    #[test]
    fn unset_timestamp_survives_serde() {
        let svr = server();
        let json = serde_json::to_string(&svr).unwrap();
        let back: Server = serde_json::from_str(&json).unwrap();
        assert_eq!(back, svr);
        assert!(back.refreshed_at.is_none());
    }
}
