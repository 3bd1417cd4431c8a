//! Goal-specific probe strategies and the runner that drives them.
//!
//! A [`Prober`] does the network work for one [`Goal`] and knows how a
//! success, a retry or a final failure changes a [`Server`]. Those transitions
//! are pure so the runner can replay them on a fresher copy when its write
//! loses a version race.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::addr::Addr;
use crate::error::QueryError;
use crate::probe::Goal;
use crate::server::{Details, GameInfo, Server};

pub mod details;
pub mod port;
pub mod runner;

pub use details::DetailsProber;
pub use port::PortProber;
pub use runner::{GoalStats, Runner, RunnerConfig, RunnerStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// The port the server answered status queries on, and its summary.
    Port { query_port: u16, info: GameInfo },
    Details(Details),
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(
        &self,
        addr: Addr,
        port: u16,
        timeout: Duration,
    ) -> Result<ProbeResult, QueryError>;

    /// Fails with [`QueryError::WrongResult`] when handed another goal's result.
    fn handle_success(&self, result: &ProbeResult, server: Server) -> Result<Server, QueryError>;

    fn handle_retry(&self, server: Server) -> Server;

    fn handle_failure(&self, server: Server) -> Server;
}

/// One prober per goal.
#[derive(Clone)]
pub struct Probers {
    port: Arc<dyn Prober>,
    details: Arc<dyn Prober>,
}

impl Probers {
    pub fn new(port: Arc<dyn Prober>, details: Arc<dyn Prober>) -> Self {
        Self { port, details }
    }

    pub fn get(&self, goal: Goal) -> &Arc<dyn Prober> {
        match goal {
            Goal::Port => &self.port,
            Goal::Details => &self.details,
        }
    }
}
