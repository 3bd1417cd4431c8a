use std::net::SocketAddrV4;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{select_ok, BoxFuture};
use futures_util::FutureExt;
use log::debug;

use super::{ProbeResult, Prober};
use crate::addr::Addr;
use crate::error::QueryError;
use crate::query::GameQuery;
use crate::server::Server;
use crate::status::DiscoveryStatus;

pub const DEFAULT_OFFSETS: [u16; 4] = [1, 2, 3, 4];

/// Finds the query port of a server known by its join port. Every candidate
/// `join port + offset` is queried at once and the first one that answers for
/// the right join port wins.
pub struct PortProber<Q> {
    query: Q,
    offsets: Vec<u16>,
}

impl<Q: GameQuery> PortProber<Q> {
    pub fn new(query: Q) -> Self {
        Self::with_offsets(query, DEFAULT_OFFSETS.to_vec())
    }

    pub fn with_offsets(query: Q, offsets: Vec<u16>) -> Self {
        Self { query, offsets }
    }

    async fn try_port(
        &self,
        addr: Addr,
        join_port: u16,
        query_port: u16,
        timeout: Duration,
    ) -> Result<ProbeResult, QueryError> {
        let target = SocketAddrV4::new(addr.ip(), query_port);
        let status = self.query.query(target, timeout).await?;
        if status.host_port != join_port {
            return Err(QueryError::PortMismatch {
                expected: join_port,
                reported: status.host_port,
            });
        }
        Ok(ProbeResult::Port {
            query_port,
            info: status.details.info,
        })
    }
}

#[async_trait]
impl<Q: GameQuery> Prober for PortProber<Q> {
    async fn probe(
        &self,
        addr: Addr,
        port: u16,
        timeout: Duration,
    ) -> Result<ProbeResult, QueryError> {
        let attempts: Vec<BoxFuture<'_, Result<ProbeResult, QueryError>>> = self
            .offsets
            .iter()
            .filter_map(|offset| port.checked_add(*offset))
            .map(|candidate| self.try_port(addr, port, candidate, timeout).boxed())
            .collect();
        if attempts.is_empty() {
            return Err(QueryError::NoCandidates);
        }
        let (result, _) = select_ok(attempts).await?;
        debug!("Discovered {:?} for {}", result, addr);
        Ok(result)
    }

    fn handle_success(
        &self,
        result: &ProbeResult,
        mut server: Server,
    ) -> Result<Server, QueryError> {
        let ProbeResult::Port { query_port, info } = result else {
            return Err(QueryError::WrongResult("port"));
        };
        server.query_port = *query_port;
        server.update_info(info.clone());
        server.update_discovery_status(DiscoveryStatus::PORT | DiscoveryStatus::INFO);
        server.clear_discovery_status(DiscoveryStatus::PORT_RETRY | DiscoveryStatus::NO_PORT);
        Ok(server)
    }

    fn handle_retry(&self, mut server: Server) -> Server {
        server.update_discovery_status(DiscoveryStatus::PORT_RETRY);
        server
    }

    fn handle_failure(&self, mut server: Server) -> Server {
        server.clear_discovery_status(DiscoveryStatus::PORT | DiscoveryStatus::PORT_RETRY);
        server.update_discovery_status(DiscoveryStatus::NO_PORT);
        server
    }
}
