use std::net::SocketAddrV4;
use std::time::Duration;

use async_trait::async_trait;

use super::{ProbeResult, Prober};
use crate::addr::Addr;
use crate::error::QueryError;
use crate::query::GameQuery;
use crate::server::Server;
use crate::status::DiscoveryStatus;

/// Pulls the full status from a server's known query port.
pub struct DetailsProber<Q> {
    query: Q,
}

impl<Q: GameQuery> DetailsProber<Q> {
    pub fn new(query: Q) -> Self {
        Self { query }
    }
}

#[async_trait]
impl<Q: GameQuery> Prober for DetailsProber<Q> {
    async fn probe(
        &self,
        addr: Addr,
        port: u16,
        timeout: Duration,
    ) -> Result<ProbeResult, QueryError> {
        let status = self
            .query
            .query(SocketAddrV4::new(addr.ip(), port), timeout)
            .await?;
        // the query port may have been reassigned to another server
        if status.host_port != addr.port() {
            return Err(QueryError::PortMismatch {
                expected: addr.port(),
                reported: status.host_port,
            });
        }
        Ok(ProbeResult::Details(status.details))
    }

    fn handle_success(
        &self,
        result: &ProbeResult,
        mut server: Server,
    ) -> Result<Server, QueryError> {
        let ProbeResult::Details(details) = result else {
            return Err(QueryError::WrongResult("details"));
        };
        server.update_details(details.clone());
        server.update_discovery_status(DiscoveryStatus::DETAILS | DiscoveryStatus::INFO);
        server.clear_discovery_status(DiscoveryStatus::DETAILS_RETRY | DiscoveryStatus::NO_DETAILS);
        Ok(server)
    }

    fn handle_retry(&self, mut server: Server) -> Server {
        server.update_discovery_status(DiscoveryStatus::DETAILS_RETRY);
        server
    }

    fn handle_failure(&self, mut server: Server) -> Server {
        server.clear_discovery_status(DiscoveryStatus::DETAILS | DiscoveryStatus::DETAILS_RETRY);
        server.update_discovery_status(DiscoveryStatus::NO_DETAILS);
        server
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::StatusResponse;
    use crate::server::{Details, GameInfo, Player};

    struct Fixed(u16);

    #[async_trait]
    impl GameQuery for Fixed {
        async fn query(&self, _: SocketAddrV4, _: Duration) -> Result<StatusResponse, QueryError> {
            Ok(StatusResponse {
                host_port: self.0,
                details: Details {
                    info: GameInfo {
                        map_name: "Food Wall Restaurant".into(),
                        ..Default::default()
                    },
                    players: vec![Player {
                        name: "Alpha".into(),
                        ..Default::default()
                    }],
                    objectives: Vec::new(),
                },
            })
        }
    }

    fn server() -> Server {
        let mut server = Server::new("1.1.1.1:10480".parse().unwrap(), 10481);
        server.update_discovery_status(DiscoveryStatus::PORT | DiscoveryStatus::DETAILS_RETRY);
        server
    }

    #[tokio::test]
    async fn success_stores_details() {
        let prober = DetailsProber::new(Fixed(10480));
        let svr = server();
        let result = prober
            .probe(svr.addr, svr.query_port, Duration::from_secs(1))
            .await
            .unwrap();
        let updated = prober.handle_success(&result, svr).unwrap();
        assert_eq!(updated.info.map_name, "Food Wall Restaurant");
        assert_eq!(updated.details.players.len(), 1);
        assert_eq!(
            updated.discovery_status,
            DiscoveryStatus::PORT | DiscoveryStatus::DETAILS | DiscoveryStatus::INFO
        );
    }

    #[tokio::test]
    async fn rejects_answers_for_another_server() {
        let prober = DetailsProber::new(Fixed(10580));
        let svr = server();
        let err = prober
            .probe(svr.addr, svr.query_port, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::PortMismatch { reported: 10580, .. }));
    }

    #[test]
    fn failure_is_terminal() {
        let prober = DetailsProber::new(Fixed(10480));
        let failed = prober.handle_failure(server());
        assert!(failed.has_discovery_status(DiscoveryStatus::NO_DETAILS));
        assert!(!failed.has_discovery_status(DiscoveryStatus::DETAILS_RETRY));
        assert!(failed.has_discovery_status(DiscoveryStatus::PORT));
    }
}
