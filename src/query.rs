//! Game server status query.
//!
//! Servers answer a `\status\` datagram with a backslash-delimited list of
//! key/value pairs. Long replies are split over several datagrams:
//!
//! * each fragment carries `\queryid\<query>.<n>` with `n` counting from 1,
//! * the last fragment also carries a `\final\` marker,
//! * fragments may arrive in any order.
//!
//! The reply is complete once the final fragment and every fragment before it
//! have been received.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddrV4;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::net::UdpSocket;

use crate::error::QueryError;
use crate::server::{Details, GameInfo, Objective, Player};

pub const STATUS_REQUEST: &[u8] = b"\\status\\";

const MAX_DATAGRAM: usize = 2048;
const MAX_FRAGMENTS: usize = 16;

/// Parsed reply to a status request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    /// Join port the server reports for itself.
    pub host_port: u16,
    pub details: Details,
}

#[async_trait]
pub trait GameQuery: Send + Sync {
    async fn query(
        &self,
        target: SocketAddrV4,
        timeout: Duration,
    ) -> Result<StatusResponse, QueryError>;
}

/// Queries over a fresh ephemeral UDP socket per request.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpQuery;

#[async_trait]
impl GameQuery for UdpQuery {
    async fn query(
        &self,
        target: SocketAddrV4,
        timeout: Duration,
    ) -> Result<StatusResponse, QueryError> {
        tokio::time::timeout(timeout, query_status(target))
            .await
            .map_err(|_| QueryError::Timeout)?
    }
}

async fn query_status(target: SocketAddrV4) -> Result<StatusResponse, QueryError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(target).await?;
    socket.send(STATUS_REQUEST).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut reply = Reassembly::default();
    for _ in 0..MAX_FRAGMENTS {
        let len = socket.recv(&mut buf).await?;
        let fragment = parse_fragment(&buf[..len])?;
        debug!("Fragment {} ({} fields) from {}", fragment.id, fragment.fields.len(), target);
        reply.push(fragment);
        if reply.is_complete() {
            return parse_status(reply.into_fields());
        }
    }
    Err(QueryError::Malformed(format!(
        "reply from {} exceeds {} fragments",
        target, MAX_FRAGMENTS
    )))
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Fragment {
    id: u32,
    last: bool,
    fields: Vec<(String, String)>,
}

pub(crate) fn parse_fragment(data: &[u8]) -> Result<Fragment, QueryError> {
    let text = String::from_utf8_lossy(data);
    let Some(body) = text.strip_prefix('\\') else {
        return Err(QueryError::Malformed("missing leading backslash".into()));
    };

    let mut tokens = body.split('\\');
    let mut fragment = Fragment {
        id: 1,
        last: false,
        fields: Vec::new(),
    };
    while let Some(key) = tokens.next() {
        let value = tokens.next().unwrap_or_default();
        match key {
            "" => {}
            "final" => fragment.last = true,
            "queryid" => {
                let n = value.rsplit('.').next().unwrap_or(value);
                fragment.id = n
                    .parse()
                    .map_err(|_| QueryError::Malformed(format!("queryid {:?}", value)))?;
            }
            _ => fragment.fields.push((key.to_string(), value.to_string())),
        }
    }
    Ok(fragment)
}

#[derive(Debug, Default)]
pub(crate) struct Reassembly {
    fragments: BTreeMap<u32, Vec<(String, String)>>,
    last: Option<u32>,
}

impl Reassembly {
    pub(crate) fn push(&mut self, fragment: Fragment) {
        if fragment.last {
            self.last = Some(fragment.id);
        }
        self.fragments.insert(fragment.id, fragment.fields);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.last
            .is_some_and(|last| (1..=last).all(|id| self.fragments.contains_key(&id)))
    }

    pub(crate) fn into_fields(self) -> Vec<(String, String)> {
        self.fragments.into_values().flatten().collect()
    }
}

fn num<T: FromStr + Default>(value: &str) -> T {
    value.trim().parse().unwrap_or_default()
}

fn flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "True")
}

/// Builds the game state out of a reassembled reply.
pub(crate) fn parse_status(fields: Vec<(String, String)>) -> Result<StatusResponse, QueryError> {
    let mut info = GameInfo::default();
    let mut host_port = None;
    let mut num_players = None;
    let mut players: BTreeMap<usize, Player> = BTreeMap::new();
    let mut objectives: HashMap<String, Objective> = HashMap::new();
    let mut objective_order = Vec::new();

    for (key, value) in fields {
        match key.as_str() {
            "hostname" => info.hostname = value,
            "hostport" => {
                host_port = Some(
                    value
                        .parse::<u16>()
                        .map_err(|_| QueryError::Malformed(format!("hostport {:?}", value)))?,
                )
            }
            "password" => info.password_protected = flag(&value),
            "gametype" => info.game_type = value,
            "gamevariant" => info.game_variant = value,
            "gamever" => info.game_version = value,
            "mapname" => info.map_name = value,
            "numplayers" => num_players = Some(num(&value)),
            "maxplayers" => info.players_max = num(&value),
            "round" => info.round_number = num(&value),
            "numrounds" => info.round_limit = num(&value),
            "timeleft" => info.time_left = num(&value),
            "timelimit" => info.time_limit = num(&value),
            "swatscore" => info.swat_score = num(&value),
            "suspectsscore" => info.suspects_score = num(&value),
            _ => {
                if let Some(name) = key.strip_prefix("obj_") {
                    if !objectives.contains_key(name) {
                        objective_order.push(name.to_string());
                    }
                    objectives.insert(
                        name.to_string(),
                        Objective {
                            name: name.to_string(),
                            status: num(&value),
                        },
                    );
                    continue;
                }
                let Some((field, index)) = key.rsplit_once('_') else {
                    continue;
                };
                let Ok(index) = index.parse::<usize>() else {
                    continue;
                };
                let player = players.entry(index).or_default();
                match field {
                    "player" => player.name = value,
                    "score" => player.score = num(&value),
                    "ping" => player.ping = num(&value),
                    "team" => player.team = num(&value),
                    "kills" => player.kills = num(&value),
                    "deaths" => player.deaths = num(&value),
                    "vip" => player.vip = flag(&value),
                    _ => {}
                }
            }
        }
    }

    let Some(host_port) = host_port else {
        return Err(QueryError::Malformed("missing hostport".into()));
    };
    let players: Vec<Player> = players
        .into_values()
        .filter(|player| !player.name.is_empty())
        .collect();
    info.players_current = num_players.unwrap_or(players.len() as u32);
    let objectives = objective_order
        .into_iter()
        .filter_map(|name| objectives.remove(&name))
        .collect();

    Ok(StatusResponse {
        host_port,
        details: Details {
            info,
            players,
            objectives,
        },
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn fields(raw: &str) -> Vec<(String, String)> {
        parse_fragment(raw.as_bytes()).unwrap().fields
    }

    #[test]
    fn parses_summary_and_players() {
        let raw = "\\hostname\\Swat Server\\hostport\\10480\\password\\0\\gamevariant\\SWAT 4\
                   \\gamever\\1.1\\gametype\\VIP Escort\\mapname\\A-Bomb Nightclub\
                   \\numplayers\\2\\maxplayers\\16\\round\\2\\numrounds\\5\
                   \\swatscore\\10\\suspectsscore\\-5\
                   \\player_0\\Alpha\\score_0\\12\\ping_0\\45\\team_0\\0\\kills_0\\3\\vip_0\\1\
                   \\player_1\\Bravo\\score_1\\-2\\ping_1\\999\\team_1\\1\\deaths_1\\4\
                   \\obj_Neutralize_All_Enemies\\0\\obj_Rescue_All_Civilians\\2\
                   \\final\\\\queryid\\1.1";
        let fragment = parse_fragment(raw.as_bytes()).unwrap();
        assert!(fragment.last);
        assert_eq!(fragment.id, 1);

        let status = parse_status(fragment.fields).unwrap();
        assert_eq!(status.host_port, 10480);
        let info = &status.details.info;
        assert_eq!(info.hostname, "Swat Server");
        assert_eq!(info.game_type, "VIP Escort");
        assert_eq!(info.players_current, 2);
        assert_eq!(info.players_max, 16);
        assert_eq!(info.round_limit, 5);
        assert_eq!(info.suspects_score, -5);
        assert!(!info.password_protected);

        let players = &status.details.players;
        assert_eq!(players.len(), 2);
        assert_eq!(players[0].name, "Alpha");
        assert!(players[0].vip);
        assert_eq!(players[1].score, -2);
        assert_eq!(players[1].deaths, 4);

        let objectives = &status.details.objectives;
        assert_eq!(objectives.len(), 2);
        assert_eq!(objectives[0].name, "Neutralize_All_Enemies");
        assert_eq!(objectives[1].status, 2);
    }

    #[test]
    fn reassembles_out_of_order_fragments() {
        let mut reply = Reassembly::default();
        reply.push(parse_fragment(b"\\player_1\\Bravo\\final\\\\queryid\\7.2").unwrap());
        assert!(!reply.is_complete());
        reply.push(parse_fragment(b"\\hostport\\10480\\player_0\\Alpha\\queryid\\7.1").unwrap());
        assert!(reply.is_complete());

        let status = parse_status(reply.into_fields()).unwrap();
        let names: Vec<&str> = status.details.players.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["Alpha", "Bravo"]);
        assert_eq!(status.details.info.players_current, 2);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_fragment(b"hostname\\x").is_err());
        assert!(parse_fragment(b"\\queryid\\x.y").is_err());
        assert!(matches!(
            parse_status(fields("\\hostname\\x")),
            Err(QueryError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn queries_over_udp() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let std::net::SocketAddr::V4(target) = server.local_addr().unwrap() else {
            panic!("expected an ipv4 socket");
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], STATUS_REQUEST);
            server
                .send_to(b"\\hostname\\Local\\final\\\\queryid\\1.2", peer)
                .await
                .unwrap();
            server
                .send_to(b"\\hostport\\10480\\queryid\\1.1", peer)
                .await
                .unwrap();
        });

        let status = UdpQuery.query(target, Duration::from_secs(2)).await.unwrap();
        assert_eq!(status.host_port, 10480);
        assert_eq!(status.details.info.hostname, "Local");
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        let err = UdpQuery
            .query(target, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Timeout));
    }
}
