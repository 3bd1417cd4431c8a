//! Discovery core of a game master server.
//!
//! Game servers are tracked as [`Server`](server::Server) records in a
//! [`ServerRepository`](repository::ServerRepository). Discovery work is queued
//! as [`Probe`](probe::Probe)s and carried out by the
//! [`Runner`](prober::Runner), which writes what it learns back through the
//! repository's conflict-aware update path.
//!
//! Two storage backends share one set of contracts:
//!
//! * [`repository::memory`] keeps everything in the local process,
//! * [`repository::shared`] keeps everything in etcd so several instances can
//!   serve the same server list, serialising writes with a lease-backed lock.

pub mod addr;
pub mod cleaner;
pub mod clock;
pub mod config;
pub mod error;
pub mod filterset;
pub mod instance;
pub mod probe;
pub mod prober;
pub mod query;
pub mod repository;
pub mod server;
pub mod status;
