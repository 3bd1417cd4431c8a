//! Single-process backend.
//!
//! Each repository guards its state with one `RwLock`; reads share it, writes
//! (including the conflict callback) run under the exclusive side, which is
//! all the cross-writer exclusion a single process needs.

use std::sync::Arc;

use crate::clock::SharedClock;

use super::Repositories;

mod instances;
mod probes;
mod servers;

pub use instances::InstanceMemoryRepo;
pub use probes::ProbeMemoryRepo;
pub use servers::ServerMemoryRepo;

pub fn repositories(clock: SharedClock) -> Repositories {
    Repositories {
        servers: Arc::new(ServerMemoryRepo::new(clock.clone())),
        probes: Arc::new(ProbeMemoryRepo::new(clock.clone())),
        instances: Arc::new(InstanceMemoryRepo::new(clock)),
    }
}
