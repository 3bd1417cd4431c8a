//! Reporter instance bindings.

use serde::{Deserialize, Serialize};

use crate::addr::{Addr, InstanceId};

/// Binds the token a game server reported with to the address it reported from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub addr: Addr,
}

impl Instance {
    pub fn new(id: InstanceId, addr: Addr) -> Self {
        Self { id, addr }
    }

    /// A keepalive or removal claiming `id` from `addr` is genuine only if both match.
    pub fn matches(&self, id: &InstanceId, addr: &Addr) -> bool {
        &self.id == id && &self.addr == addr
    }
}
