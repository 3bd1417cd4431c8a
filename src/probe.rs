//! Probe queue items.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::addr::Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    /// Find the query port of a server reported on its join port.
    Port,
    /// Fetch map, players and objectives from a known query port.
    Details,
}

impl Goal {
    pub const ALL: [Goal; 2] = [Goal::Port, Goal::Details];

    pub fn as_str(&self) -> &'static str {
        match self {
            Goal::Port => "port",
            Goal::Details => "details",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Goal::Port => 0,
            Goal::Details => 1,
        }
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled attempt to discover one goal against one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub addr: Addr,
    pub port: u16,
    pub goal: Goal,
    pub retries: u32,
    pub max_retries: u32,
}

impl Probe {
    pub fn new(addr: Addr, port: u16, goal: Goal, max_retries: u32) -> Self {
        Self {
            addr,
            port,
            goal,
            retries: 0,
            max_retries,
        }
    }

    /// Records a failed attempt. Returns the new retry count while it is still
    /// under the ceiling, `None` once retries are exhausted.
    pub fn inc_retries(&mut self) -> Option<u32> {
        self.retries += 1;
        (self.retries < self.max_retries).then_some(self.retries)
    }
}
