use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric node identifier assigned by the transport layer.
///
/// Ordering matters: the lowest connected id is the coordinator and the lower
/// origin wins version ties in the state merge.
pub type NodeId = u32;

/// Role a node plays in the mesh, as decided by coordinator election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "COORD")]
    Coordinator,
    #[default]
    #[serde(rename = "PEER")]
    Peer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Coordinator => "COORD",
            Role::Peer => "PEER",
        }
    }

    /// Parse a role string as reported in a heartbeat. Anything other than
    /// `"COORD"` is treated as a plain peer.
    pub fn parse_lossy(s: &str) -> Self {
        if s == "COORD" {
            Role::Coordinator
        } else {
            Role::Peer
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short display name for a node: `N` followed by the last four uppercase hex
/// digits of its id.
pub fn node_name(id: NodeId) -> String {
    let hex = format!("{id:X}");
    let tail = if hex.len() > 4 {
        &hex[hex.len() - 4..]
    } else {
        hex.as_str()
    };
    format!("N{tail}")
}
