//! Transport protocols subject to rules and routes.

use serde::{Deserialize, Serialize};

/// Transport protocol of a rule, route, or port allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp = 1,
    Udp = 2,
}

impl Protocol {
    /// Stable byte value used in hashed and sorted table keys.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}
