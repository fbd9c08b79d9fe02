//! Virtual node identifiers
//!
//! A virtual node is one of the `replicas` ring positions of a real node.
//! Internally it is a structured `(node, replica)` pair; the `node_replica`
//! string is only used as the hash input and as the wire form of
//! string-keyed backends.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RingError;

/// Virtual node identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VirtualNodeId {
    /// Owning real node
    pub node: String,
    /// Replica index, 1-based
    pub replica: u32,
}

impl VirtualNodeId {
    pub fn new(node: impl Into<String>, replica: u32) -> Self {
        Self {
            node: node.into(),
            replica,
        }
    }

    /// Owning real node name
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Reject ids that no real node could have generated (tampered or
    /// corrupted ring state)
    pub fn validated(self) -> Result<Self, RingError> {
        if self.node.is_empty() || self.replica == 0 {
            return Err(RingError::InvalidVirtualNodeId(self.to_string()));
        }
        Ok(self)
    }

    /// All virtual node ids of a real node, in ascending replica order
    pub fn all_of(node: &str, replicas: u32) -> impl Iterator<Item = VirtualNodeId> + '_ {
        (1..=replicas).map(move |replica| VirtualNodeId::new(node, replica))
    }
}

impl fmt::Display for VirtualNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.node, self.replica)
    }
}

/// Parses `name_index`, splitting at the last `_`.
impl FromStr for VirtualNodeId {
    type Err = RingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RingError::InvalidVirtualNodeId(s.to_string());

        let (node, index) = s.rsplit_once('_').ok_or_else(invalid)?;
        if node.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let replica: u32 = index.parse().map_err(|_| invalid())?;
        if replica == 0 {
            return Err(invalid());
        }

        Ok(Self::new(node, replica))
    }
}
