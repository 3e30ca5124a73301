use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::descriptor::NodeDescriptor;

/// Process-wide unique identity of a broker or client.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identity of a published message, assigned at first publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token correlating every message of one reconfiguration episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReconfigurationId(Uuid);

impl ReconfigurationId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ReconfigurationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecId: {}", self.0)
    }
}

/// Who replaces a dead link, as known by the topology layer.
///
/// The new link joins `same_subtree_broker` (on the side of the failure
/// that stays reachable through the detecting node) and
/// `other_subtree_broker` (on the side that got cut off).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSubstitution {
    pub same_subtree_broker: NodeDescriptor,
    pub other_subtree_broker: NodeDescriptor,
    pub id: ReconfigurationId,
}

/// Reconfiguration data attached to a neighbor-dead event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconfigurationInfo {
    /// A replacement link is expected and will announce itself with a FLUSH.
    Flush(ReconfigurationId),
    /// The endpoints of the replacement link are known.
    Substitution(LinkSubstitution),
}

impl ReconfigurationInfo {
    pub fn id(&self) -> ReconfigurationId {
        match self {
            ReconfigurationInfo::Flush(id) => *id,
            ReconfigurationInfo::Substitution(s) => s.id,
        }
    }

    pub fn substitution(&self) -> Option<&LinkSubstitution> {
        match self {
            ReconfigurationInfo::Substitution(s) => Some(s),
            ReconfigurationInfo::Flush(_) => None,
        }
    }
}

/// Current time in milliseconds since UNIX epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_parse_roundtrip() {
        let id = NodeId::random();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<NodeId>().is_err());
    }

    #[test]
    fn reconfiguration_info_exposes_id() {
        let id = ReconfigurationId::random();
        let info = ReconfigurationInfo::Flush(id);
        assert_eq!(info.id(), id);
        assert!(info.substitution().is_none());

        let sub = ReconfigurationInfo::Substitution(LinkSubstitution {
            same_subtree_broker: NodeDescriptor::broker(),
            other_subtree_broker: NodeDescriptor::broker(),
            id,
        });
        assert_eq!(sub.id(), id);
        assert!(sub.substitution().is_some());
    }

    #[test]
    fn reconfiguration_id_display() {
        let id = ReconfigurationId::random();
        assert!(id.to_string().starts_with("RecId: "));
    }
}
