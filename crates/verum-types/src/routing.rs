use crate::NodeId;
use serde::{Deserialize, Serialize};

/// Envelope carried on every protocol message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingMetadata {
    pub source_peer_id: NodeId,
    pub target_peer_id: NodeId,
}

impl RoutingMetadata {
    pub fn new(source_peer_id: NodeId, target_peer_id: NodeId) -> Self {
        Self {
            source_peer_id,
            target_peer_id,
        }
    }

    /// Envelope for the reply to this message
    pub fn reply(&self) -> Self {
        Self {
            source_peer_id: self.target_peer_id.clone(),
            target_peer_id: self.source_peer_id.clone(),
        }
    }

    /// True when the message was sent by `source` and addressed to `target`
    pub fn matches(&self, source: &NodeId, target: &NodeId) -> bool {
        &self.source_peer_id == source && &self.target_peer_id == target
    }
}
