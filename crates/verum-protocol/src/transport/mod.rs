//! Carriers for protocol messages.
//!
//! Both transports implement [`ComputeEndpoint`] and [`RequesterEndpoint`]
//! by routing on the message's target peer, so requester and compute nodes
//! only ever see the abstract endpoints. Registered endpoints are held
//! weakly; the caller owns the nodes.

pub mod in_process;
pub mod relay;

pub use in_process::InProcessNetwork;
pub use relay::{ProtocolMessage, ProtocolReply, RelayNetwork};

use crate::endpoint::{ComputeEndpoint, RequesterEndpoint};
use async_trait::async_trait;
use std::sync::Arc;
use verum_types::NodeId;

/// A transport participants can join
#[async_trait]
pub trait Network: ComputeEndpoint + RequesterEndpoint {
    async fn register_compute(&self, id: NodeId, endpoint: Arc<dyn ComputeEndpoint>);

    async fn register_requester(&self, id: NodeId, endpoint: Arc<dyn RequesterEndpoint>);

    /// Remove a peer; later messages addressed to it fail as unreachable
    async fn unregister(&self, id: &NodeId);
}
