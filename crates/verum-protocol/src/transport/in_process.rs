use super::Network;
use crate::endpoint::{ComputeEndpoint, RequesterEndpoint};
use crate::messages::*;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use verum_types::NodeId;

/// Direct calls between endpoints living in the same process
#[derive(Default)]
pub struct InProcessNetwork {
    computes: RwLock<HashMap<NodeId, Weak<dyn ComputeEndpoint>>>,
    requesters: RwLock<HashMap<NodeId, Weak<dyn RequesterEndpoint>>>,
}

impl InProcessNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn compute(&self, target: &NodeId) -> Result<Arc<dyn ComputeEndpoint>> {
        self.computes
            .read()
            .await
            .get(target)
            .and_then(Weak::upgrade)
            .ok_or_else(|| ProtocolError::PeerUnreachable(target.to_string()))
    }

    async fn requester(&self, target: &NodeId) -> Result<Arc<dyn RequesterEndpoint>> {
        self.requesters
            .read()
            .await
            .get(target)
            .and_then(Weak::upgrade)
            .ok_or_else(|| ProtocolError::PeerUnreachable(target.to_string()))
    }
}

#[async_trait]
impl Network for InProcessNetwork {
    async fn register_compute(&self, id: NodeId, endpoint: Arc<dyn ComputeEndpoint>) {
        self.computes
            .write()
            .await
            .insert(id, Arc::downgrade(&endpoint));
    }

    async fn register_requester(&self, id: NodeId, endpoint: Arc<dyn RequesterEndpoint>) {
        self.requesters
            .write()
            .await
            .insert(id, Arc::downgrade(&endpoint));
    }

    async fn unregister(&self, id: &NodeId) {
        self.computes.write().await.remove(id);
        self.requesters.write().await.remove(id);
    }
}

#[async_trait]
impl ComputeEndpoint for InProcessNetwork {
    async fn ask_for_bid(&self, request: AskForBidRequest) -> Result<AskForBidResponse> {
        self.compute(&request.routing.target_peer_id)
            .await?
            .ask_for_bid(request)
            .await
    }

    async fn bid_accepted(&self, request: BidAcceptedRequest) -> Result<ExecutionAck> {
        self.compute(&request.routing.target_peer_id)
            .await?
            .bid_accepted(request)
            .await
    }

    async fn bid_rejected(&self, request: BidRejectedRequest) -> Result<ExecutionAck> {
        self.compute(&request.routing.target_peer_id)
            .await?
            .bid_rejected(request)
            .await
    }

    async fn result_accepted(&self, request: ResultAcceptedRequest) -> Result<ExecutionAck> {
        self.compute(&request.routing.target_peer_id)
            .await?
            .result_accepted(request)
            .await
    }

    async fn result_rejected(&self, request: ResultRejectedRequest) -> Result<ExecutionAck> {
        self.compute(&request.routing.target_peer_id)
            .await?
            .result_rejected(request)
            .await
    }

    async fn cancel_execution(
        &self,
        request: CancelExecutionRequest,
    ) -> Result<CancelExecutionResponse> {
        self.compute(&request.routing.target_peer_id)
            .await?
            .cancel_execution(request)
            .await
    }
}

#[async_trait]
impl RequesterEndpoint for InProcessNetwork {
    async fn on_run_complete(&self, callback: RunComplete) -> Result<CallbackAck> {
        self.requester(&callback.routing.target_peer_id)
            .await?
            .on_run_complete(callback)
            .await
    }

    async fn on_publish_complete(&self, callback: PublishComplete) -> Result<CallbackAck> {
        self.requester(&callback.routing.target_peer_id)
            .await?
            .on_publish_complete(callback)
            .await
    }

    async fn on_cancel_complete(&self, callback: CancelComplete) -> Result<CallbackAck> {
        self.requester(&callback.routing.target_peer_id)
            .await?
            .on_cancel_complete(callback)
            .await
    }

    async fn on_compute_failure(&self, callback: ComputeFailure) -> Result<CallbackAck> {
        self.requester(&callback.routing.target_peer_id)
            .await?
            .on_compute_failure(callback)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verum_types::{ExecutionId, RoutingMetadata};

    #[tokio::test]
    async fn test_unknown_peer_is_unreachable() {
        let network = InProcessNetwork::new();
        let request = CancelExecutionRequest {
            routing: RoutingMetadata::new(
                NodeId::new("requester").unwrap(),
                NodeId::new("nobody").unwrap(),
            ),
            execution_id: ExecutionId::generate(),
            justification: "test".into(),
        };
        assert!(matches!(
            network.cancel_execution(request).await,
            Err(ProtocolError::PeerUnreachable(_))
        ));
    }
}
