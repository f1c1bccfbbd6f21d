use crate::messages::*;
use crate::Result;
use async_trait::async_trait;

/// Requests a requester sends to a compute participant.
///
/// Implemented by [`crate::ComputeNode`] and by transport proxies, so the
/// requester never depends on a concrete compute type.
#[async_trait]
pub trait ComputeEndpoint: Send + Sync {
    async fn ask_for_bid(&self, request: AskForBidRequest) -> Result<AskForBidResponse>;

    async fn bid_accepted(&self, request: BidAcceptedRequest) -> Result<ExecutionAck>;

    async fn bid_rejected(&self, request: BidRejectedRequest) -> Result<ExecutionAck>;

    async fn result_accepted(&self, request: ResultAcceptedRequest) -> Result<ExecutionAck>;

    async fn result_rejected(&self, request: ResultRejectedRequest) -> Result<ExecutionAck>;

    async fn cancel_execution(
        &self,
        request: CancelExecutionRequest,
    ) -> Result<CancelExecutionResponse>;
}

/// Callbacks a compute participant sends back to the requester
#[async_trait]
pub trait RequesterEndpoint: Send + Sync {
    async fn on_run_complete(&self, callback: RunComplete) -> Result<CallbackAck>;

    async fn on_publish_complete(&self, callback: PublishComplete) -> Result<CallbackAck>;

    async fn on_cancel_complete(&self, callback: CancelComplete) -> Result<CallbackAck>;

    async fn on_compute_failure(&self, callback: ComputeFailure) -> Result<CallbackAck>;
}
