//! Protocol messages exchanged between a requester and compute participants.
//!
//! Every message carries a [`RoutingMetadata`] envelope; every message after
//! the bid solicitation also carries the [`ExecutionId`] it concerns.

use serde::{Deserialize, Serialize};
use verum_types::{
    ExecutionId, ExecutionState, Job, PublishedResult, ResultDigest, RoutingMetadata,
};

// ---- requests (requester -> compute) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskForBidRequest {
    pub routing: RoutingMetadata,
    pub job: Job,
    pub shard_indices: Vec<u32>,
}

/// Bid for one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidResponse {
    pub shard_index: u32,
    /// Allocated only when the bid is accepted
    pub execution_id: Option<ExecutionId>,
    pub accepted: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskForBidResponse {
    pub routing: RoutingMetadata,
    pub bids: Vec<BidResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidAcceptedRequest {
    pub routing: RoutingMetadata,
    pub execution_id: ExecutionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidRejectedRequest {
    pub routing: RoutingMetadata,
    pub execution_id: ExecutionId,
    pub justification: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultAcceptedRequest {
    pub routing: RoutingMetadata,
    pub execution_id: ExecutionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRejectedRequest {
    pub routing: RoutingMetadata,
    pub execution_id: ExecutionId,
    pub justification: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelExecutionRequest {
    pub routing: RoutingMetadata,
    pub execution_id: ExecutionId,
    pub justification: String,
}

/// Reply to a state-driving request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAck {
    pub routing: RoutingMetadata,
    pub execution_id: ExecutionId,
    /// State after handling the request
    pub state: ExecutionState,
    /// False when the request was a duplicate or out of order
    pub applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelResult {
    Canceled { previous: ExecutionState },
    AlreadyTerminal { state: ExecutionState },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelExecutionResponse {
    pub routing: RoutingMetadata,
    pub execution_id: ExecutionId,
    pub result: CancelResult,
}

// ---- callbacks (compute -> requester) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunComplete {
    pub routing: RoutingMetadata,
    pub execution_id: ExecutionId,
    pub proposal: ResultDigest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishComplete {
    pub routing: RoutingMetadata,
    pub execution_id: ExecutionId,
    pub published: PublishedResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelComplete {
    pub routing: RoutingMetadata,
    pub execution_id: ExecutionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeFailure {
    pub routing: RoutingMetadata,
    pub execution_id: ExecutionId,
    pub error: String,
}

/// How the requester handled a callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackAck {
    Applied { state: ExecutionState },
    /// Redelivery of an already applied callback, or the execution is terminal
    Duplicate { state: ExecutionState },
    /// Out of order for the execution's current state; discarded
    Ignored { reason: String },
}

impl CallbackAck {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}
