use crate::endpoint::ComputeEndpoint;
use crate::messages::{ExecutionAck, ResultAcceptedRequest, ResultRejectedRequest};
use crate::{ProtocolError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use verum_types::{ExecutionId, NodeId, RoutingMetadata};

/// An execution to notify of its verification outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
}

/// Tells winning executions to publish and losing ones to stand down
pub struct PublishCoordinator {
    requester_id: NodeId,
    compute: Arc<dyn ComputeEndpoint>,
    request_timeout: Duration,
}

impl PublishCoordinator {
    pub fn new(
        requester_id: NodeId,
        compute: Arc<dyn ComputeEndpoint>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            requester_id,
            compute,
            request_timeout,
        }
    }

    /// Send `ResultAccepted` to every winner and `ResultRejected` to every
    /// loser concurrently. Returns the winners that could not be told.
    pub async fn dispatch(
        &self,
        accepted: &[PublishTarget],
        rejected: &[PublishTarget],
        justification: &str,
    ) -> Vec<(ExecutionId, ProtocolError)> {
        let mut tasks: JoinSet<(ExecutionId, bool, Result<ExecutionAck>)> = JoinSet::new();

        for target in accepted {
            let request = ResultAcceptedRequest {
                routing: self.routing(target),
                execution_id: target.execution_id.clone(),
            };
            let compute = self.compute.clone();
            let timeout = self.request_timeout;
            let id = target.execution_id.clone();
            tasks.spawn(async move {
                let result = with_timeout(timeout, "result accepted", compute.result_accepted(request)).await;
                (id, true, result)
            });
        }

        for target in rejected {
            let request = ResultRejectedRequest {
                routing: self.routing(target),
                execution_id: target.execution_id.clone(),
                justification: justification.to_string(),
            };
            let compute = self.compute.clone();
            let timeout = self.request_timeout;
            let id = target.execution_id.clone();
            tasks.spawn(async move {
                let result = with_timeout(timeout, "result rejected", compute.result_rejected(request)).await;
                (id, false, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, _, Ok(ack))) => {
                    debug!(
                        execution_id = %id,
                        state = %ack.state,
                        applied = ack.applied,
                        "Verification outcome delivered"
                    );
                }
                Ok((id, winner, Err(e))) => {
                    warn!(execution_id = %id, winner, error = %e, "Verification outcome not delivered");
                    if winner {
                        failures.push((id, e));
                    }
                }
                Err(e) => warn!(error = %e, "Publish dispatch task failed"),
            }
        }
        failures
    }

    fn routing(&self, target: &PublishTarget) -> RoutingMetadata {
        RoutingMetadata::new(self.requester_id.clone(), target.node_id.clone())
    }
}

pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    operation: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::timeout(operation, timeout)),
    }
}
