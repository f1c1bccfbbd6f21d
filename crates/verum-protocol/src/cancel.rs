use crate::endpoint::ComputeEndpoint;
use crate::messages::{CancelExecutionRequest, CancelResult};
use crate::publish::with_timeout;
use crate::registry::{ExecutionRegistry, TransitionOutcome, UpdateRequest};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use verum_types::{ExecutionId, ExecutionState, NodeId, RoutingMetadata};

/// Requester-side cancellation.
///
/// The local registry is updated first and unconditionally; the compute
/// participant is then told, waiting at most the grace period for its
/// acknowledgement.
#[derive(Clone)]
pub struct CancellationHandler {
    requester_id: NodeId,
    compute: Arc<dyn ComputeEndpoint>,
    registry: Arc<ExecutionRegistry>,
    grace: Duration,
}

impl CancellationHandler {
    pub fn new(
        requester_id: NodeId,
        compute: Arc<dyn ComputeEndpoint>,
        registry: Arc<ExecutionRegistry>,
        grace: Duration,
    ) -> Self {
        Self {
            requester_id,
            compute,
            registry,
            grace,
        }
    }

    pub async fn cancel(&self, execution_id: &ExecutionId, reason: &str) -> Result<CancelResult> {
        let execution = self.registry.get(execution_id).await?;
        let failure = reason.to_string();
        let outcome = self
            .registry
            .update_state_with(
                UpdateRequest::new(execution_id.clone(), ExecutionState::Canceled, reason),
                |e| e.failure_reason = Some(failure),
            )
            .await?;

        let previous = match outcome {
            TransitionOutcome::Applied { from, .. } => from,
            other => {
                debug!(
                    execution_id = %execution_id,
                    state = %other.state(),
                    "Cancel requested for terminal execution"
                );
                return Ok(CancelResult::AlreadyTerminal {
                    state: other.state(),
                });
            }
        };

        info!(
            execution_id = %execution_id,
            job_id = %execution.job_id,
            shard = execution.shard_index,
            previous = %previous,
            reason,
            "🛑 Execution canceled"
        );

        // Created executions were never known to the participant.
        if previous != ExecutionState::Created {
            self.notify(execution_id, &execution.node_id, reason).await;
        }

        Ok(CancelResult::Canceled { previous })
    }

    /// Cancel several executions concurrently; failures are logged
    pub async fn cancel_all(&self, execution_ids: Vec<ExecutionId>, reason: &str) {
        let mut tasks = JoinSet::new();
        for id in execution_ids {
            let handler = self.clone();
            let reason = reason.to_string();
            tasks.spawn(async move {
                let result = handler.cancel(&id, &reason).await;
                (id, result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Err(e))) => warn!(execution_id = %id, error = %e, "Cancellation failed"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Cancellation task failed"),
            }
        }
    }

    async fn notify(&self, execution_id: &ExecutionId, node_id: &NodeId, reason: &str) {
        let request = CancelExecutionRequest {
            routing: RoutingMetadata::new(self.requester_id.clone(), node_id.clone()),
            execution_id: execution_id.clone(),
            justification: reason.to_string(),
        };

        match with_timeout(self.grace, "cancel execution", self.compute.cancel_execution(request)).await
        {
            Ok(response) => debug!(
                execution_id = %execution_id,
                node_id = %node_id,
                result = ?response.result,
                "Cancellation acknowledged"
            ),
            Err(e) => warn!(
                execution_id = %execution_id,
                node_id = %node_id,
                error = %e,
                "⚠️ Cancellation not acknowledged within grace period"
            ),
        }
    }
}
