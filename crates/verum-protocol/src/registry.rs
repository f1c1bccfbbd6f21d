use crate::{ProtocolError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use verum_types::{
    Execution, ExecutionId, ExecutionState, JobId, LifecycleState, StateTransitionRecord,
};

/// Conditional state change for one execution
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub execution_id: ExecutionId,
    /// Current state must be one of these; empty accepts any state
    pub expected_states: Vec<ExecutionState>,
    pub new_state: ExecutionState,
    pub comment: String,
}

impl UpdateRequest {
    pub fn new(
        execution_id: ExecutionId,
        new_state: ExecutionState,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            expected_states: Vec::new(),
            new_state,
            comment: comment.into(),
        }
    }

    pub fn expecting(mut self, states: &[ExecutionState]) -> Self {
        self.expected_states = states.to_vec();
        self
    }
}

/// Result of an [`UpdateRequest`]. Only `Applied` mutates the execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied {
        from: ExecutionState,
        to: ExecutionState,
    },
    AlreadyTerminal {
        state: ExecutionState,
    },
    Illegal {
        current: ExecutionState,
        attempted: ExecutionState,
    },
    UnexpectedState {
        current: ExecutionState,
        expected: Vec<ExecutionState>,
    },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// State of the execution after the update attempt
    pub fn state(&self) -> ExecutionState {
        match self {
            Self::Applied { to, .. } => *to,
            Self::AlreadyTerminal { state } => *state,
            Self::Illegal { current, .. } => *current,
            Self::UnexpectedState { current, .. } => *current,
        }
    }
}

/// Keyed execution store.
///
/// Each execution sits behind its own mutex; the map lock is held only to
/// look up or insert entries, so updates to unrelated executions never
/// serialize on each other.
#[derive(Default)]
pub struct ExecutionRegistry {
    executions: RwLock<HashMap<ExecutionId, Arc<Mutex<Execution>>>>,
    by_job: RwLock<HashMap<JobId, Vec<ExecutionId>>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, execution: Execution) -> Result<()> {
        let id = execution.id.clone();
        let job_id = execution.job_id.clone();
        {
            let mut executions = self.executions.write().await;
            if executions.contains_key(&id) {
                return Err(ProtocolError::ExecutionExists(id.to_string()));
            }
            executions.insert(id.clone(), Arc::new(Mutex::new(execution)));
        }
        self.by_job.write().await.entry(job_id).or_default().push(id);
        Ok(())
    }

    async fn entry(&self, id: &ExecutionId) -> Result<Arc<Mutex<Execution>>> {
        self.executions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ProtocolError::ExecutionNotFound(id.to_string()))
    }

    pub async fn contains(&self, id: &ExecutionId) -> bool {
        self.executions.read().await.contains_key(id)
    }

    /// Snapshot of one execution
    pub async fn get(&self, id: &ExecutionId) -> Result<Execution> {
        let entry = self.entry(id).await?;
        let execution = entry.lock().await;
        Ok(execution.clone())
    }

    pub async fn state(&self, id: &ExecutionId) -> Result<ExecutionState> {
        let entry = self.entry(id).await?;
        let execution = entry.lock().await;
        Ok(execution.state)
    }

    pub async fn update_state(&self, request: UpdateRequest) -> Result<TransitionOutcome> {
        self.update_state_with(request, |_| {}).await
    }

    /// Apply `request` and, only when it is applied, run `apply` on the
    /// execution under the same lock.
    pub async fn update_state_with<F>(
        &self,
        request: UpdateRequest,
        apply: F,
    ) -> Result<TransitionOutcome>
    where
        F: FnOnce(&mut Execution),
    {
        let entry = self.entry(&request.execution_id).await?;
        let mut execution = entry.lock().await;
        let current = execution.state;

        if current.is_terminal() {
            debug!(
                execution_id = %request.execution_id,
                state = %current,
                attempted = %request.new_state,
                "Execution already terminal, update skipped"
            );
            return Ok(TransitionOutcome::AlreadyTerminal { state: current });
        }

        if !request.expected_states.is_empty() && !request.expected_states.contains(&current) {
            warn!(
                execution_id = %request.execution_id,
                current = %current,
                expected = ?request.expected_states,
                attempted = %request.new_state,
                "⚠️ Execution not in expected state"
            );
            return Ok(TransitionOutcome::UnexpectedState {
                current,
                expected: request.expected_states,
            });
        }

        if !execution.transition(request.new_state, request.comment) {
            warn!(
                execution_id = %request.execution_id,
                from = %current,
                to = %request.new_state,
                "⚠️ Illegal transition discarded"
            );
            return Ok(TransitionOutcome::Illegal {
                current,
                attempted: request.new_state,
            });
        }

        apply(&mut execution);

        debug!(
            execution_id = %request.execution_id,
            job_id = %execution.job_id,
            shard = execution.shard_index,
            from = %current,
            to = %request.new_state,
            "Execution transitioned"
        );

        Ok(TransitionOutcome::Applied {
            from: current,
            to: request.new_state,
        })
    }

    /// Executions of a job in creation order
    pub async fn job_executions(&self, job_id: &JobId) -> Vec<Execution> {
        let ids = match self.by_job.read().await.get(job_id) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(execution) = self.get(&id).await {
                out.push(execution);
            }
        }
        out
    }

    pub async fn shard_executions(&self, job_id: &JobId, shard_index: u32) -> Vec<Execution> {
        self.job_executions(job_id)
            .await
            .into_iter()
            .filter(|e| e.shard_index == shard_index)
            .collect()
    }

    pub async fn history(&self, id: &ExecutionId) -> Result<Vec<StateTransitionRecord>> {
        let entry = self.entry(id).await?;
        let execution = entry.lock().await;
        Ok(execution.history.clone())
    }

    /// Drop every execution of a job. Returns how many were removed.
    pub async fn remove_job(&self, job_id: &JobId) -> usize {
        let ids = self.by_job.write().await.remove(job_id).unwrap_or_default();
        let mut executions = self.executions.write().await;
        ids.iter().filter(|id| executions.remove(*id).is_some()).count()
    }

    /// Drop the given executions. Returns how many were removed.
    pub async fn remove(&self, ids: &[ExecutionId]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut removed = Vec::new();
        {
            let mut executions = self.executions.write().await;
            for id in ids {
                if let Some(entry) = executions.remove(id) {
                    removed.push((id.clone(), entry.lock().await.job_id.clone()));
                }
            }
        }
        let mut by_job = self.by_job.write().await;
        for (id, job_id) in &removed {
            if let Some(list) = by_job.get_mut(job_id) {
                list.retain(|e| e != id);
                if list.is_empty() {
                    by_job.remove(job_id);
                }
            }
        }
        removed.len()
    }

    /// Snapshot of every execution
    pub async fn all(&self) -> Vec<Execution> {
        let entries: Vec<_> = self.executions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.lock().await.clone());
        }
        out
    }

    /// Executions not yet in a terminal state
    pub async fn count_active(&self) -> usize {
        let entries: Vec<_> = self.executions.read().await.values().cloned().collect();
        let mut active = 0;
        for entry in entries {
            if !entry.lock().await.is_terminal() {
                active += 1;
            }
        }
        active
    }

    pub async fn len(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verum_types::{NodeId, ResultDigest};

    fn execution(job_id: &JobId, shard_index: u32) -> Execution {
        Execution::new(
            ExecutionId::generate(),
            job_id.clone(),
            shard_index,
            NodeId::new("compute-1").unwrap(),
            NodeId::new("requester").unwrap(),
        )
    }

    async fn registry_with(execution: &Execution) -> ExecutionRegistry {
        let registry = ExecutionRegistry::new();
        registry.create(execution.clone()).await.unwrap();
        registry
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let exec = execution(&JobId::generate(), 0);
        let registry = registry_with(&exec).await;
        assert!(matches!(
            registry.create(exec).await,
            Err(ProtocolError::ExecutionExists(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let registry = ExecutionRegistry::new();
        let result = registry
            .update_state(UpdateRequest::new(
                ExecutionId::generate(),
                ExecutionState::Bidding,
                "",
            ))
            .await;
        assert!(matches!(result, Err(ProtocolError::ExecutionNotFound(_))));
    }

    #[tokio::test]
    async fn test_illegal_transition_does_not_mutate() {
        let exec = execution(&JobId::generate(), 0);
        let registry = registry_with(&exec).await;
        registry
            .update_state(UpdateRequest::new(exec.id.clone(), ExecutionState::Bidding, "ask"))
            .await
            .unwrap();

        let outcome = registry
            .update_state_with(
                UpdateRequest::new(exec.id.clone(), ExecutionState::ResultProposed, "early"),
                |e| e.result_proposal = Some(ResultDigest::of(b"x")),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TransitionOutcome::Illegal {
                current: ExecutionState::Bidding,
                attempted: ExecutionState::ResultProposed,
            }
        );
        let stored = registry.get(&exec.id).await.unwrap();
        assert_eq!(stored.state, ExecutionState::Bidding);
        assert!(stored.result_proposal.is_none());
        assert_eq!(stored.history.len(), 2);
    }

    #[tokio::test]
    async fn test_expected_states_guard() {
        let exec = execution(&JobId::generate(), 0);
        let registry = registry_with(&exec).await;

        let outcome = registry
            .update_state(
                UpdateRequest::new(exec.id.clone(), ExecutionState::Canceled, "user")
                    .expecting(&[ExecutionState::Running]),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::UnexpectedState { .. }));
        assert_eq!(outcome.state(), ExecutionState::Created);
    }

    #[tokio::test]
    async fn test_terminal_is_sticky() {
        let exec = execution(&JobId::generate(), 0);
        let registry = registry_with(&exec).await;
        let cancel = UpdateRequest::new(exec.id.clone(), ExecutionState::Canceled, "user");

        assert!(registry.update_state(cancel.clone()).await.unwrap().is_applied());
        assert_eq!(
            registry.update_state(cancel).await.unwrap(),
            TransitionOutcome::AlreadyTerminal {
                state: ExecutionState::Canceled
            }
        );
        assert_eq!(registry.history(&exec.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_job_index_and_removal() {
        let job_id = JobId::generate();
        let registry = ExecutionRegistry::new();
        let a = execution(&job_id, 0);
        let b = execution(&job_id, 1);
        let other = execution(&JobId::generate(), 0);
        for e in [&a, &b, &other] {
            registry.create(e.clone()).await.unwrap();
        }

        assert_eq!(registry.job_executions(&job_id).await.len(), 2);
        let shard_one = registry.shard_executions(&job_id, 1).await;
        assert_eq!(shard_one.len(), 1);
        assert_eq!(shard_one[0].id, b.id);
        assert_eq!(registry.count_active().await, 3);

        assert_eq!(registry.remove_job(&job_id).await, 2);
        assert_eq!(registry.len().await, 1);
        assert!(registry.contains(&other.id).await);
    }

    #[tokio::test]
    async fn test_remove_selected_executions() {
        let job_id = JobId::generate();
        let registry = ExecutionRegistry::new();
        let a = execution(&job_id, 0);
        let b = execution(&job_id, 1);
        registry.create(a.clone()).await.unwrap();
        registry.create(b.clone()).await.unwrap();

        assert_eq!(registry.remove(&[a.id.clone(), ExecutionId::generate()]).await, 1);
        assert_eq!(registry.all().await.len(), 1);
        assert_eq!(registry.job_executions(&job_id).await[0].id, b.id);

        assert_eq!(registry.remove(&[b.id.clone()]).await, 1);
        assert!(registry.job_executions(&job_id).await.is_empty());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_updates_on_distinct_executions() {
        let job_id = JobId::generate();
        let registry = Arc::new(ExecutionRegistry::new());
        let mut ids = Vec::new();
        for i in 0..32 {
            let e = execution(&job_id, i);
            ids.push(e.id.clone());
            registry.create(e).await.unwrap();
        }

        let mut handles = Vec::new();
        for id in ids.clone() {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .update_state(UpdateRequest::new(id, ExecutionState::Bidding, "ask"))
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_applied());
        }
        for id in ids {
            assert_eq!(registry.state(&id).await.unwrap(), ExecutionState::Bidding);
        }
    }
}
