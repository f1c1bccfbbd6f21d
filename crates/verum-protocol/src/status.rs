//! Job and shard outcomes as reported to callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use verum_types::{
    Execution, ExecutionId, ExecutionState, JobId, LifecycleState, NodeId, ShardId,
};

/// Where a shard is in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardOutcome {
    Bidding,
    WaitingForResults,
    Verifying,
    Publishing,
    Published,
    Failed,
    Canceled,
}

impl ShardOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bidding => "Bidding",
            Self::WaitingForResults => "WaitingForResults",
            Self::Verifying => "Verifying",
            Self::Publishing => "Publishing",
            Self::Published => "Published",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for ShardOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LifecycleState for ShardOutcome {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::Failed | Self::Canceled)
    }

    fn can_transition_to(&self, next: &Self) -> bool {
        use ShardOutcome::*;
        match (self, next) {
            (s, Failed) | (s, Canceled) => !s.is_terminal(),
            (Bidding, WaitingForResults) => true,
            (WaitingForResults, Verifying) => true,
            (Verifying, Publishing) => true,
            (Publishing, Published) => true,
            _ => false,
        }
    }
}

/// Why a shard failed. `Display` gives the reason string shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardFailure {
    NoBids,
    NotEnoughBids { received: usize, required: usize },
    NoQuorum,
    ComputeError(String),
    PublishFailed(String),
    TimedOut(ShardOutcome),
    Canceled(String),
}

impl fmt::Display for ShardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBids => write!(f, "no nodes bid"),
            Self::NotEnoughBids { received, required } => write!(
                f,
                "not enough bids: received {}, required {}",
                received, required
            ),
            Self::NoQuorum => write!(f, "verification failed: no quorum"),
            Self::ComputeError(msg) => write!(f, "compute error: {}", msg),
            Self::PublishFailed(msg) => write!(f, "publish failed: {}", msg),
            Self::TimedOut(outcome) => write!(f, "shard timed out while in state {}", outcome),
            Self::Canceled(reason) => write!(f, "canceled: {}", reason),
        }
    }
}

/// Terminal state of a job, derived from its shards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    InProgress,
    /// Every shard published
    Completed,
    /// Some shards published, some failed
    CompletedWithErrors,
    /// No shard published
    Error,
    Canceled,
}

impl JobState {
    pub fn derive<'a>(shards: impl IntoIterator<Item = &'a ShardOutcome>) -> Self {
        let mut published = 0;
        let mut failed = 0;
        for outcome in shards {
            match outcome {
                ShardOutcome::Published => published += 1,
                ShardOutcome::Failed | ShardOutcome::Canceled => failed += 1,
                _ => return Self::InProgress,
            }
        }
        match (published, failed) {
            (_, 0) => Self::Completed,
            (0, _) => Self::Error,
            _ => Self::CompletedWithErrors,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl LifecycleState for JobState {
    fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    fn can_transition_to(&self, next: &Self) -> bool {
        matches!(self, Self::InProgress) && *next != Self::InProgress
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStatus {
    pub index: u32,
    pub outcome: ShardOutcome,
    /// Failure reason, set once the shard failed or was canceled
    pub reason: Option<String>,
    pub executions: Vec<Execution>,
}

impl ShardStatus {
    pub fn published(&self) -> impl Iterator<Item = &Execution> {
        self.executions
            .iter()
            .filter(|e| e.state == ExecutionState::Published)
    }

    pub fn count_in(&self, state: ExecutionState) -> usize {
        self.executions.iter().filter(|e| e.state == state).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub shards: Vec<ShardStatus>,
}

impl JobStatus {
    pub fn shard(&self, index: u32) -> Option<&ShardStatus> {
        self.shards.iter().find(|s| s.index == index)
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.shards.iter().flat_map(|s| s.executions.iter())
    }

    pub fn count_in(&self, state: ExecutionState) -> usize {
        self.executions().filter(|e| e.state == state).count()
    }
}

/// Progress notifications emitted by the requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEvent {
    BidReceived {
        shard: ShardId,
        node_id: NodeId,
        accepted: bool,
    },
    BidAccepted {
        shard: ShardId,
        execution_id: ExecutionId,
    },
    BidRejected {
        shard: ShardId,
        execution_id: ExecutionId,
        reason: String,
    },
    ResultProposed {
        shard: ShardId,
        execution_id: ExecutionId,
    },
    ResultsVerified {
        shard: ShardId,
        accepted: usize,
        rejected: usize,
    },
    Published {
        shard: ShardId,
        execution_id: ExecutionId,
        location: String,
    },
    ShardFailed {
        shard: ShardId,
        reason: String,
    },
    ExecutionCanceled {
        execution_id: ExecutionId,
        reason: String,
    },
    JobCompleted {
        job_id: JobId,
        state: JobState,
    },
}
