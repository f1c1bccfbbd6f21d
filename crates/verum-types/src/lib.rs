pub mod digest;
pub mod error;
pub mod execution;
pub mod id;
pub mod job;
pub mod routing;

pub use digest::{PublishedResult, ResultDigest};
pub use error::{Result, TypesError};
pub use execution::{Execution, ExecutionState, LifecycleState, StateTransitionRecord};
pub use id::{ExecutionId, JobId, NodeId, ShardId};
pub use job::{Deal, Job, JobSpec, ResourceRequirements, VerifierKind};
pub use routing::RoutingMetadata;
