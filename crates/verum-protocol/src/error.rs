use thiserror::Error;
use verum_types::TypesError;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution already registered: {0}")]
    ExecutionExists(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already submitted: {0}")]
    JobExists(String),

    #[error(
        "Routing mismatch for {execution_id}: expected {expected_source} -> {expected_target}, \
         got {actual_source} -> {actual_target}"
    )]
    RoutingMismatch {
        execution_id: String,
        expected_source: String,
        expected_target: String,
        actual_source: String,
        actual_target: String,
    },

    #[error("Not enough nodes: need {required}, found {available}")]
    NotEnoughNodes { required: usize, available: usize },

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Invalid bid request: {0}")]
    InvalidBidRequest(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Types error: {0}")]
    Types(#[from] TypesError),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl ProtocolError {
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}
