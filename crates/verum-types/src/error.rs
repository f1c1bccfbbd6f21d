use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypesError {
    #[error("Invalid deal: {0}")]
    InvalidDeal(String),

    #[error("Invalid job spec: {0}")]
    InvalidJobSpec(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TypesError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TypesError>;
