use thiserror::Error;

use crate::rpc::wire::StatusCode;

/// Error kinds surfaced by agent operations. The RPC layer maps each kind
/// onto exactly one wire status code; everything that is not a caller
/// mistake or a missing object is `Internal`.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        AgentError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AgentError::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AgentError::Internal(anyhow::anyhow!(msg.into()))
    }

    pub fn code(&self) -> StatusCode {
        match self {
            AgentError::InvalidArgument(_) => StatusCode::InvalidArgument,
            AgentError::NotFound(_) => StatusCode::NotFound,
            AgentError::Internal(_) => StatusCode::Internal,
        }
    }
}

impl From<virt::error::Error> for AgentError {
    fn from(e: virt::error::Error) -> Self {
        AgentError::Internal(anyhow::Error::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_status_codes() {
        assert_eq!(
            AgentError::invalid_argument("x").code(),
            StatusCode::InvalidArgument
        );
        assert_eq!(AgentError::not_found("x").code(), StatusCode::NotFound);
        assert_eq!(AgentError::internal("x").code(), StatusCode::Internal);
    }
}
