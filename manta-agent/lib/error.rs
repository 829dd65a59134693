use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an agent-side operation.
pub type AgentResult<T> = Result<T, AgentError>;

/// An error the agent reports back to the control plane.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A request payload failed validation.
    #[error("{0}")]
    InvalidRequest(String),

    /// Spawning or reaping the guest command failed.
    #[error("exec failed: {0}")]
    Exec(#[from] std::io::Error),

    /// Applying guest network configuration failed.
    #[error("{0}")]
    Net(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AgentError {
    /// Shorthand for an [`AgentError::InvalidRequest`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        AgentError::InvalidRequest(msg.into())
    }

    /// Shorthand for an [`AgentError::Net`].
    pub fn net(msg: impl Into<String>) -> Self {
        AgentError::Net(msg.into())
    }
}
