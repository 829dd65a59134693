use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a manta-related operation.
pub type MantaResult<T> = Result<T, MantaError>;

/// An error raised by the manta control plane.
///
/// Variants map onto the HTTP surface: validation failures become 400,
/// missing sandboxes/snapshots 404, lineage and lifecycle conflicts 409, and
/// everything else 500. The mapping lives in [`MantaError::status_code`].
#[derive(Debug, Error)]
pub enum MantaError {
    /// A request failed validation (malformed body, conflicting fields,
    /// invalid snapshot ID, unknown exec transport).
    #[error("{0}")]
    Validation(String),

    /// The referenced sandbox does not exist.
    #[error("sandbox not found")]
    SandboxNotFound,

    /// The referenced snapshot does not exist or its metadata is unreadable.
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// A snapshot's lineage disagrees with the current base rootfs.
    #[error("snapshot lineage mismatch (snapshot={snapshot} current={current})")]
    LineageMismatch {
        /// Lineage recorded in the snapshot metadata.
        snapshot: String,
        /// Lineage of the currently configured base rootfs.
        current: String,
    },

    /// Host-side resource provisioning failed (netns, veth, tap, routes,
    /// disk clone).
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// The VMM control API returned a non-2xx status or failed outright.
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    /// A readiness gate (API socket, agent ping, guest net) expired.
    #[error("readiness timeout: {0}")]
    ReadinessTimeout(String),

    /// The framed RPC to the in-guest agent failed.
    #[error("agent rpc error: {0}")]
    AgentRpc(#[from] manta_rpc::RpcError),

    /// An operation raced a destroy on the same sandbox.
    #[error("sandbox is closing")]
    SandboxClosing,

    /// Configuration could not be loaded or validated.
    #[error("config error: {0}")]
    Config(String),

    /// An underlying filesystem or socket operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Persisted metadata could not be encoded or decoded.
    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MantaError {
    /// Maps the error onto the HTTP status the API surface reports.
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;

        match self {
            MantaError::Validation(_) => StatusCode::BAD_REQUEST,
            MantaError::SandboxNotFound | MantaError::SnapshotNotFound(_) => StatusCode::NOT_FOUND,
            MantaError::LineageMismatch { .. } | MantaError::SandboxClosing => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Shorthand for a [`MantaError::Validation`] error.
    pub fn validation(msg: impl Into<String>) -> Self {
        MantaError::Validation(msg.into())
    }

    /// Shorthand for a [`MantaError::Provisioning`] error.
    pub fn provisioning(msg: impl Into<String>) -> Self {
        MantaError::Provisioning(msg.into())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            MantaError::validation("bad body").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            MantaError::SandboxNotFound.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            MantaError::LineageMismatch {
                snapshot: "a".into(),
                current: "b".into()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            MantaError::SandboxClosing.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            MantaError::provisioning("tap").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_lineage_mismatch_message_shape() {
        let err = MantaError::LineageMismatch {
            snapshot: "aaa".into(),
            current: "bbb".into(),
        };
        assert_eq!(
            err.to_string(),
            "snapshot lineage mismatch (snapshot=aaa current=bbb)"
        );
    }
}
