//! Request and response bodies for the HTTP API.
//!
//! Requests reject unknown fields so client schema drift fails loudly with a
//! 400 instead of silently dropping options.

use serde::{Deserialize, Serialize};

use crate::snapshot::UserSnapshotMeta;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Response body for `POST /create`.
#[derive(Debug, Serialize)]
pub struct CreateResponse {
    /// The new sandbox's ID.
    pub sandbox_id: String,
}

/// Request body for `POST /exec`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecRequestBody {
    /// Target sandbox.
    pub sandbox_id: String,

    /// Shell mode: run `/bin/sh -lc <cmd>`.
    #[serde(default)]
    pub cmd: Option<String>,

    /// No-shell mode: run argv directly, execve-style.
    #[serde(default)]
    pub argv: Vec<String>,

    /// Optional explicit switch; inferred from which of `cmd`/`argv` is set
    /// when omitted.
    #[serde(default)]
    pub use_shell: Option<bool>,

    /// Per-request timeout override in milliseconds; 0 uses the server
    /// default.
    #[serde(default)]
    pub timeout_ms: i64,
}

/// Response body for `POST /exec`.
#[derive(Debug, Serialize)]
pub struct ExecResponseBody {
    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// The command's exit code.
    pub exit_code: i32,
}

/// Request body for `POST /destroy`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestroyRequest {
    /// Target sandbox.
    pub sandbox_id: String,
}

/// Generic `{status: "ok"}` response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Always `"ok"`.
    pub status: &'static str,
}

/// Request body for `POST /snapshot/create`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotCreateRequest {
    /// Sandbox to snapshot.
    pub sandbox_id: String,

    /// Optional human-readable name.
    #[serde(default)]
    pub name: Option<String>,
}

/// Response body for `POST /snapshot/create`.
#[derive(Debug, Serialize)]
pub struct SnapshotCreateResponse {
    /// The new snapshot's ID, `us-N`.
    pub snapshot_id: String,
}

/// Request body for `POST /snapshot/restore`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotRestoreRequest {
    /// Snapshot to restore from.
    pub snapshot_id: String,
}

/// Response body for `POST /snapshot/restore`.
#[derive(Debug, Serialize)]
pub struct SnapshotRestoreResponse {
    /// The restored sandbox's ID.
    pub sandbox_id: String,
}

/// Response body for `GET /snapshot/list`.
#[derive(Debug, Serialize)]
pub struct SnapshotListResponse {
    /// User bundles, newest first.
    pub snapshots: Vec<UserSnapshotMeta>,
}

/// Request body for `POST /snapshot/delete`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotDeleteRequest {
    /// Snapshot to delete.
    pub snapshot_id: String,
}

/// Error response returned when an operation fails.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// What went wrong.
    pub error: String,
}

//-------------------------------------------------------------------------------------------------
// Methods
//-------------------------------------------------------------------------------------------------

impl StatusResponse {
    /// The canonical OK body.
    pub fn ok() -> Self {
        Self { status: "ok" }
    }
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_request_rejects_unknown_fields() {
        let raw = r#"{"sandbox_id":"sb-1","cmd":"true","shell":true}"#;
        assert!(serde_json::from_str::<ExecRequestBody>(raw).is_err());
    }

    #[test]
    fn test_exec_request_defaults() -> anyhow::Result<()> {
        let raw = r#"{"sandbox_id":"sb-1","cmd":"echo hello"}"#;
        let req: ExecRequestBody = serde_json::from_str(raw)?;
        assert_eq!(req.cmd.as_deref(), Some("echo hello"));
        assert!(req.argv.is_empty());
        assert!(req.use_shell.is_none());
        assert_eq!(req.timeout_ms, 0);
        Ok(())
    }

    #[test]
    fn test_status_response_shape() -> anyhow::Result<()> {
        assert_eq!(
            serde_json::to_string(&StatusResponse::ok())?,
            r#"{"status":"ok"}"#
        );
        Ok(())
    }
}
