use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The operation a request asks the agent to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Liveness probe; also the readiness signal after boot or restore.
    Ping,

    /// Run a command inside the guest.
    Exec,

    /// Apply guest-side network configuration.
    Net,
}

/// A request from the control plane to the in-guest agent.
///
/// Exactly the payload matching `kind` is set; the others stay `None` and are
/// omitted from the wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    /// The operation to perform.
    #[serde(rename = "type")]
    pub kind: RequestKind,

    /// Payload for [`RequestKind::Exec`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecRequest>,

    /// Payload for [`RequestKind::Net`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net: Option<NetRequest>,
}

/// A response from the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Response {
    /// Whether the request succeeded.
    pub ok: bool,

    /// Failure detail when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Payload answering a `ping` request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingResponse>,

    /// Payload answering an `exec` request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecResponse>,

    /// Payload answering a `net` request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<NetResponse>,
}

/// Agent identity and clock reading returned by `ping`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PingResponse {
    /// The agent's build version string.
    pub agent_version: String,

    /// The guest's wall clock in unix milliseconds.
    pub now_unix_ms: i64,
}

/// A command to run inside the guest.
///
/// Exactly one of `cmd` and `argv` must be non-empty: `use_shell=true`
/// requires `cmd` (run as `/bin/sh -lc <cmd>`), `use_shell=false` requires
/// `argv` (direct execve-style spawn).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecRequest {
    /// Whether to run `cmd` through the shell.
    pub use_shell: bool,

    /// Shell command line; required when `use_shell` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,

    /// Direct argv; required when `use_shell` is false.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub argv: Vec<String>,

    /// Working directory for the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Extra `KEY=value` environment entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Wall-clock budget for the command; 0 means the agent default.
    #[serde(default)]
    pub timeout_ms: i64,

    /// Per-stream cap on captured stdout/stderr; 0 means the agent default.
    #[serde(default)]
    pub max_output_bytes: i64,
}

/// The outcome of an `exec` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecResponse {
    /// The command's exit code (124 when the timeout fired).
    pub exit_code: i32,

    /// Captured stdout, truncated at the requested cap.
    pub stdout: String,

    /// Captured stderr, truncated at the requested cap.
    pub stderr: String,

    /// Whether the command was killed by the timeout.
    pub timed_out: bool,
}

/// Guest network configuration to apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetRequest {
    /// Interface to configure; defaults to the first guest NIC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    /// Interface address in CIDR form, e.g. `172.16.5.2/30`.
    pub address: String,

    /// Default gateway, e.g. `172.16.5.1`.
    pub gateway: String,

    /// Nameserver written to `/etc/resolv.conf` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,
}

/// The outcome of a `net` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetResponse {
    /// Whether the configuration was fully applied.
    pub configured: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Request {
    /// Builds a `ping` request.
    pub fn ping() -> Self {
        Self {
            kind: RequestKind::Ping,
            exec: None,
            net: None,
        }
    }

    /// Builds an `exec` request.
    pub fn exec(exec: ExecRequest) -> Self {
        Self {
            kind: RequestKind::Exec,
            exec: Some(exec),
            net: None,
        }
    }

    /// Builds a `net` request.
    pub fn net(net: NetRequest) -> Self {
        Self {
            kind: RequestKind::Net,
            exec: None,
            net: Some(net),
        }
    }
}

impl Response {
    /// Builds a failure response carrying `error`.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ping: None,
            exec: None,
            net: None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() -> anyhow::Result<()> {
        let raw = serde_json::to_string(&Request::ping())?;
        assert_eq!(raw, r#"{"type":"ping"}"#);

        let req = Request::net(NetRequest {
            interface: None,
            address: "172.16.5.2/30".into(),
            gateway: "172.16.5.1".into(),
            dns: Some("1.1.1.1".into()),
        });
        let raw = serde_json::to_string(&req)?;
        assert_eq!(
            raw,
            r#"{"type":"net","net":{"address":"172.16.5.2/30","gateway":"172.16.5.1","dns":"1.1.1.1"}}"#
        );

        Ok(())
    }

    #[test]
    fn test_response_rejects_unknown_fields() {
        let raw = r#"{"ok":true,"surprise":"field"}"#;
        assert!(serde_json::from_str::<Response>(raw).is_err());
    }

    #[test]
    fn test_exec_request_defaults() -> anyhow::Result<()> {
        let raw = r#"{"use_shell":true,"cmd":"true"}"#;
        let exec: ExecRequest = serde_json::from_str(raw)?;
        assert_eq!(exec.timeout_ms, 0);
        assert_eq!(exec.max_output_bytes, 0);
        assert!(exec.argv.is_empty());

        Ok(())
    }
}
