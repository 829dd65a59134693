use std::{path::PathBuf, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{client::conn::http1, Method, Request};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::UnixStream;

use crate::{config::HYPERVISOR_CLIENT_TIMEOUT, MantaError, MantaResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Client for the Firecracker control API on a per-sandbox unix socket.
///
/// The client is stateless beyond the socket path: every call opens a fresh
/// connection, which keeps failure attribution simple during the restore
/// window when the socket may not be accepting yet. Connect-phase failures
/// surface as [`MantaError::Io`] so callers can classify transient
/// `ENOENT`/`ECONNREFUSED` races; protocol failures surface as
/// [`MantaError::Hypervisor`].
#[derive(Debug, Clone)]
pub struct HypervisorClient {
    socket_path: PathBuf,
    timeout: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HypervisorClient {
    /// Creates a client for the VMM listening on `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: timeout.unwrap_or(HYPERVISOR_CLIENT_TIMEOUT),
        }
    }

    /// Pauses the VM. Idempotent on the VMM side.
    pub async fn pause(&self) -> MantaResult<()> {
        self.do_json(Method::PATCH, "/vm", Some(json!({"state": "Paused"})))
            .await
    }

    /// Resumes the VM. Idempotent on the VMM side.
    pub async fn resume(&self) -> MantaResult<()> {
        self.do_json(Method::PATCH, "/vm", Some(json!({"state": "Resumed"})))
            .await
    }

    /// Writes a full snapshot (state + guest memory) to the given paths.
    ///
    /// The caller must pause the VM first; the VMM rejects snapshotting a
    /// running machine.
    pub async fn create_full_snapshot(
        &self,
        state_path: &str,
        mem_path: &str,
    ) -> MantaResult<()> {
        self.do_json(
            Method::PUT,
            "/snapshot/create",
            Some(json!({
                "snapshot_type": "Full",
                "snapshot_path": state_path,
                "mem_file_path": mem_path,
            })),
        )
        .await
    }

    /// Restores the VM from a snapshot; with `resume` the VM is running on
    /// return.
    pub async fn load_snapshot(
        &self,
        state_path: &str,
        mem_path: &str,
        resume: bool,
    ) -> MantaResult<()> {
        self.do_json(
            Method::PUT,
            "/snapshot/load",
            Some(json!({
                "snapshot_path": state_path,
                "mem_backend": {
                    "backend_type": "File",
                    "backend_path": mem_path,
                },
                "resume_vm": resume,
            })),
        )
        .await
    }

    async fn do_json(
        &self,
        method: Method,
        path: &str,
        payload: Option<serde_json::Value>,
    ) -> MantaResult<()> {
        let fut = self.do_json_inner(method.clone(), path, payload);
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MantaError::Hypervisor(format!(
                "firecracker {} {}: deadline exceeded after {:?}",
                method, path, self.timeout
            ))),
        }
    }

    async fn do_json_inner(
        &self,
        method: Method,
        path: &str,
        payload: Option<serde_json::Value>,
    ) -> MantaResult<()> {
        // Connect errors keep their errno so the snapshot-load retry loop can
        // tell a not-yet-listening socket from a real failure.
        let stream = UnixStream::connect(&self.socket_path).await?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| MantaError::Hypervisor(format!("firecracker handshake: {}", e)))?;
        tokio::spawn(conn);

        let body = match &payload {
            Some(value) => Full::new(Bytes::from(serde_json::to_vec(value)?)),
            None => Full::new(Bytes::new()),
        };

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(format!("http://localhost{}", path))
            .header(hyper::header::ACCEPT, "application/json");
        if payload.is_some() {
            builder = builder.header(hyper::header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(body)
            .map_err(|e| MantaError::Hypervisor(format!("build request: {}", e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| MantaError::Hypervisor(format!("firecracker {} {}: {}", method, path, e)))?;

        let status = response.status();
        let raw = response
            .into_body()
            .collect()
            .await
            .map_err(|e| MantaError::Hypervisor(format!("read response body: {}", e)))?
            .to_bytes();

        if !status.is_success() {
            let msg = String::from_utf8_lossy(&raw);
            let msg = msg.trim();
            if msg.is_empty() {
                return Err(MantaError::Hypervisor(format!(
                    "firecracker {} {}: status {}",
                    method, path, status
                )));
            }
            return Err(MantaError::Hypervisor(format!(
                "firecracker {} {}: status {} body={:?}",
                method, path, status, msg
            )));
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether an error is a transient unix-socket race from the VMM's startup
/// window (socket file not yet created, or created but not yet listening).
pub fn is_transient_uds_error(err: &MantaError) -> bool {
    match err {
        MantaError::Io(io) => matches!(
            io.raw_os_error(),
            Some(libc::ENOENT) | Some(libc::ECONNREFUSED)
        ),
        _ => false,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let enoent = MantaError::Io(std::io::Error::from_raw_os_error(libc::ENOENT));
        let refused = MantaError::Io(std::io::Error::from_raw_os_error(libc::ECONNREFUSED));
        let denied = MantaError::Io(std::io::Error::from_raw_os_error(libc::EACCES));

        assert!(is_transient_uds_error(&enoent));
        assert!(is_transient_uds_error(&refused));
        assert!(!is_transient_uds_error(&denied));
        assert!(!is_transient_uds_error(&MantaError::Hypervisor(
            "status 400".into()
        )));
    }

    #[tokio::test]
    async fn test_connect_error_keeps_errno() {
        let client = HypervisorClient::new("/nonexistent/manta-test.sock", None);
        let err = client.pause().await.expect_err("connect must fail");
        assert!(is_transient_uds_error(&err));
    }
}
