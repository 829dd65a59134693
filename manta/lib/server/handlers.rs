//! HTTP request handlers.
//!
//! Each handler decodes its body strictly, delegates to a `handle_*` function
//! returning `MantaResult`, and maps errors onto the status codes of the
//! error taxonomy with a `{error}` JSON body.

use std::time::Duration;

use axum::{body::Bytes, extract::State, http::StatusCode, response::IntoResponse, Json};
use manta_rpc::{ExecRequest, Request, RpcError};
use serde::de::DeserializeOwned;

use super::{
    state::ServerState,
    types::{
        CreateResponse, DestroyRequest, ErrorResponse, ExecRequestBody, ExecResponseBody,
        SnapshotCreateRequest, SnapshotCreateResponse, SnapshotDeleteRequest,
        SnapshotListResponse, SnapshotRestoreRequest, SnapshotRestoreResponse, StatusResponse,
    },
};
use crate::{
    agent::AgentConn,
    sandbox::Sandbox,
    snapshot::{self, UserSnapshotMeta},
    MantaError, MantaResult,
};

//-------------------------------------------------------------------------------------------------
// Functions: Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for `POST /create`.
pub async fn create_handler(State(state): State<ServerState>) -> impl IntoResponse {
    match handle_create(state).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(err),
    }
}

/// Handler for `POST /exec`.
pub async fn exec_handler(State(state): State<ServerState>, body: Bytes) -> impl IntoResponse {
    let result = match decode_json::<ExecRequestBody>(&body) {
        Ok(req) => handle_exec(state, req).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(err),
    }
}

/// Handler for `POST /destroy`.
pub async fn destroy_handler(State(state): State<ServerState>, body: Bytes) -> impl IntoResponse {
    let result = match decode_json::<DestroyRequest>(&body) {
        Ok(req) => handle_destroy(state, req).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(err),
    }
}

/// Handler for `POST /snapshot/create`.
pub async fn snapshot_create_handler(
    State(state): State<ServerState>,
    body: Bytes,
) -> impl IntoResponse {
    let result = match decode_json::<SnapshotCreateRequest>(&body) {
        Ok(req) => handle_snapshot_create(state, req).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(err),
    }
}

/// Handler for `POST /snapshot/restore`.
pub async fn snapshot_restore_handler(
    State(state): State<ServerState>,
    body: Bytes,
) -> impl IntoResponse {
    let result = match decode_json::<SnapshotRestoreRequest>(&body) {
        Ok(req) => handle_snapshot_restore(state, req).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(err),
    }
}

/// Handler for `GET /snapshot/list`.
pub async fn snapshot_list_handler(State(state): State<ServerState>) -> impl IntoResponse {
    match handle_snapshot_list(state).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(err),
    }
}

/// Handler for `POST /snapshot/delete`.
pub async fn snapshot_delete_handler(
    State(state): State<ServerState>,
    body: Bytes,
) -> impl IntoResponse {
    let result = match decode_json::<SnapshotDeleteRequest>(&body) {
        Ok(req) => handle_snapshot_delete(state, req).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(err),
    }
}

/// Handler for `GET /healthz`.
pub async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(StatusResponse::ok()))
}

//-------------------------------------------------------------------------------------------------
// Functions: Implementations
//-------------------------------------------------------------------------------------------------

async fn handle_create(state: ServerState) -> MantaResult<CreateResponse> {
    let sandbox = state.manager.create_sandbox().await.inspect_err(|err| {
        tracing::warn!(%err, "create failed");
    })?;
    Ok(CreateResponse {
        sandbox_id: sandbox.id.clone(),
    })
}

async fn handle_exec(state: ServerState, req: ExecRequestBody) -> MantaResult<ExecResponseBody> {
    let sandbox_id = req.sandbox_id.trim();
    if sandbox_id.is_empty() {
        return Err(MantaError::validation("sandbox_id is required"));
    }

    let sandbox = state
        .manager
        .get(sandbox_id)
        .ok_or(MantaError::SandboxNotFound)?;

    let timeout = if req.timeout_ms > 0 {
        Duration::from_millis(req.timeout_ms as u64)
    } else {
        state.cfg.exec_timeout
    };

    let cmd = req.cmd.as_deref().unwrap_or("").trim().to_string();
    let use_shell = if !req.argv.is_empty() {
        if !cmd.is_empty() {
            return Err(MantaError::validation("provide either cmd or argv, not both"));
        }
        if req.use_shell == Some(true) {
            return Err(MantaError::validation("use_shell=true is not valid with argv"));
        }
        false
    } else if !cmd.is_empty() {
        if req.use_shell == Some(false) {
            return Err(MantaError::validation(
                "use_shell=false is not valid with cmd; provide argv instead",
            ));
        }
        true
    } else {
        return Err(MantaError::validation("cmd or argv is required"));
    };

    sandbox.try_start_exec()?;
    let result = exec_on_agent(&state, &sandbox, use_shell, cmd, req.argv, timeout).await;
    sandbox.finish_exec();
    result
}

/// Runs the exec RPC on the sandbox's persistent agent connection, redialing
/// once when the connection looks broken.
async fn exec_on_agent(
    state: &ServerState,
    sandbox: &Sandbox,
    use_shell: bool,
    cmd: String,
    argv: Vec<String>,
    timeout: Duration,
) -> MantaResult<ExecResponseBody> {
    let request = Request::exec(ExecRequest {
        use_shell,
        cmd: (!cmd.is_empty()).then_some(cmd),
        argv,
        cwd: None,
        env: Vec::new(),
        timeout_ms: timeout.as_millis() as i64,
        max_output_bytes: state.cfg.agent_max_output_bytes,
    });

    let mut agent_guard = sandbox.agent.lock().await;

    if agent_guard.is_none() {
        let conn = AgentConn::dial(
            &sandbox.vsock_path,
            state.cfg.agent_port,
            state.cfg.agent_dial_timeout,
        )
        .await
        .map_err(|err| {
            MantaError::AgentRpc(RpcError::Remote(format!("agent dial failed: {}", err)))
        })?;
        *agent_guard = Some(conn);
    }

    let first_attempt = match agent_guard.as_mut() {
        Some(conn) => conn.call(&request, state.cfg.agent_call_timeout).await,
        None => Err(MantaError::AgentRpc(RpcError::Remote(
            "agent connection unavailable".to_string(),
        ))),
    };

    let response = match first_attempt {
        Ok(response) => response,
        Err(first_err) => {
            // Likely a broken or stale connection; retry exactly once on a
            // fresh dial.
            *agent_guard = None;

            let mut fresh = AgentConn::dial(
                &sandbox.vsock_path,
                state.cfg.agent_port,
                state.cfg.agent_dial_timeout,
            )
            .await
            .map_err(|dial_err| {
                MantaError::AgentRpc(RpcError::Remote(format!(
                    "agent dial failed: {} (original error: {})",
                    dial_err, first_err
                )))
            })?;

            let response = fresh
                .call(&request, state.cfg.agent_call_timeout)
                .await
                .map_err(|err| {
                    MantaError::AgentRpc(RpcError::Remote(format!("agent exec failed: {}", err)))
                })?;
            *agent_guard = Some(fresh);
            response
        }
    };

    let exec = response.exec.ok_or_else(|| {
        MantaError::AgentRpc(RpcError::Remote(
            "agent response missing exec payload".to_string(),
        ))
    })?;

    Ok(ExecResponseBody {
        stdout: exec.stdout,
        stderr: exec.stderr,
        exit_code: exec.exit_code,
    })
}

async fn handle_destroy(state: ServerState, req: DestroyRequest) -> MantaResult<StatusResponse> {
    let sandbox_id = req.sandbox_id.trim();
    if sandbox_id.is_empty() {
        return Err(MantaError::validation("sandbox_id is required"));
    }

    state.manager.destroy(sandbox_id).await?;
    Ok(StatusResponse::ok())
}

async fn handle_snapshot_create(
    state: ServerState,
    req: SnapshotCreateRequest,
) -> MantaResult<SnapshotCreateResponse> {
    let sandbox_id = req.sandbox_id.trim();
    if sandbox_id.is_empty() {
        return Err(MantaError::validation("sandbox_id is required"));
    }

    let sandbox = state
        .manager
        .get(sandbox_id)
        .ok_or(MantaError::SandboxNotFound)?;

    let snapshot_id = state.manager.next_snapshot_id();
    let meta: UserSnapshotMeta =
        snapshot::create_user_snapshot(&state.cfg, &sandbox, &snapshot_id, req.name).await?;

    Ok(SnapshotCreateResponse {
        snapshot_id: meta.snapshot_id,
    })
}

async fn handle_snapshot_restore(
    state: ServerState,
    req: SnapshotRestoreRequest,
) -> MantaResult<SnapshotRestoreResponse> {
    let snapshot_id = req.snapshot_id.trim();
    if snapshot_id.is_empty() {
        return Err(MantaError::validation("snapshot_id is required"));
    }
    snapshot::validate_snapshot_id(snapshot_id)?;

    let meta = snapshot::load_user_snapshot_meta(&state.cfg.work_dir, snapshot_id).await?;
    snapshot::ensure_lineage_matches(&state.cfg, &meta)?;

    let sandbox = state.manager.restore_user_snapshot(&meta).await?;
    Ok(SnapshotRestoreResponse {
        sandbox_id: sandbox.id.clone(),
    })
}

async fn handle_snapshot_list(state: ServerState) -> MantaResult<SnapshotListResponse> {
    let snapshots = snapshot::list_user_snapshots(&state.cfg.work_dir).await?;
    Ok(SnapshotListResponse { snapshots })
}

async fn handle_snapshot_delete(
    state: ServerState,
    req: SnapshotDeleteRequest,
) -> MantaResult<StatusResponse> {
    let snapshot_id = req.snapshot_id.trim();
    if snapshot_id.is_empty() {
        return Err(MantaError::validation("snapshot_id is required"));
    }
    snapshot::validate_snapshot_id(snapshot_id)?;

    snapshot::delete_user_snapshot(&state.cfg.work_dir, snapshot_id).await?;
    Ok(StatusResponse::ok())
}

//-------------------------------------------------------------------------------------------------
// Functions: Helpers
//-------------------------------------------------------------------------------------------------

fn decode_json<T: DeserializeOwned>(body: &[u8]) -> MantaResult<T> {
    serde_json::from_slice(body).map_err(|_| MantaError::validation("invalid request body"))
}

fn error_response(err: MantaError) -> axum::response::Response {
    (
        err.status_code(),
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_json_rejects_unknown_fields() {
        let result: MantaResult<DestroyRequest> =
            decode_json(br#"{"sandbox_id":"sb-1","force":true}"#);
        assert!(matches!(result, Err(MantaError::Validation(_))));
    }

    #[test]
    fn test_decode_json_rejects_malformed_body() {
        let result: MantaResult<DestroyRequest> = decode_json(b"not json at all");
        assert!(matches!(result, Err(MantaError::Validation(_))));
    }

    #[tokio::test]
    async fn test_error_response_carries_taxonomy_status() {
        let resp = error_response(MantaError::SandboxNotFound);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = error_response(MantaError::validation("bad"));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = error_response(MantaError::LineageMismatch {
            snapshot: "a".into(),
            current: "b".into(),
        });
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
