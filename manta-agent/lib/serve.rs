use manta_rpc::{PingResponse, Request, RequestKind, Response};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::{exec, netcfg, AGENT_VERSION};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Serves framed request/response pairs on one connection until EOF or a
/// protocol error.
///
/// Requests on a connection are handled strictly serially; the host side
/// relies on that for its one-outstanding-call discipline.
pub async fn serve_conn<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    loop {
        let request: Request = match manta_rpc::read_message(&mut reader).await {
            Ok(request) => request,
            Err(manta_rpc::RpcError::Io(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                return;
            }
            Err(err) => {
                // Framing is broken; there is no way to resynchronize.
                tracing::warn!(%err, "read request");
                return;
            }
        };

        let response = handle(&request).await;
        if let Err(err) = manta_rpc::write_message(&mut write_half, &response).await {
            tracing::warn!(%err, "write response");
            return;
        }
    }
}

/// Dispatches one request.
pub async fn handle(request: &Request) -> Response {
    match request.kind {
        RequestKind::Ping => Response {
            ok: true,
            error: None,
            ping: Some(PingResponse {
                agent_version: AGENT_VERSION.to_string(),
                now_unix_ms: now_unix_ms(),
            }),
            exec: None,
            net: None,
        },
        RequestKind::Exec => {
            let Some(exec_request) = &request.exec else {
                return Response::failure("missing exec payload");
            };
            match exec::run_exec(exec_request).await {
                Ok(exec_response) => Response {
                    ok: true,
                    error: None,
                    ping: None,
                    exec: Some(exec_response),
                    net: None,
                },
                Err(err) => Response::failure(err.to_string()),
            }
        }
        RequestKind::Net => {
            let Some(net_request) = &request.net else {
                return Response::failure("missing net payload");
            };
            match netcfg::configure_network(net_request).await {
                Ok(()) => Response {
                    ok: true,
                    error: None,
                    ping: None,
                    exec: None,
                    net: Some(manta_rpc::NetResponse { configured: true }),
                },
                Err(err) => Response {
                    ok: false,
                    error: Some(err.to_string()),
                    ping: None,
                    exec: None,
                    net: Some(manta_rpc::NetResponse { configured: false }),
                },
            }
        }
    }
}

fn now_unix_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use manta_rpc::ExecRequest;

    #[tokio::test]
    async fn test_handle_ping() {
        let response = handle(&Request::ping()).await;
        assert!(response.ok);
        let ping = response.ping.expect("ping payload");
        assert_eq!(ping.agent_version, AGENT_VERSION);
        assert!(ping.now_unix_ms > 0);
    }

    #[tokio::test]
    async fn test_handle_exec_round_trip() {
        let response = handle(&Request::exec(ExecRequest {
            use_shell: true,
            cmd: Some("echo hi".into()),
            argv: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout_ms: 5000,
            max_output_bytes: 1 << 16,
        }))
        .await;

        assert!(response.ok);
        let exec = response.exec.expect("exec payload");
        assert_eq!(exec.exit_code, 0);
        assert!(exec.stdout.ends_with("hi\n"));
    }

    #[tokio::test]
    async fn test_handle_exec_missing_payload() {
        let request = Request {
            kind: RequestKind::Exec,
            exec: None,
            net: None,
        };
        let response = handle(&request).await;
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("missing exec payload"));
    }

    #[tokio::test]
    async fn test_serve_conn_round_trips_over_a_socket() -> anyhow::Result<()> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(serve_conn(server));

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half);

        // Two serial requests on the same connection.
        for _ in 0..2 {
            manta_rpc::write_message(&mut write_half, &Request::ping()).await?;
            let response: Response = manta_rpc::read_message(&mut reader).await?;
            assert!(response.ok);
        }

        drop(write_half);
        drop(reader);
        server_task.await?;
        Ok(())
    }
}
