use std::{
    path::Path,
    time::{Duration, Instant},
};

use manta_rpc::{Request, Response, RpcError};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixStream,
    },
};

use crate::{config::AGENT_READY_POLL_INTERVAL, MantaError, MantaResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Deadline for the readiness ping once a dial has succeeded.
const READY_PING_TIMEOUT: Duration = Duration::from_secs(2);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A connection to the in-guest agent.
///
/// One connection carries multiple request/response pairs serially. Callers
/// serialize access through the sandbox's agent mutex; [`AgentConn::call`]
/// takes `&mut self` so concurrent calls on one connection can't compile.
#[derive(Debug)]
pub struct AgentConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AgentConn {
    /// Dials the sandbox's vsock unix socket and performs the Firecracker
    /// `CONNECT <port>` handshake.
    ///
    /// Firecracker answers `OK <cid>` (or bare `OK`) once the guest side
    /// accepts; anything else fails the dial.
    pub async fn dial(uds_path: &Path, port: u32, timeout: Duration) -> MantaResult<Self> {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(2)
        } else {
            timeout
        };

        tokio::time::timeout(timeout, Self::dial_inner(uds_path, port))
            .await
            .map_err(|_| {
                MantaError::AgentRpc(RpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("agent dial timed out after {:?}", timeout),
                )))
            })?
    }

    async fn dial_inner(uds_path: &Path, port: u32) -> MantaResult<Self> {
        let stream = UnixStream::connect(uds_path)
            .await
            .map_err(|e| MantaError::AgentRpc(RpcError::Io(e)))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("CONNECT {}\n", port).as_bytes())
            .await
            .map_err(|e| MantaError::AgentRpc(RpcError::Io(e)))?;

        let mut line = String::new();
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| MantaError::AgentRpc(RpcError::Io(e)))?;

        let trimmed = line.trim();
        if trimmed != "OK" && !trimmed.starts_with("OK ") {
            return Err(MantaError::AgentRpc(RpcError::Remote(format!(
                "vsock CONNECT failed: {:?}",
                trimmed
            ))));
        }

        Ok(Self {
            reader,
            writer: write_half,
        })
    }

    /// Sends one request and reads its response, bounded by `timeout`.
    ///
    /// A response with `ok=false` becomes an error carrying the agent's
    /// message. After a timeout the connection is in an unknown framing state
    /// and must be dropped and redialed.
    pub async fn call(&mut self, request: &Request, timeout: Duration) -> MantaResult<Response> {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(20)
        } else {
            timeout
        };

        let response = tokio::time::timeout(timeout, self.call_inner(request))
            .await
            .map_err(|_| {
                MantaError::AgentRpc(RpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("agent call timed out after {:?}", timeout),
                )))
            })??;

        if !response.ok {
            let msg = response
                .error
                .as_deref()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or("agent returned ok=false")
                .to_string();
            return Err(MantaError::AgentRpc(RpcError::Remote(msg)));
        }

        Ok(response)
    }

    async fn call_inner(&mut self, request: &Request) -> MantaResult<Response> {
        manta_rpc::write_message(&mut self.writer, request).await?;
        let response = manta_rpc::read_message(&mut self.reader).await?;
        Ok(response)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Dials and pings the agent until it answers or `wait_timeout` expires.
///
/// A successful dial alone is not readiness: Firecracker accepts the host
/// side of the vsock before the guest agent is listening, so only a completed
/// `ping` counts.
pub async fn wait_for_agent_ready(
    uds_path: &Path,
    port: u32,
    wait_timeout: Duration,
    dial_timeout: Duration,
) -> MantaResult<AgentConn> {
    let deadline = Instant::now() + wait_timeout;
    let mut last_err: Option<MantaError> = None;

    while Instant::now() < deadline {
        match AgentConn::dial(uds_path, port, dial_timeout).await {
            Ok(mut conn) => match conn.call(&Request::ping(), READY_PING_TIMEOUT).await {
                Ok(_) => return Ok(conn),
                Err(err) => last_err = Some(err),
            },
            Err(err) => last_err = Some(err),
        }
        tokio::time::sleep(AGENT_READY_POLL_INTERVAL).await;
    }

    match last_err {
        Some(err) => Err(MantaError::ReadinessTimeout(format!(
            "agent not ready after {:?}: {}",
            wait_timeout, err
        ))),
        None => Err(MantaError::ReadinessTimeout(format!(
            "agent not ready after {:?}",
            wait_timeout
        ))),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use manta_rpc::{PingResponse, RequestKind};
    use tokio::net::UnixListener;

    /// Serves one connection with the Firecracker-style handshake followed by
    /// framed ping responses.
    async fn serve_one(listener: UnixListener, handshake_reply: &'static str, pings: usize) {
        let (stream, _) = listener.accept().await.expect("accept");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        reader.read_line(&mut line).await.expect("handshake line");
        assert!(line.starts_with("CONNECT "));
        write_half
            .write_all(handshake_reply.as_bytes())
            .await
            .expect("handshake reply");

        for _ in 0..pings {
            let req: Request = manta_rpc::read_message(&mut reader).await.expect("request");
            assert_eq!(req.kind, RequestKind::Ping);
            let resp = Response {
                ok: true,
                error: None,
                ping: Some(PingResponse {
                    agent_version: "test".into(),
                    now_unix_ms: 0,
                }),
                exec: None,
                net: None,
            };
            manta_rpc::write_message(&mut write_half, &resp)
                .await
                .expect("response");
        }
    }

    #[tokio::test]
    async fn test_dial_and_ping() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sock = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&sock)?;
        let server = tokio::spawn(serve_one(listener, "OK 3\n", 2));

        let mut conn = AgentConn::dial(&sock, 7777, Duration::from_secs(1)).await?;
        let resp = conn.call(&Request::ping(), Duration::from_secs(1)).await?;
        assert_eq!(resp.ping.expect("ping payload").agent_version, "test");

        // The same connection carries a second round trip.
        let resp = conn.call(&Request::ping(), Duration::from_secs(1)).await?;
        assert!(resp.ok);

        server.await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_dial_rejects_bad_handshake() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sock = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&sock)?;
        let server = tokio::spawn(serve_one(listener, "ERR no such port\n", 0));

        let result = AgentConn::dial(&sock, 7777, Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(MantaError::AgentRpc(RpcError::Remote(_)))
        ));

        server.await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_for_agent_ready_times_out_without_listener() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sock = dir.path().join("vsock.sock");

        let result = wait_for_agent_ready(
            &sock,
            7777,
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await;

        assert!(matches!(result, Err(MantaError::ReadinessTimeout(_))));
    }
}
