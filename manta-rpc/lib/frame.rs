use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{RpcError, RpcResult, MAX_MESSAGE_BYTES};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Encodes `msg` as JSON and writes it as a single length-prefixed frame.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> RpcResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_MESSAGE_BYTES {
        return Err(RpcError::MessageTooLarge(payload.len()));
    }

    let header = (payload.len() as u32).to_be_bytes();
    writer.write_all(&header).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;

    Ok(())
}

/// Reads a single length-prefixed frame and decodes its JSON payload.
///
/// Unknown JSON fields are rejected by the message types themselves; this
/// function only enforces the frame-level bounds.
pub async fn read_message<R, T>(reader: &mut R) -> RpcResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;

    let len = u32::from_be_bytes(header);
    if len == 0 || len as usize > MAX_MESSAGE_BYTES {
        return Err(RpcError::InvalidMessageLength(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(serde_json::from_slice(&payload)?)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExecRequest, Request, RequestKind, Response};

    #[tokio::test]
    async fn test_frame_round_trip_ping() -> anyhow::Result<()> {
        let mut buf = Vec::new();
        write_message(&mut buf, &Request::ping()).await?;

        let decoded: Request = read_message(&mut buf.as_slice()).await?;
        assert_eq!(decoded.kind, RequestKind::Ping);
        assert!(decoded.exec.is_none());
        assert!(decoded.net.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_frame_round_trip_exec() -> anyhow::Result<()> {
        let req = Request::exec(ExecRequest {
            use_shell: true,
            cmd: Some("echo hello".into()),
            argv: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout_ms: 1000,
            max_output_bytes: 4096,
        });

        let mut buf = Vec::new();
        write_message(&mut buf, &req).await?;

        let decoded: Request = read_message(&mut buf.as_slice()).await?;
        let exec = decoded.exec.expect("exec payload");
        assert!(exec.use_shell);
        assert_eq!(exec.cmd.as_deref(), Some("echo hello"));
        assert_eq!(exec.timeout_ms, 1000);

        Ok(())
    }

    #[tokio::test]
    async fn test_frame_rejects_zero_length() {
        let buf = 0u32.to_be_bytes().to_vec();
        let result: RpcResult<Request> = read_message(&mut buf.as_slice()).await;
        assert!(matches!(result, Err(RpcError::InvalidMessageLength(0))));
    }

    #[tokio::test]
    async fn test_frame_rejects_oversized_header() {
        // A header claiming 32 MiB must be rejected before any payload read.
        let buf = ((32u32) << 20).to_be_bytes().to_vec();
        let result: RpcResult<Request> = read_message(&mut buf.as_slice()).await;
        assert!(matches!(result, Err(RpcError::InvalidMessageLength(_))));
    }

    #[tokio::test]
    async fn test_frame_rejects_unknown_fields() -> anyhow::Result<()> {
        let payload = br#"{"ok":true,"bogus":1}"#;
        let mut buf = (payload.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(payload);

        let result: RpcResult<Response> = read_message(&mut buf.as_slice()).await;
        assert!(matches!(result, Err(RpcError::Json(_))));

        Ok(())
    }

    #[tokio::test]
    async fn test_frame_is_byte_exact() -> anyhow::Result<()> {
        let mut first = Vec::new();
        write_message(&mut first, &Request::ping()).await?;
        let decoded: Request = read_message(&mut first.as_slice()).await?;

        let mut second = Vec::new();
        write_message(&mut second, &decoded).await?;
        assert_eq!(first, second);

        Ok(())
    }
}
