use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an RPC framing or protocol operation.
pub type RpcResult<T> = Result<T, RpcError>;

/// An error raised while reading or writing framed RPC messages.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The underlying stream failed.
    #[error("rpc io error: {0}")]
    Io(#[from] std::io::Error),

    /// The payload could not be encoded or decoded as JSON.
    #[error("rpc json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame header declared an invalid payload length.
    #[error("invalid message length: {0}")]
    InvalidMessageLength(u32),

    /// An outgoing message exceeded the frame size cap.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// The remote side answered `ok=false`.
    #[error("agent error: {0}")]
    Remote(String),
}
