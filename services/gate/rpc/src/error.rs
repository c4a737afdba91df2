//! RPC error types.

use gate_session::SessionError;
use gate_wire::WireError;
use thiserror::Error;

/// RPC errors
#[derive(Error, Debug)]
pub enum RpcError {
    /// The request could not be handed to the session
    #[error("send failed: {0}")]
    Send(#[from] SessionError),

    /// No response arrived before the call's deadline
    #[error("call timed out")]
    Timeout,

    /// The client was shut down
    #[error("rpc client closed")]
    Closed,

    /// The pending call was dropped without a response
    #[error("call canceled")]
    Canceled,

    /// Request or response body could not be (de)serialized
    #[error("body error: {0}")]
    Wire(#[from] WireError),
}
