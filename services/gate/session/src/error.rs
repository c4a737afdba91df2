//! Session error types.

use gate_wire::WireError;
use std::time::Duration;
use thiserror::Error;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Framing failure while reading or writing
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Outbound queue full under a non-blocking send
    #[error("outbound queue overflow")]
    OutboundOverflow,

    /// Session is closing or closed
    #[error("session closed")]
    SessionClosed,

    /// `start` called on a session that already left the idle state
    #[error("session already started")]
    AlreadyStarted,

    /// `start` called before a receive queue was installed
    #[error("receive queue not configured")]
    MissingReceiveQueue,

    /// No frame arrived within the read deadline
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The context passed to `start` was cancelled
    #[error("session cancelled")]
    Cancelled,

    /// Peer closed the connection
    #[error("peer closed the connection")]
    PeerClosed,
}

impl SessionError {
    /// Classify an error raised by the reader loop
    pub fn from_read(err: WireError) -> Self {
        match err {
            WireError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                SessionError::PeerClosed
            }
            WireError::Io(e) => SessionError::Io(e),
            other => SessionError::Wire(other),
        }
    }

    /// Whether the error is a framing error (size, checksum, undecryptable)
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            SessionError::Wire(
                WireError::SizeOutOfRange { .. }
                    | WireError::ChecksumMismatch { .. }
                    | WireError::CannotDecrypt
                    | WireError::Decrypt(_)
            )
        )
    }
}
