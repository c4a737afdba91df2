//! Connection handle abstraction.

use crate::error::SessionError;
use crate::message::Message;
use crate::stream::{SessionFault, SessionState};
use async_trait::async_trait;
use gate_wire::{CipherHooks, NodeAddress};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Opaque application data attached to an endpoint
pub type UserData = Arc<dyn Any + Send + Sync>;

/// How `send_message` behaves when the outbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Wait for space or for the session to close
    Blocking,
    /// Fail immediately with [`SessionError::OutboundOverflow`]
    NonBlocking,
}

/// A connection that can carry [`Message`]s.
///
/// Implementations own their transport and run their own reader and writer
/// tasks once started. Setters take `&self` so a shared handle can be
/// configured after it has been registered.
#[async_trait]
pub trait Endpoint: Send + Sync + fmt::Debug {
    /// Address assigned to this endpoint
    fn node(&self) -> NodeAddress;

    /// Assign the endpoint's address
    fn set_node(&self, node: NodeAddress);

    /// Peer address as captured when the connection was accepted
    fn remote_addr(&self) -> &str;

    /// Attached application data
    fn user_data(&self) -> Option<UserData>;

    /// Attach application data
    fn set_user_data(&self, data: UserData);

    /// Install the encrypt/decrypt hook pair
    fn set_cipher(&self, hooks: CipherHooks);

    /// Replace the outbound queue with one of `capacity`; only valid before start
    fn set_send_queue(&self, capacity: usize) -> Result<(), SessionError>;

    /// Queue inbound messages are delivered to
    fn set_recv_queue(&self, tx: mpsc::Sender<Message>);

    /// Queue faults are reported on
    fn set_error_queue(&self, tx: mpsc::Sender<SessionFault>);

    /// Spawn the reader and writer. Cancelling `ctx` force-closes the endpoint.
    fn start(self: Arc<Self>, ctx: CancellationToken) -> Result<(), SessionError>;

    /// Queue `msg` for sending
    async fn send_message(&self, msg: Message, mode: SendMode) -> Result<(), SessionError>;

    /// Graceful close: stop reading, flush what is queued, release the socket
    async fn close(&self);

    /// Abrupt close; `reason` is reported on the error queue
    fn force_close(&self, reason: SessionError);

    /// Current lifecycle state
    fn state(&self) -> SessionState;
}
