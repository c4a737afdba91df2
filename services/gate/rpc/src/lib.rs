//! Correlated request/response calls over gate sessions.
//!
//! [`RpcClient`] stamps each request with a fresh sequence number, parks a
//! callback in a [`PendingTable`] keyed by that number and ordered by
//! deadline, and resolves it when [`RpcClient::dispatch`] sees the matching
//! response. Calls that outlive their TTL receive a synthetic error
//! response carrying [`RPC_TIMEOUT_CODE`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod pending;

pub use client::{
    is_timeout, Callback, MessageSender, RpcClient, RpcConfig, SetErrorCode, RPC_TIMEOUT_CODE,
};
pub use error::RpcError;
pub use pending::{PendingCall, PendingTable};
