//! Request/response correlation over any message sender.

use crate::error::RpcError;
use crate::pending::PendingTable;
use async_trait::async_trait;
use gate_session::{Endpoint, Message, SendMode, SessionError};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Error code carried by the synthetic response delivered on timeout
pub const RPC_TIMEOUT_CODE: u32 = 0xFFFF_FFF0;

/// Completion callback for a call
pub type Callback = Box<dyn FnOnce(Message) + Send + 'static>;

/// Anything that can put a message on the wire
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send `msg`
    async fn send(&self, msg: Message) -> Result<(), SessionError>;
}

#[async_trait]
impl<E> MessageSender for E
where
    E: Endpoint + ?Sized,
{
    async fn send(&self, msg: Message) -> Result<(), SessionError> {
        self.send_message(msg, SendMode::Blocking).await
    }
}

/// Response types that can absorb an error code instead of a body
pub trait SetErrorCode {
    /// Record `code` on the response
    fn set_error_code(&mut self, code: u32);
}

/// RPC client settings
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// How long a call may stay pending
    pub ttl: Duration,
    /// How often expired calls are swept
    pub sweep_interval: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

struct Table {
    calls: PendingTable<Callback>,
    next_seq: u32,
    closed: bool,
}

impl Table {
    // Monotonic, never 0, never a sequence number still pending
    fn next_seq(&mut self) -> u32 {
        loop {
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            if seq != 0 && !self.calls.contains(seq) {
                return seq;
            }
        }
    }
}

struct Shared {
    table: Mutex<Table>,
}

impl Shared {
    fn sweep_expired(&self, now: Instant) -> usize {
        let expired = self.table.lock().calls.pop_expired(now);
        let count = expired.len();
        for call in expired {
            debug!(seq = call.seq, command = call.command, "rpc call timed out");
            (call.payload)(timeout_response(call.command, call.seq));
        }
        count
    }
}

fn timeout_response(command: u32, seq: u32) -> Message {
    Message::error_reply(command, seq, RPC_TIMEOUT_CODE)
}

/// Whether `msg` is the synthetic timeout response
pub fn is_timeout(msg: &Message) -> bool {
    msg.error_code() == Some(RPC_TIMEOUT_CODE)
}

/// Correlates requests with responses by sequence number.
///
/// Responses must be fed back through [`RpcClient::dispatch`]. A background
/// task sweeps expired calls every `sweep_interval` until [`shutdown`] or
/// drop.
///
/// [`shutdown`]: RpcClient::shutdown
pub struct RpcClient<S: ?Sized> {
    sender: Arc<S>,
    shared: Arc<Shared>,
    config: RpcConfig,
    stop: CancellationToken,
}

impl<S> RpcClient<S>
where
    S: MessageSender + ?Sized + 'static,
{
    /// Create a client sending through `sender`. Must run inside a tokio runtime.
    pub fn new(sender: Arc<S>, config: RpcConfig) -> Self {
        let shared = Arc::new(Shared {
            table: Mutex::new(Table {
                calls: PendingTable::new(),
                next_seq: 1,
                closed: false,
            }),
        });
        let stop = CancellationToken::new();

        let sweeper = Arc::clone(&shared);
        let sweeper_stop = stop.clone();
        let interval = config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = sweeper_stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = sweeper.sweep_expired(Instant::now());
                        if expired > 0 {
                            trace!(expired, "rpc sweep");
                        }
                    }
                }
            }
        });

        Self {
            sender,
            shared,
            config,
            stop,
        }
    }

    /// Send `request` and register `callback` for its response.
    ///
    /// Returns the sequence number assigned to the call. If the send fails
    /// while the call is still pending, the call is withdrawn, `callback` is
    /// never invoked and the send error is returned. If the call already
    /// timed out while the send was blocked, `callback` has received the
    /// timeout response and `Ok(seq)` is returned.
    pub async fn async_call<F>(&self, mut request: Message, callback: F) -> Result<u32, RpcError>
    where
        F: FnOnce(Message) + Send + 'static,
    {
        let deadline = Instant::now() + self.config.ttl;
        let seq = {
            let mut table = self.shared.table.lock();
            if table.closed {
                return Err(RpcError::Closed);
            }
            let seq = table.next_seq();
            table
                .calls
                .insert(seq, request.command, deadline, Box::new(callback));
            seq
        };

        request.seq = seq;
        let command = request.command;
        if let Err(e) = self.sender.send(request).await {
            if self.shared.table.lock().calls.remove(seq).is_none() {
                debug!(seq, command, error = %e, "rpc send failed after timeout was delivered");
                return Ok(seq);
            }
            debug!(seq, command, error = %e, "rpc send failed");
            return Err(RpcError::Send(e));
        }
        trace!(seq, command, "rpc call sent");
        Ok(seq)
    }

    /// Route a response to its pending call.
    ///
    /// Returns `Ok(false)` when no call is waiting on the response's
    /// sequence number.
    pub fn dispatch(&self, response: Message) -> Result<bool, RpcError> {
        let call = {
            let mut table = self.shared.table.lock();
            if table.closed {
                return Err(RpcError::Closed);
            }
            table.calls.remove(response.seq)
        };
        match call {
            Some(call) => {
                (call.payload)(response);
                Ok(true)
            }
            None => {
                debug!(seq = response.seq, command = response.command, "no pending call for response");
                Ok(false)
            }
        }
    }

    /// Time out every call whose deadline is at or before `now`.
    /// Returns how many were expired.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        self.shared.sweep_expired(now)
    }

    /// Send `request` and wait for the response
    pub async fn call(&self, request: Message) -> Result<Message, RpcError> {
        let response = self.call_raw(request).await?;
        if is_timeout(&response) {
            return Err(RpcError::Timeout);
        }
        Ok(response)
    }

    /// CBOR request/response call.
    ///
    /// Error replies, including timeouts, yield `Resp::default()` with the
    /// error code applied.
    pub async fn call_typed<Req, Resp>(&self, command: u32, request: Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + fmt::Debug + Send + Sync + 'static,
        Resp: DeserializeOwned + Default + SetErrorCode,
    {
        let response = self.call_raw(Message::cbor(command, request)).await?;
        if response.is_error() {
            let mut resp = Resp::default();
            resp.set_error_code(response.error_code().unwrap_or_default());
            return Ok(resp);
        }
        Ok(response.decode_body()?)
    }

    async fn call_raw(&self, request: Message) -> Result<Message, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.async_call(request, move |response| {
            let _ = tx.send(response);
        })
        .await?;
        rx.await.map_err(|_| RpcError::Canceled)
    }

    /// Number of calls awaiting a response
    pub fn pending(&self) -> usize {
        self.shared.table.lock().calls.len()
    }

    /// Stop the sweeper and drop every pending call without invoking it.
    /// Later calls and dispatches fail with [`RpcError::Closed`].
    pub fn shutdown(&self) {
        self.stop.cancel();
        let dropped = {
            let mut table = self.shared.table.lock();
            table.closed = true;
            table.calls.drain()
        };
        info!(dropped = dropped.len(), "rpc client shut down");
    }
}

impl<S: ?Sized> Drop for RpcClient<S> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl<S: ?Sized> fmt::Debug for RpcClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("config", &self.config)
            .field("pending", &self.shared.table.lock().calls.len())
            .finish()
    }
}
