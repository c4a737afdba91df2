//! State shared by every stream-oriented endpoint.
//!
//! Concrete transports embed a [`StreamSessionBase`] and drive its
//! lifecycle: `begin_start` once, `begin_close` to win the right to tear
//! down, `finish_close` when the loops are gone.

use crate::endpoint::{SendMode, UserData};
use crate::error::SessionError;
use crate::message::{Message, MessagePool};
use gate_wire::{CipherHooks, Decryptor, Encryptor, NodeAddress};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default outbound queue capacity
pub const DEFAULT_SEND_QUEUE_SIZE: usize = 256;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Constructed, not started
    Idle = 0,
    /// Reader and writer running
    Running = 1,
    /// Teardown in progress
    Closing = 2,
    /// Loops exited and socket released
    Closed = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionState::Idle,
            1 => SessionState::Running,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// A fault reported on a session's error queue
#[derive(Debug)]
pub struct SessionFault {
    /// Address of the failed session
    pub node: NodeAddress,
    /// Its peer address
    pub remote_addr: String,
    /// What went wrong
    pub reason: SessionError,
}

/// Snapshot of a session's traffic counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames read
    pub frames_in: u64,
    /// Frames written
    pub frames_out: u64,
    /// Bytes read, headers included
    pub bytes_in: u64,
    /// Bytes written, headers included
    pub bytes_out: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// Shared mutable state of a stream session
pub struct StreamSessionBase {
    state: AtomicU8,
    node: AtomicU64,
    remote_addr: String,
    user_data: RwLock<Option<UserData>>,
    cipher: RwLock<CipherHooks>,
    send_tx: RwLock<Option<mpsc::Sender<Message>>>,
    send_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    recv_tx: RwLock<Option<mpsc::Sender<Message>>>,
    error_tx: RwLock<Option<mpsc::Sender<SessionFault>>>,
    pool: Arc<MessagePool>,
    done: CancellationToken,
    closed: CancellationToken,
    counters: Counters,
}

impl StreamSessionBase {
    /// Create an idle base with an outbound queue of `send_queue_size`
    pub fn new(remote_addr: String, send_queue_size: usize, pool: Arc<MessagePool>) -> Self {
        let (send_tx, send_rx) = mpsc::channel(send_queue_size.max(1));
        Self {
            state: AtomicU8::new(SessionState::Idle as u8),
            node: AtomicU64::new(NodeAddress::NONE.raw()),
            remote_addr,
            user_data: RwLock::new(None),
            cipher: RwLock::new(CipherHooks::default()),
            send_tx: RwLock::new(Some(send_tx)),
            send_rx: Mutex::new(Some(send_rx)),
            recv_tx: RwLock::new(None),
            error_tx: RwLock::new(None),
            pool,
            done: CancellationToken::new(),
            closed: CancellationToken::new(),
            counters: Counters::default(),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the loops should keep going
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Move Idle to Running. Fails if the session was started or closed before.
    pub fn begin_start(&self) -> Result<(), SessionError> {
        match self.state.compare_exchange(
            SessionState::Idle as u8,
            SessionState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(raw) if raw == SessionState::Running as u8 => Err(SessionError::AlreadyStarted),
            Err(_) => Err(SessionError::SessionClosed),
        }
    }

    /// Move Idle or Running to Closing. Exactly one caller ever gets `true`.
    pub fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= SessionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Mark Closed and drop every queue and hook
    pub fn finish_close(&self) {
        self.send_tx.write().take();
        self.send_rx.lock().take();
        self.recv_tx.write().take();
        self.error_tx.write().take();
        *self.cipher.write() = CipherHooks::default();
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
        self.closed.cancel();
        debug!(node = %self.node(), remote = %self.remote_addr, "session closed");
    }

    /// Signal observed by the writer and blocked senders
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Wait until `finish_close` has run
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    /// Assigned address
    pub fn node(&self) -> NodeAddress {
        NodeAddress::from_raw(self.node.load(Ordering::Acquire))
    }

    /// Assign the address
    pub fn set_node(&self, node: NodeAddress) {
        self.node.store(node.raw(), Ordering::Release);
    }

    /// Cached peer address
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Attached application data
    pub fn user_data(&self) -> Option<UserData> {
        self.user_data.read().clone()
    }

    /// Attach application data
    pub fn set_user_data(&self, data: UserData) {
        *self.user_data.write() = Some(data);
    }

    /// Install the cipher hooks
    pub fn set_cipher(&self, hooks: CipherHooks) {
        *self.cipher.write() = hooks;
    }

    /// Current encryptor
    pub fn encryptor(&self) -> Option<Arc<dyn Encryptor>> {
        self.cipher.read().encryptor.clone()
    }

    /// Current decryptor
    pub fn decryptor(&self) -> Option<Arc<dyn Decryptor>> {
        self.cipher.read().decryptor.clone()
    }

    /// Replace the outbound queue. Only allowed while Idle.
    pub fn replace_send_queue(&self, capacity: usize) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Idle => {}
            SessionState::Running => return Err(SessionError::AlreadyStarted),
            _ => return Err(SessionError::SessionClosed),
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.send_tx.write() = Some(tx);
        *self.send_rx.lock() = Some(rx);
        Ok(())
    }

    /// Hand the outbound receiver to the writer
    pub fn take_send_rx(&self) -> Option<mpsc::Receiver<Message>> {
        self.send_rx.lock().take()
    }

    /// Install the receive queue
    pub fn set_recv_queue(&self, tx: mpsc::Sender<Message>) {
        *self.recv_tx.write() = Some(tx);
    }

    /// Receive queue sender, if one is installed
    pub fn recv_sender(&self) -> Option<mpsc::Sender<Message>> {
        self.recv_tx.read().clone()
    }

    /// Install the error queue
    pub fn set_error_queue(&self, tx: mpsc::Sender<SessionFault>) {
        *self.error_tx.write() = Some(tx);
    }

    /// Message pool shared with the reader
    pub fn pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }

    /// Queue `msg` on the outbound queue
    pub async fn send_message(&self, msg: Message, mode: SendMode) -> Result<(), SessionError> {
        if matches!(self.state(), SessionState::Closing | SessionState::Closed) {
            return Err(SessionError::SessionClosed);
        }
        let tx = self
            .send_tx
            .read()
            .clone()
            .ok_or(SessionError::SessionClosed)?;

        match mode {
            SendMode::NonBlocking => tx.try_send(msg).map_err(|e| match e {
                TrySendError::Full(_) => SessionError::OutboundOverflow,
                TrySendError::Closed(_) => SessionError::SessionClosed,
            }),
            SendMode::Blocking => tokio::select! {
                biased;
                _ = self.done.cancelled() => Err(SessionError::SessionClosed),
                res = tx.send(msg) => res.map_err(|_| SessionError::SessionClosed),
            },
        }
    }

    /// Report a fault without blocking; dropped if the queue is full or absent
    pub fn report_error(&self, reason: SessionError) {
        let fault = SessionFault {
            node: self.node(),
            remote_addr: self.remote_addr.clone(),
            reason,
        };
        let tx = self.error_tx.read().clone();
        match tx {
            Some(tx) => {
                if let Err(e) = tx.try_send(fault) {
                    let fault = match e {
                        TrySendError::Full(f) | TrySendError::Closed(f) => f,
                    };
                    warn!(node = %fault.node, reason = %fault.reason, "error queue unavailable, fault dropped");
                }
            }
            None => {
                warn!(node = %fault.node, remote = %fault.remote_addr, reason = %fault.reason, "session fault");
            }
        }
    }

    /// Count an inbound frame
    pub fn record_in(&self, wire_len: usize) {
        self.counters.frames_in.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_in
            .fetch_add(wire_len as u64, Ordering::Relaxed);
    }

    /// Count an outbound frame
    pub fn record_out(&self, wire_len: usize) {
        self.counters.frames_out.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_out
            .fetch_add(wire_len as u64, Ordering::Relaxed);
    }

    /// Counter snapshot
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            frames_in: self.counters.frames_in.load(Ordering::Relaxed),
            frames_out: self.counters.frames_out.load(Ordering::Relaxed),
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for StreamSessionBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSessionBase")
            .field("node", &self.node())
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn base(capacity: usize) -> StreamSessionBase {
        StreamSessionBase::new("127.0.0.1:4000".into(), capacity, Arc::new(MessagePool::new(8)))
    }

    #[test]
    fn test_lifecycle_transitions() {
        let base = base(4);
        assert_eq!(base.state(), SessionState::Idle);

        base.begin_start().unwrap();
        assert!(base.is_running());
        assert!(matches!(base.begin_start(), Err(SessionError::AlreadyStarted)));

        assert!(base.begin_close());
        assert!(!base.begin_close());
        assert_eq!(base.state(), SessionState::Closing);

        base.finish_close();
        assert_eq!(base.state(), SessionState::Closed);
        assert!(matches!(base.begin_start(), Err(SessionError::SessionClosed)));
        assert!(base.recv_sender().is_none());
    }

    #[test]
    fn test_close_from_idle() {
        let base = base(4);
        assert!(base.begin_close());
        assert!(matches!(
            base.replace_send_queue(8),
            Err(SessionError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_nonblocking_overflow() {
        let base = base(1);
        base.begin_start().unwrap();

        base.send_message(Message::new(1), SendMode::NonBlocking)
            .await
            .unwrap();
        let err = base
            .send_message(Message::new(2), SendMode::NonBlocking)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::OutboundOverflow));

        let mut rx = base.take_send_rx().unwrap();
        assert_eq!(rx.recv().await.unwrap().command, 1);
    }

    #[tokio::test]
    async fn test_blocking_send_unblocks_on_done() {
        let base = Arc::new(base(1));
        base.begin_start().unwrap();
        base.send_message(Message::new(1), SendMode::Blocking)
            .await
            .unwrap();

        let sender = {
            let base = Arc::clone(&base);
            tokio::spawn(async move { base.send_message(Message::new(2), SendMode::Blocking).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sender.is_finished());

        base.done().cancel();
        let res = sender.await.unwrap();
        assert!(matches!(res, Err(SessionError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_send_after_close_rejected() {
        let base = base(4);
        base.begin_close();
        let err = base
            .send_message(Message::new(1), SendMode::NonBlocking)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionClosed));
    }

    #[tokio::test]
    async fn test_report_error_is_nonblocking() {
        let base = base(4);
        base.set_node(NodeAddress::gateway_session(1, 7));
        let (tx, mut rx) = mpsc::channel(1);
        base.set_error_queue(tx);

        base.report_error(SessionError::PeerClosed);
        // Queue full: second report is dropped, not awaited
        base.report_error(SessionError::Cancelled);

        let fault = rx.recv().await.unwrap();
        assert_eq!(fault.node, NodeAddress::gateway_session(1, 7));
        assert_eq!(fault.remote_addr, "127.0.0.1:4000");
        assert!(matches!(fault.reason, SessionError::PeerClosed));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_replace_send_queue_only_when_idle() {
        let base = base(1);
        base.replace_send_queue(16).unwrap();
        base.begin_start().unwrap();
        assert!(matches!(
            base.replace_send_queue(2),
            Err(SessionError::AlreadyStarted)
        ));
    }
}
