//! TCP session: one reader task, one writer task, one socket.
//!
//! Lifecycle is `Idle -> Running -> Closing -> Closed`. Both `close` and
//! `force_close` race on the same compare-and-swap; the winner performs the
//! teardown, the loser returns.
//!
//! A graceful close lets the writer drain for up to [`WRITER_GRACE`] before
//! aborting it. A forced close aborts any in-flight socket write at once, so
//! a peer that stops reading cannot pin the session in `Closing`.

use crate::endpoint::{Endpoint, SendMode, UserData};
use crate::error::SessionError;
use crate::message::{read_message, Message, MessagePool};
use crate::stream::{
    SessionFault, SessionState, SessionStats, StreamSessionBase, DEFAULT_SEND_QUEUE_SIZE,
};
use async_trait::async_trait;
use gate_wire::{
    CipherHooks, FrameCodec, NodeAddress, HEADER_SIZE, MAX_CLIENT_UPSTREAM_SIZE, MAX_PACKET_SIZE,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on the best-effort flush after the writer stops
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a graceful close waits for the writer before aborting it
pub const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Configuration for TCP sessions
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Outbound queue capacity
    pub send_queue_size: usize,
    /// Capacity for the receive queue the owner creates
    pub recv_queue_size: usize,
    /// Deadline for each frame read
    pub read_timeout: Duration,
    /// Trusted intranet peer: accept frames up to the packet limit
    pub intranet: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            recv_queue_size: 1024,
            read_timeout: Duration::from_secs(60),
            intranet: false,
        }
    }
}

/// [`Endpoint`] over a TCP stream
pub struct TcpSession {
    base: Arc<StreamSessionBase>,
    codec: FrameCodec,
    read_timeout: Duration,
    intranet: AtomicBool,
    stream: Mutex<Option<TcpStream>>,
    read_stop: CancellationToken,
    kill: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl TcpSession {
    /// Wrap `stream` with an outbound queue of `send_queue_size`
    pub fn new(stream: TcpStream, send_queue_size: usize) -> Arc<Self> {
        let config = SessionConfig {
            send_queue_size,
            ..SessionConfig::default()
        };
        Self::with_config(stream, &config, Arc::new(MessagePool::default()), FrameCodec::new())
    }

    /// Wrap `stream` using `config`, sharing `pool` and `codec` settings
    pub fn with_config(
        stream: TcpStream,
        config: &SessionConfig,
        pool: Arc<MessagePool>,
        codec: FrameCodec,
    ) -> Arc<Self> {
        let remote_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Arc::new(Self {
            base: Arc::new(StreamSessionBase::new(
                remote_addr,
                config.send_queue_size,
                pool,
            )),
            codec,
            read_timeout: config.read_timeout,
            intranet: AtomicBool::new(config.intranet),
            stream: Mutex::new(Some(stream)),
            read_stop: CancellationToken::new(),
            kill: CancellationToken::new(),
            writer: Mutex::new(None),
        })
    }

    /// Mark the peer as trusted (or not); takes effect from the next frame
    pub fn set_intranet(&self, intranet: bool) {
        self.intranet.store(intranet, Ordering::Relaxed);
    }

    /// Frame size limit applied to the next read
    pub fn max_frame_size(&self) -> usize {
        if self.intranet.load(Ordering::Relaxed) {
            MAX_PACKET_SIZE
        } else {
            HEADER_SIZE + MAX_CLIENT_UPSTREAM_SIZE
        }
    }

    /// Traffic counters
    pub fn stats(&self) -> SessionStats {
        self.base.stats()
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let base = Arc::clone(&self.base);
        let endpoint: Arc<dyn Endpoint> = self.clone();

        while base.is_running() {
            let max_size = self.max_frame_size();
            let decryptor = base.decryptor();
            let read = read_message(
                &self.codec,
                &mut reader,
                max_size,
                decryptor.as_deref(),
                base.pool(),
            );

            let result = tokio::select! {
                biased;
                _ = self.read_stop.cancelled() => break,
                res = tokio::time::timeout(self.read_timeout, read) => res,
            };

            let (mut msg, wire_len) = match result {
                Ok(Ok(read)) => read,
                Ok(Err(e)) => {
                    self.force_close(SessionError::from_read(e));
                    break;
                }
                Err(_) => {
                    self.force_close(SessionError::ReadTimeout(self.read_timeout));
                    break;
                }
            };

            base.record_in(wire_len);
            debug!(
                node = %base.node(),
                command = msg.command,
                seq = msg.seq,
                len = wire_len,
                "frame received"
            );
            msg.set_session(Arc::clone(&endpoint));
            msg.set_created_at(Instant::now());

            let Some(tx) = base.recv_sender() else {
                self.force_close(SessionError::SessionClosed);
                break;
            };
            tokio::select! {
                biased;
                _ = self.read_stop.cancelled() => break,
                res = tx.send(msg) => {
                    if res.is_err() {
                        debug!(node = %base.node(), "receive queue closed, reader exiting");
                        self.force_close(SessionError::SessionClosed);
                        break;
                    }
                }
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::Receiver<Message>,
    ) {
        let base = Arc::clone(&self.base);

        loop {
            let msg = tokio::select! {
                biased;
                _ = base.done().cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let written = tokio::select! {
                biased;
                _ = self.kill.cancelled() => return,
                res = self.write_message(&mut writer, msg) => res,
            };
            if let Err(e) = written {
                self.force_close(SessionError::Io(e));
                return;
            }
        }

        // Best-effort flush of whatever is still queued; anything left is lost
        let deadline = tokio::time::Instant::now() + FLUSH_TIMEOUT;
        let mut flushed = 0usize;
        while let Ok(msg) = rx.try_recv() {
            let written = tokio::select! {
                biased;
                _ = self.kill.cancelled() => return,
                res = tokio::time::timeout_at(deadline, self.write_message(&mut writer, msg)) => res,
            };
            match written {
                Ok(Ok(())) => flushed += 1,
                Ok(Err(e)) => {
                    debug!(node = %base.node(), error = %e, "flush aborted");
                    break;
                }
                Err(_) => {
                    warn!(node = %base.node(), "flush timed out, dropping queued messages");
                    break;
                }
            }
        }
        if flushed > 0 {
            debug!(node = %base.node(), flushed, "flushed queued messages");
        }

        tokio::select! {
            biased;
            _ = self.kill.cancelled() => {}
            _ = writer.shutdown() => {}
        }
    }

    async fn write_message(
        &self,
        writer: &mut OwnedWriteHalf,
        mut msg: Message,
    ) -> std::io::Result<()> {
        let encryptor = self.base.encryptor();
        let frame = match msg.encode_frame(&self.codec, encryptor.as_deref()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    node = %self.base.node(),
                    command = msg.command,
                    error = %e,
                    "dropping message that failed to encode"
                );
                self.base.pool().release(msg);
                return Ok(());
            }
        };
        writer.write_all(&frame).await?;
        self.base.record_out(frame.len());
        self.base.pool().release(msg);
        Ok(())
    }

    async fn teardown(&self) {
        self.base.done().cancel();

        let writer = self.writer.lock().take();
        if let Some(mut handle) = writer {
            match tokio::time::timeout(WRITER_GRACE, &mut handle).await {
                Ok(res) => log_writer_exit(self.base.node(), res),
                Err(_) => {
                    warn!(node = %self.base.node(), "writer still busy after {:?}, aborting", WRITER_GRACE);
                    self.kill.cancel();
                    log_writer_exit(self.base.node(), handle.await);
                }
            }
        }
        self.stream.lock().take();
        self.base.finish_close();
    }
}

fn log_writer_exit(node: NodeAddress, res: Result<(), JoinError>) {
    if let Err(e) = res {
        warn!(node = %node, error = %e, "writer task failed");
    }
}

#[async_trait]
impl Endpoint for TcpSession {
    fn node(&self) -> NodeAddress {
        self.base.node()
    }

    fn set_node(&self, node: NodeAddress) {
        self.base.set_node(node);
    }

    fn remote_addr(&self) -> &str {
        self.base.remote_addr()
    }

    fn user_data(&self) -> Option<UserData> {
        self.base.user_data()
    }

    fn set_user_data(&self, data: UserData) {
        self.base.set_user_data(data);
    }

    fn set_cipher(&self, hooks: CipherHooks) {
        self.base.set_cipher(hooks);
    }

    fn set_send_queue(&self, capacity: usize) -> Result<(), SessionError> {
        self.base.replace_send_queue(capacity)
    }

    fn set_recv_queue(&self, tx: mpsc::Sender<Message>) {
        self.base.set_recv_queue(tx);
    }

    fn set_error_queue(&self, tx: mpsc::Sender<SessionFault>) {
        self.base.set_error_queue(tx);
    }

    fn start(self: Arc<Self>, ctx: CancellationToken) -> Result<(), SessionError> {
        if self.base.recv_sender().is_none() {
            return Err(SessionError::MissingReceiveQueue);
        }
        self.base.begin_start()?;

        let stream = self.stream.lock().take().ok_or(SessionError::SessionClosed)?;
        let rx = self
            .base
            .take_send_rx()
            .ok_or(SessionError::SessionClosed)?;
        let (reader, writer) = stream.into_split();

        {
            // Held across the spawn so a writer that fails at once finds its handle
            let mut slot = self.writer.lock();
            *slot = Some(tokio::spawn(Arc::clone(&self).write_loop(writer, rx)));
        }
        tokio::spawn(Arc::clone(&self).read_loop(reader));

        let watcher = Arc::clone(&self);
        tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancelled() => watcher.force_close(SessionError::Cancelled),
                _ = watcher.base.done().cancelled() => {}
            }
        });

        info!(node = %self.base.node(), remote = %self.base.remote_addr(), "session started");
        Ok(())
    }

    async fn send_message(&self, msg: Message, mode: SendMode) -> Result<(), SessionError> {
        self.base.send_message(msg, mode).await
    }

    async fn close(&self) {
        if !self.base.begin_close() {
            self.base.wait_closed().await;
            return;
        }
        debug!(node = %self.base.node(), "closing session");
        self.read_stop.cancel();
        self.teardown().await;
    }

    fn force_close(&self, reason: SessionError) {
        if !self.base.begin_close() {
            return;
        }
        warn!(node = %self.base.node(), remote = %self.base.remote_addr(), reason = %reason, "force closing session");
        self.read_stop.cancel();
        self.kill.cancel();
        self.base.report_error(reason);
        self.base.done().cancel();

        let writer = self.writer.lock().take();
        self.stream.lock().take();
        let base = Arc::clone(&self.base);
        match (writer, tokio::runtime::Handle::try_current()) {
            (Some(handle), Ok(rt)) => {
                rt.spawn(async move {
                    log_writer_exit(base.node(), handle.await);
                    base.finish_close();
                });
            }
            _ => base.finish_close(),
        }
    }

    fn state(&self) -> SessionState {
        self.base.state()
    }
}

impl std::fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSession")
            .field("base", &self.base)
            .field("intranet", &self.intranet.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{connect_tcp, listen_tcp};
    use bytes::Bytes;
    use gate_wire::Flags;
    use tokio::io::AsyncReadExt;

    struct Pair {
        session: Arc<TcpSession>,
        peer: TcpStream,
        recv_rx: mpsc::Receiver<Message>,
        err_rx: mpsc::Receiver<SessionFault>,
    }

    async fn pair(config: SessionConfig) -> Pair {
        pair_with_codec(config, FrameCodec::new()).await
    }

    async fn pair_with_codec(config: SessionConfig, codec: FrameCodec) -> Pair {
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peer, accepted) = tokio::join!(connect_tcp(addr), listener.accept());

        let session = TcpSession::with_config(
            accepted.unwrap().0,
            &config,
            Arc::new(MessagePool::new(16)),
            codec,
        );
        session.set_node(NodeAddress::gateway_session(1, 42));

        let (recv_tx, recv_rx) = mpsc::channel(16);
        let (err_tx, err_rx) = mpsc::channel(4);
        session.set_recv_queue(recv_tx);
        session.set_error_queue(err_tx);

        Pair {
            session,
            peer: peer.unwrap(),
            recv_rx,
            err_rx,
        }
    }

    async fn write_frame(peer: &mut TcpStream, command: u32, seq: u32, body: &[u8]) {
        let frame = FrameCodec::new()
            .encode(seq, command, Flags::empty(), body, None)
            .unwrap();
        peer.write_all(&frame).await.unwrap();
    }

    async fn read_frame(peer: &mut TcpStream) -> gate_wire::Frame {
        FrameCodec::new()
            .read_frame(peer, MAX_PACKET_SIZE, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_inbound_is_tagged_and_echo_goes_out() {
        let mut p = pair(SessionConfig::default()).await;
        Arc::clone(&p.session).start(CancellationToken::new()).unwrap();
        assert_eq!(p.session.state(), SessionState::Running);

        write_frame(&mut p.peer, 9, 3, b"ping").await;
        let msg = p.recv_rx.recv().await.unwrap();
        assert_eq!(msg.command, 9);
        assert_eq!(msg.seq, 3);
        assert_eq!(msg.data().unwrap().as_ref(), b"ping");

        let owner = msg.session().unwrap();
        assert_eq!(owner.node(), NodeAddress::gateway_session(1, 42));

        let mut reply = Message::with_data(9, Bytes::from_static(b"pong"));
        reply.seq = msg.seq;
        owner.send_message(reply, SendMode::Blocking).await.unwrap();

        let frame = read_frame(&mut p.peer).await;
        assert_eq!(frame.seq, 3);
        assert_eq!(frame.body.as_ref(), b"pong");

        let stats = p.session.stats();
        assert_eq!(stats.frames_in, 1);
        assert_eq!(stats.bytes_in, (HEADER_SIZE + 4) as u64);
    }

    #[tokio::test]
    async fn test_start_requires_recv_queue_and_runs_once() {
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_peer, accepted) = tokio::join!(connect_tcp(addr), listener.accept());
        let session = TcpSession::new(accepted.unwrap().0, 8);

        let err = Arc::clone(&session)
            .start(CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SessionError::MissingReceiveQueue));

        let (tx, _rx) = mpsc::channel(1);
        session.set_recv_queue(tx);
        Arc::clone(&session).start(CancellationToken::new()).unwrap();
        let err = Arc::clone(&session)
            .start(CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyStarted));

        session.close().await;
    }

    #[tokio::test]
    async fn test_nonblocking_backpressure() {
        let config = SessionConfig {
            send_queue_size: 1,
            ..SessionConfig::default()
        };
        let p = pair(config).await;

        // Not started: nothing drains the queue
        p.session
            .send_message(Message::new(1), SendMode::NonBlocking)
            .await
            .unwrap();
        let err = p
            .session
            .send_message(Message::new(2), SendMode::NonBlocking)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::OutboundOverflow));
    }

    #[tokio::test]
    async fn test_concurrent_close_tears_down_once() {
        let mut p = pair(SessionConfig::default()).await;
        Arc::clone(&p.session).start(CancellationToken::new()).unwrap();

        let (a, b) = (Arc::clone(&p.session), Arc::clone(&p.session));
        tokio::join!(a.close(), b.close());

        assert_eq!(p.session.state(), SessionState::Closed);
        assert!(p.err_rx.try_recv().is_err());

        let err = p
            .session
            .send_message(Message::new(1), SendMode::NonBlocking)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionClosed));

        // Peer observes EOF
        let mut buf = [0u8; 1];
        assert_eq!(p.peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_double_force_close_reports_once() {
        let mut p = pair(SessionConfig::default()).await;
        Arc::clone(&p.session).start(CancellationToken::new()).unwrap();

        p.session.force_close(SessionError::PeerClosed);
        p.session.force_close(SessionError::Cancelled);
        p.session.close().await;

        let fault = p.err_rx.recv().await.unwrap();
        assert!(matches!(fault.reason, SessionError::PeerClosed));
        assert_eq!(fault.node, NodeAddress::gateway_session(1, 42));
        assert!(p.err_rx.try_recv().is_err());
        assert_eq!(p.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_close_reports_peer_closed() {
        let mut p = pair(SessionConfig::default()).await;
        Arc::clone(&p.session).start(CancellationToken::new()).unwrap();

        drop(p.peer);
        let fault = p.err_rx.recv().await.unwrap();
        assert!(matches!(fault.reason, SessionError::PeerClosed));
    }

    #[tokio::test]
    async fn test_corrupted_frame_forces_close() {
        let mut p = pair(SessionConfig::default()).await;
        Arc::clone(&p.session).start(CancellationToken::new()).unwrap();

        let mut frame = FrameCodec::new()
            .encode(1, 2, Flags::empty(), b"payload", None)
            .unwrap()
            .to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        p.peer.write_all(&frame).await.unwrap();

        let fault = p.err_rx.recv().await.unwrap();
        assert!(fault.reason.is_framing());
        assert!(matches!(
            fault.reason,
            SessionError::Wire(gate_wire::WireError::ChecksumMismatch { .. })
        ));
        assert!(p.recv_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_external_peer_size_limit() {
        let mut p = pair(SessionConfig::default()).await;
        Arc::clone(&p.session).start(CancellationToken::new()).unwrap();

        // Header only: declares a frame one byte over the external limit
        let oversized = (HEADER_SIZE + MAX_CLIENT_UPSTREAM_SIZE + 1) as u32;
        let mut header = oversized.to_le_bytes().to_vec();
        header.resize(HEADER_SIZE, 0);
        p.peer.write_all(&header).await.unwrap();

        let fault = p.err_rx.recv().await.unwrap();
        assert!(matches!(
            fault.reason,
            SessionError::Wire(gate_wire::WireError::SizeOutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_intranet_accepts_large_frames() {
        let mut p = pair(SessionConfig::default()).await;
        assert_eq!(p.session.max_frame_size(), HEADER_SIZE + MAX_CLIENT_UPSTREAM_SIZE);
        p.session.set_intranet(true);
        assert_eq!(p.session.max_frame_size(), MAX_PACKET_SIZE);
        Arc::clone(&p.session).start(CancellationToken::new()).unwrap();

        let body: Vec<u8> = (0..MAX_CLIENT_UPSTREAM_SIZE + 1024)
            .map(|i| (i * 7919 % 251) as u8)
            .collect();
        let frame = FrameCodec::new()
            .with_compress_threshold(usize::MAX)
            .encode(0, 5, Flags::empty(), &body, None)
            .unwrap();
        p.peer.write_all(&frame).await.unwrap();

        let msg = p.recv_rx.recv().await.unwrap();
        assert_eq!(msg.data().unwrap().len(), body.len());
    }

    /// XOR with a fixed byte; enough to prove the hooks run in both directions
    struct XorCipher(u8);

    impl gate_wire::Encryptor for XorCipher {
        fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, gate_wire::WireError> {
            Ok(plain.iter().map(|b| b ^ self.0).collect())
        }
    }

    impl gate_wire::Decryptor for XorCipher {
        fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, gate_wire::WireError> {
            Ok(cipher.iter().map(|b| b ^ self.0).collect())
        }
    }

    #[tokio::test]
    async fn test_cipher_hooks_apply_both_ways() {
        let mut p = pair(SessionConfig::default()).await;
        let cipher = Arc::new(XorCipher(0x5A));
        p.session.set_cipher(CipherHooks::symmetric(Arc::clone(&cipher)));
        Arc::clone(&p.session).start(CancellationToken::new()).unwrap();

        let codec = FrameCodec::new();
        let frame = codec
            .encode(1, 8, Flags::empty(), b"secret", Some(cipher.as_ref() as &dyn gate_wire::Encryptor))
            .unwrap();
        assert_eq!(frame[3] & Flags::ENCRYPT.bits(), Flags::ENCRYPT.bits());
        p.peer.write_all(&frame).await.unwrap();

        let msg = p.recv_rx.recv().await.unwrap();
        assert_eq!(msg.data().unwrap().as_ref(), b"secret");

        p.session
            .send_message(Message::with_data(8, Bytes::from_static(b"reply")), SendMode::NonBlocking)
            .await
            .unwrap();
        let reply = codec
            .read_frame(&mut p.peer, MAX_PACKET_SIZE, Some(cipher.as_ref() as &dyn gate_wire::Decryptor))
            .await
            .unwrap();
        assert_eq!(reply.body.as_ref(), b"reply");

        // Without a decryptor the peer cannot open the reply
        p.session
            .send_message(Message::with_data(8, Bytes::from_static(b"again")), SendMode::NonBlocking)
            .await
            .unwrap();
        let err = codec
            .read_frame(&mut p.peer, MAX_PACKET_SIZE, None)
            .await
            .unwrap_err();
        assert!(matches!(err, gate_wire::WireError::CannotDecrypt));
    }

    #[tokio::test]
    async fn test_graceful_close_flushes_queue() {
        let mut p = pair(SessionConfig::default()).await;
        for i in 0..3 {
            let mut msg = Message::with_data(7, Bytes::from(vec![i as u8]));
            msg.seq = i + 1;
            p.session
                .send_message(msg, SendMode::NonBlocking)
                .await
                .unwrap();
        }
        Arc::clone(&p.session).start(CancellationToken::new()).unwrap();
        p.session.close().await;

        let mut seqs = Vec::new();
        let codec = FrameCodec::new();
        while let Ok(frame) = codec.read_frame(&mut p.peer, MAX_PACKET_SIZE, None).await {
            seqs.push(frame.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancellation_force_closes() {
        let mut p = pair(SessionConfig::default()).await;
        let ctx = CancellationToken::new();
        Arc::clone(&p.session).start(ctx.clone()).unwrap();

        ctx.cancel();
        let fault = p.err_rx.recv().await.unwrap();
        assert!(matches!(fault.reason, SessionError::Cancelled));
    }

    /// Incompressible filler, large enough to fill socket buffers
    fn noisy_body(len: usize, salt: u64) -> Bytes {
        let mut state = 0x9E37_79B9_7F4A_7C15u64 ^ salt;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect::<Vec<u8>>()
            .into()
    }

    fn uncompressed() -> FrameCodec {
        FrameCodec::new().with_compress_threshold(usize::MAX)
    }

    async fn stall_writer(p: &Pair) {
        for i in 0..8u64 {
            p.session
                .send_message(
                    Message::with_data(1, noisy_body(4 << 20, i)),
                    SendMode::NonBlocking,
                )
                .await
                .unwrap();
        }
        Arc::clone(&p.session).start(CancellationToken::new()).unwrap();
        // Let the writer block on the socket
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_force_close_with_stalled_peer_finishes() {
        let config = SessionConfig {
            send_queue_size: 16,
            ..SessionConfig::default()
        };
        let mut p = pair_with_codec(config, uncompressed()).await;
        stall_writer(&p).await;

        p.session.force_close(SessionError::Cancelled);
        let closed = tokio::time::timeout(Duration::from_secs(5), p.session.close()).await;
        assert!(closed.is_ok());
        assert_eq!(p.session.state(), SessionState::Closed);

        let fault = p.err_rx.recv().await.unwrap();
        assert!(matches!(fault.reason, SessionError::Cancelled));
    }

    #[tokio::test]
    async fn test_graceful_close_with_stalled_peer_is_bounded() {
        let config = SessionConfig {
            send_queue_size: 16,
            ..SessionConfig::default()
        };
        let p = pair_with_codec(config, uncompressed()).await;
        stall_writer(&p).await;

        let closed = tokio::time::timeout(WRITER_GRACE * 3, p.session.close()).await;
        assert!(closed.is_ok());
        assert_eq!(p.session.state(), SessionState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_against_vanished_peer_reaches_closed() {
        let mut p = pair(SessionConfig::default()).await;
        for i in 0..4u32 {
            let mut msg = Message::with_data(2, Bytes::from_static(b"queued"));
            msg.seq = i + 1;
            p.session
                .send_message(msg, SendMode::NonBlocking)
                .await
                .unwrap();
        }
        drop(p.peer);
        Arc::clone(&p.session).start(CancellationToken::new()).unwrap();

        let fault = tokio::time::timeout(Duration::from_secs(5), p.err_rx.recv())
            .await
            .unwrap();
        assert!(fault.is_some());
        let closed = tokio::time::timeout(Duration::from_secs(5), p.session.close()).await;
        assert!(closed.is_ok());
        assert_eq!(p.session.state(), SessionState::Closed);
        assert!(p.session.writer.lock().is_none());
    }

    #[tokio::test]
    async fn test_dropped_recv_queue_closes_session() {
        let mut p = pair(SessionConfig::default()).await;
        drop(p.recv_rx);
        Arc::clone(&p.session).start(CancellationToken::new()).unwrap();

        write_frame(&mut p.peer, 9, 1, b"orphan").await;
        let fault = p.err_rx.recv().await.unwrap();
        assert!(matches!(fault.reason, SessionError::SessionClosed));

        p.session.close().await;
        assert_eq!(p.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let config = SessionConfig {
            read_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let mut p = pair(config).await;
        Arc::clone(&p.session).start(CancellationToken::new()).unwrap();

        let fault = p.err_rx.recv().await.unwrap();
        assert!(matches!(fault.reason, SessionError::ReadTimeout(_)));
    }
}
