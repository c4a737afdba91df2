//! Application messages and their reuse pool.
//!
//! A [`Message`] carries its payload either as wire bytes (`data`), as a
//! typed [`Body`], or both. Encoding materializes `data` from the body the
//! first time it is needed and never again.

use crate::endpoint::Endpoint;
use bytes::Bytes;
use gate_wire::{Decryptor, Encryptor, Flags, Frame, FrameCodec, WireError};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncRead;

/// Default number of idle messages a pool keeps
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Typed message body that knows how to serialize itself
pub trait Body: Any + Send + Sync + fmt::Debug {
    /// Serialize to wire bytes
    fn encode_body(&self) -> Result<Bytes, WireError>;

    /// Downcast support
    fn as_any(&self) -> &dyn Any;
}

/// Body serialized as CBOR
#[derive(Debug, Clone, PartialEq)]
pub struct CborBody<T>(pub T);

impl<T> Body for CborBody<T>
where
    T: Serialize + fmt::Debug + Send + Sync + 'static,
{
    fn encode_body(&self) -> Result<Bytes, WireError> {
        let mut buf = Vec::new();
        ciborium::into_writer(&self.0, &mut buf)
            .map_err(|e| WireError::BodyEncode(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Unit of application data exchanged over a session
pub struct Message {
    created_at: Instant,
    /// Command id
    pub command: u32,
    /// Sequence number (0 when uncorrelated)
    pub seq: u32,
    /// Non-transform flags (Extended, Error, Cache)
    pub flags: Flags,
    data: Option<Bytes>,
    body: Option<Box<dyn Body>>,
    session: Option<Arc<dyn Endpoint>>,
}

impl Message {
    /// Empty message for `command`
    pub fn new(command: u32) -> Self {
        Self {
            created_at: Instant::now(),
            command,
            seq: 0,
            flags: Flags::empty(),
            data: None,
            body: None,
            session: None,
        }
    }

    /// Message carrying raw wire bytes
    pub fn with_data(command: u32, data: impl Into<Bytes>) -> Self {
        let mut msg = Self::new(command);
        msg.data = Some(data.into());
        msg
    }

    /// Message carrying a typed body, encoded lazily
    pub fn with_body<B: Body>(command: u32, body: B) -> Self {
        let mut msg = Self::new(command);
        msg.body = Some(Box::new(body));
        msg
    }

    /// Message carrying `value` serialized as CBOR
    pub fn cbor<T>(command: u32, value: T) -> Self
    where
        T: Serialize + fmt::Debug + Send + Sync + 'static,
    {
        Self::with_body(command, CborBody(value))
    }

    /// Error reply for `command`/`seq` carrying `code`
    pub fn error_reply(command: u32, seq: u32, code: u32) -> Self {
        let mut msg = Self::with_data(command, Bytes::copy_from_slice(&code.to_le_bytes()));
        msg.seq = seq;
        msg.flags = Flags::ERROR;
        msg
    }

    /// Error code of an error reply
    pub fn error_code(&self) -> Option<u32> {
        if !self.flags.contains(Flags::ERROR) {
            return None;
        }
        let data = self.data.as_ref()?;
        let raw: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(raw))
    }

    /// Whether this is an error reply
    pub fn is_error(&self) -> bool {
        self.flags.contains(Flags::ERROR)
    }

    /// When the message was built, or when it was read off the socket
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Override the timestamp
    pub fn set_created_at(&mut self, at: Instant) {
        self.created_at = at;
    }

    /// Wire bytes, if materialized
    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    /// Replace the wire bytes
    pub fn set_data(&mut self, data: impl Into<Bytes>) {
        self.data = Some(data.into());
    }

    /// Typed body, if any
    pub fn body(&self) -> Option<&dyn Body> {
        self.body.as_deref()
    }

    /// Typed body downcast to `B`
    pub fn body_as<B: Body>(&self) -> Option<&B> {
        self.body.as_deref()?.as_any().downcast_ref::<B>()
    }

    /// Replace the typed body; clears stale wire bytes
    pub fn set_body<B: Body>(&mut self, body: B) {
        self.body = Some(Box::new(body));
        self.data = None;
    }

    /// Session the message arrived on
    pub fn session(&self) -> Option<&Arc<dyn Endpoint>> {
        self.session.as_ref()
    }

    /// Tag the message with its owning session
    pub fn set_session(&mut self, session: Arc<dyn Endpoint>) {
        self.session = Some(session);
    }

    /// Materialize wire bytes from the body. No-op once `data` is set.
    pub fn encode(&mut self) -> Result<&Bytes, WireError> {
        if self.data.is_none() {
            let data = match &self.body {
                Some(body) => body.encode_body()?,
                None => Bytes::new(),
            };
            self.data = Some(data);
        }
        Ok(self.data.get_or_insert_with(Bytes::new))
    }

    /// Decode the wire bytes as CBOR into `T`
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        let data = self.data.as_deref().unwrap_or_default();
        ciborium::from_reader(data).map_err(|e| WireError::BodyDecode(e.to_string()))
    }

    /// Encode into one wire frame
    pub fn encode_frame(
        &mut self,
        codec: &FrameCodec,
        encryptor: Option<&dyn Encryptor>,
    ) -> Result<Bytes, WireError> {
        let (seq, command, flags) = (self.seq, self.command, self.flags);
        let data = self.encode()?;
        codec.encode(seq, command, flags, data, encryptor)
    }

    /// Fill from a decoded frame
    pub fn fill_from_frame(&mut self, frame: Frame) {
        self.command = frame.command;
        self.seq = frame.seq;
        self.flags = frame.flags;
        self.data = Some(frame.body);
        self.body = None;
    }

    /// Clear every field
    pub fn reset(&mut self) {
        self.created_at = Instant::now();
        self.command = 0;
        self.seq = 0;
        self.flags = Flags::empty();
        self.data = None;
        self.body = None;
        self.session = None;
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("command", &self.command)
            .field("seq", &self.seq)
            .field("flags", &self.flags)
            .field("data_len", &self.data.as_ref().map(Bytes::len))
            .field("body", &self.body)
            .field("session", &self.session.as_ref().map(|s| s.node()))
            .finish()
    }
}

/// Read and decode one frame from `reader` into a pooled message.
///
/// Returns the message together with the frame's size on the wire.
pub async fn read_message<R>(
    codec: &FrameCodec,
    reader: &mut R,
    max_size: usize,
    decryptor: Option<&dyn Decryptor>,
    pool: &MessagePool,
) -> Result<(Message, usize), WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let frame = codec.read_frame(reader, max_size, decryptor).await?;
    let wire_len = frame.wire_len;
    let mut msg = pool.allocate();
    msg.fill_from_frame(frame);
    Ok((msg, wire_len))
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Allocations served from the free list
    pub hits: u64,
    /// Allocations that built a fresh message
    pub misses: u64,
    /// Messages currently idle in the pool
    pub idle: usize,
}

/// Free list of reusable messages.
///
/// `release` takes the message by value, so a released message cannot be
/// touched by its former owner.
pub struct MessagePool {
    free: Mutex<Vec<Message>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MessagePool {
    /// Pool keeping at most `capacity` idle messages
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Take a cleared message
    pub fn allocate(&self) -> Message {
        match self.free.lock().pop() {
            Some(mut msg) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                msg.created_at = Instant::now();
                msg
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Message::new(0)
            }
        }
    }

    /// Reset `msg` and keep it for reuse
    pub fn release(&self, mut msg: Message) {
        msg.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(msg);
        }
    }

    /// Current counters
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            idle: self.free.lock().len(),
        }
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl fmt::Debug for MessagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePool")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}
