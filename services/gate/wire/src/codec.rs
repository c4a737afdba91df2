//! Frame encoding and decoding.
//!
//! Encoding runs the body through compress-then-encrypt, stamps the header
//! and checksum, and emits one contiguous buffer. Decoding validates the
//! declared length before touching the body, verifies the checksum over the
//! bytes exactly as received, then runs decrypt-then-decompress.

use crate::cipher::{Decryptor, Encryptor};
use crate::header::{
    Flags, FrameHeader, COMPRESS_THRESHOLD, HEADER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE,
};
use crate::WireError;
use bytes::{Buf, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// A decoded frame with its body restored to plain bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Header flags with the transform bits (Compress, Encrypt) cleared
    pub flags: Flags,
    /// Sequence number
    pub seq: u32,
    /// Command id
    pub command: u32,
    /// Plain body
    pub body: Bytes,
    /// Size of the frame on the wire, header included
    pub wire_len: usize,
}

/// Frame codec carrying the compression policy
#[derive(Debug, Clone)]
pub struct FrameCodec {
    compress_threshold: usize,
    compression: Compression,
}

impl FrameCodec {
    /// Create a codec with the default compression threshold
    pub fn new() -> Self {
        Self {
            compress_threshold: COMPRESS_THRESHOLD,
            compression: Compression::default(),
        }
    }

    /// Compress bodies longer than `threshold` bytes (`usize::MAX` disables compression)
    pub fn with_compress_threshold(mut self, threshold: usize) -> Self {
        self.compress_threshold = threshold;
        self
    }

    /// Set the zlib level (0-9)
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression = Compression::new(level.min(9));
        self
    }

    /// Current compression threshold
    pub fn compress_threshold(&self) -> usize {
        self.compress_threshold
    }

    /// Encode one frame.
    ///
    /// `flags` may carry Extended/Error/Cache; the transform bits are set by
    /// the codec according to what it actually applied.
    pub fn encode(
        &self,
        seq: u32,
        command: u32,
        flags: Flags,
        body: &[u8],
        encryptor: Option<&dyn Encryptor>,
    ) -> Result<Bytes, WireError> {
        if body.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::size(body.len(), 0, MAX_PAYLOAD_SIZE));
        }

        let mut flags = flags - Flags::TRANSFORMS;
        let mut payload: Option<Vec<u8>> = None;

        if body.len() > self.compress_threshold {
            let compressed = self.compress(body)?;
            if compressed.len() < body.len() {
                trace!(from = body.len(), to = compressed.len(), "compressed frame body");
                flags |= Flags::COMPRESS;
                payload = Some(compressed);
            }
        }

        if let Some(encryptor) = encryptor {
            let plain = payload.as_deref().unwrap_or(body);
            payload = Some(encryptor.encrypt(plain)?);
            flags |= Flags::ENCRYPT;
        }

        let payload = payload.as_deref().unwrap_or(body);
        let length = HEADER_SIZE + payload.len();
        if length > MAX_PACKET_SIZE {
            return Err(WireError::size(length, HEADER_SIZE, MAX_PACKET_SIZE));
        }

        let mut header = FrameHeader {
            length: length as u32,
            flags,
            checksum: 0,
            seq,
            command,
        };
        header.checksum = header.compute_checksum(payload);

        let mut buf = BytesMut::with_capacity(length);
        header.encode(&mut buf);
        buf.extend_from_slice(payload);
        Ok(buf.freeze())
    }

    /// Read exactly one frame from `reader`.
    ///
    /// `max_size` bounds the whole frame, header included.
    pub async fn read_frame<R>(
        &self,
        reader: &mut R,
        max_size: usize,
        decryptor: Option<&dyn Decryptor>,
    ) -> Result<Frame, WireError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut raw = [0u8; HEADER_SIZE];
        reader.read_exact(&mut raw).await?;
        let header = FrameHeader::decode(&raw);
        check_length(&header, max_size)?;

        let mut body = vec![0u8; header.body_len()];
        reader.read_exact(&mut body).await?;

        self.open(header, body, decryptor)
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. The length check runs
    /// as soon as the header is available, so an oversized frame fails
    /// without waiting for its body.
    pub fn decode(
        &self,
        buf: &mut BytesMut,
        max_size: usize,
        decryptor: Option<&dyn Decryptor>,
    ) -> Result<Option<Frame>, WireError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let raw: [u8; HEADER_SIZE] = buf[..HEADER_SIZE]
            .try_into()
            .map_err(|_| WireError::size(buf.len(), HEADER_SIZE, max_size))?;
        let header = FrameHeader::decode(&raw);
        check_length(&header, max_size)?;

        if buf.len() < header.length as usize {
            return Ok(None);
        }

        buf.advance(HEADER_SIZE);
        let body = buf.split_to(header.body_len()).to_vec();

        self.open(header, body, decryptor).map(Some)
    }

    fn open(
        &self,
        header: FrameHeader,
        body: Vec<u8>,
        decryptor: Option<&dyn Decryptor>,
    ) -> Result<Frame, WireError> {
        let actual = header.compute_checksum(&body);
        if actual != header.checksum {
            return Err(WireError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }

        let mut body = body;
        if header.flags.contains(Flags::ENCRYPT) {
            let decryptor = decryptor.ok_or(WireError::CannotDecrypt)?;
            body = decryptor.decrypt(&body)?;
        }
        if header.flags.contains(Flags::COMPRESS) {
            body = decompress(&body, MAX_PAYLOAD_SIZE)?;
        }

        Ok(Frame {
            flags: header.flags - Flags::TRANSFORMS,
            seq: header.seq,
            command: header.command,
            body: Bytes::from(body),
            wire_len: header.length as usize,
        })
    }

    fn compress(&self, body: &[u8]) -> Result<Vec<u8>, WireError> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(body.len() / 2), self.compression);
        encoder.write_all(body).map_err(WireError::Compress)?;
        encoder.finish().map_err(WireError::Compress)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn check_length(header: &FrameHeader, max_size: usize) -> Result<(), WireError> {
    let max = max_size.min(MAX_PACKET_SIZE);
    let len = header.length as usize;
    if len < HEADER_SIZE || len > max {
        return Err(WireError::size(len, HEADER_SIZE, max));
    }
    Ok(())
}

fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(limit));
    ZlibDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(WireError::Decompress)?;
    if out.len() > limit {
        return Err(WireError::size(out.len(), 0, limit));
    }
    Ok(out)
}
