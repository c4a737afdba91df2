//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Declared or produced frame length outside the accepted range
    #[error("size out of range: {len} (allowed {min}..={max})")]
    SizeOutOfRange {
        /// Offending length in bytes
        len: usize,
        /// Smallest accepted length
        min: usize,
        /// Largest accepted length
        max: usize,
    },

    /// Checksum carried in the header does not match the frame contents
    #[error("checksum mismatch: header {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        /// Value carried in the header
        expected: u32,
        /// Value computed over the received bytes
        actual: u32,
    },

    /// Encrypt flag set but no decryptor configured
    #[error("cannot decrypt: no decryptor configured")]
    CannotDecrypt,

    /// Decryptor rejected the payload
    #[error("decrypt failed: {0}")]
    Decrypt(String),

    /// Encryptor failed
    #[error("encrypt failed: {0}")]
    Encrypt(String),

    /// Compression failed
    #[error("compress failed: {0}")]
    Compress(#[source] std::io::Error),

    /// Decompression failed
    #[error("decompress failed: {0}")]
    Decompress(#[source] std::io::Error),

    /// Typed body could not be serialized
    #[error("body encode failed: {0}")]
    BodyEncode(String),

    /// Raw bytes could not be decoded into the requested body type
    #[error("body decode failed: {0}")]
    BodyDecode(String),

    /// Underlying reader or writer failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Build a [`WireError::SizeOutOfRange`] for `len` against `min..=max`
    pub fn size(len: usize, min: usize, max: usize) -> Self {
        WireError::SizeOutOfRange { len, min, max }
    }
}
