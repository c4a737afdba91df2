//! Wire protocol framing, checksums, compression/encryption and node addressing for gate.
//!
//! This crate provides the low-level wire protocol: a fixed 16-byte header,
//! a CRC-32 checksum over header fields and body, and an ordered body
//! transform pipeline (compress then encrypt on the way out, decrypt then
//! decompress on the way in).
//!
//! ## Features
//!
//! - **Fixed Header**: 16 bytes, little-endian, 24-bit length
//! - **Zero-Copy Bodies**: Uses `Bytes`/`BytesMut` for decoded payloads
//! - **Compression**: zlib above a size threshold, kept only when smaller
//! - **Encryption Hooks**: pluggable [`Encryptor`]/[`Decryptor`] pair
//! - **Node Addressing**: one 64-bit space for backends and gateway sessions
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u24 length (LE)      | total frame length         |
//! +----------------------+----------------------------+
//! | u8 flags             | Compress/Encrypt/Ext/Err/Cache |
//! +----------------------+----------------------------+
//! | u32 checksum (LE)    | CRC-32(len word|seq|cmd|body) |
//! +----------------------+----------------------------+
//! | u32 seq (LE)         | request/response correlation |
//! +----------------------+----------------------------+
//! | u32 cmd (LE)         | command id                 |
//! +----------------------+----------------------------+
//! | body                 | length - 16 bytes          |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cipher;
pub mod codec;
pub mod error;
pub mod header;
pub mod node;

// Re-export main types
pub use cipher::{CipherHooks, Decryptor, Encryptor};
pub use codec::{Frame, FrameCodec};
pub use error::WireError;
pub use header::{
    Flags, FrameHeader, COMPRESS_THRESHOLD, HEADER_SIZE, MAX_CLIENT_UPSTREAM_SIZE,
    MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE,
};
pub use node::{NodeAddress, ParseNodeAddressError, MAX_SERVICE_TYPE};

#[cfg(feature = "crypto")]
pub use cipher::ChaChaCipher;
