//! Fixed frame header for the wire protocol.
//!
//! Every frame starts with a 16-byte little-endian header:
//!
//! ```text
//! offset 0   length:u24     total frame length including this header
//! offset 3   flags:u8       Compress | Encrypt | Extended | Error | Cache
//! offset 4   checksum:u32   CRC-32 over (length word | seq | cmd | body)
//! offset 8   seq:u32
//! offset 12  cmd:u32
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Largest frame the 24-bit length field can describe
pub const MAX_PACKET_SIZE: usize = 0x00FF_FFFF;

/// Largest body a frame can carry
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Upstream cap applied to connections from outside the intranet (256 KiB)
pub const MAX_CLIENT_UPSTREAM_SIZE: usize = 256 * 1024;

/// Bodies longer than this are candidates for compression
pub const COMPRESS_THRESHOLD: usize = 4096;

bitflags! {
    /// Frame flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Flags: u8 {
        /// Body is zlib-compressed
        const COMPRESS = 1 << 0;
        /// Body is encrypted with the session cipher
        const ENCRYPT = 1 << 1;
        /// Body carries an extended header section
        const EXTENDED = 1 << 3;
        /// Body is an error reply
        const ERROR = 1 << 4;
        /// Receiver may cache the body
        const CACHE = 1 << 5;
    }
}

impl Flags {
    /// Flags describing a body transform, cleared before a message is re-encoded
    pub const TRANSFORMS: Flags = Flags::COMPRESS.union(Flags::ENCRYPT);
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Total frame length, header included
    pub length: u32,
    /// Frame flags
    pub flags: Flags,
    /// CRC-32 over the length word, seq, cmd and body
    pub checksum: u32,
    /// Sequence number
    pub seq: u32,
    /// Command id
    pub command: u32,
}

impl FrameHeader {
    /// First header word: 24-bit length in the low bytes, flags in the high byte
    pub fn length_word(&self) -> [u8; 4] {
        let word = (self.length & 0x00FF_FFFF) | ((self.flags.bits() as u32) << 24);
        word.to_le_bytes()
    }

    /// Body length implied by the header
    pub fn body_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_SIZE)
    }

    /// Encode the header into `buf` (little-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_uint_le((self.length & 0x00FF_FFFF) as u64, 3);
        buf.put_u8(self.flags.bits());
        buf.put_u32_le(self.checksum);
        buf.put_u32_le(self.seq);
        buf.put_u32_le(self.command);
    }

    /// Decode a header from exactly [`HEADER_SIZE`] bytes
    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Self {
        let mut buf = &raw[..];
        let length = buf.get_uint_le(3) as u32;
        let flags = Flags::from_bits_retain(buf.get_u8());
        let checksum = buf.get_u32_le();
        let seq = buf.get_u32_le();
        let command = buf.get_u32_le();

        Self {
            length,
            flags,
            checksum,
            seq,
            command,
        }
    }

    /// Compute the checksum this header should carry for `body`
    pub fn compute_checksum(&self, body: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.length_word());
        hasher.update(&self.seq.to_le_bytes());
        hasher.update(&self.command.to_le_bytes());
        hasher.update(body);
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = Flags::COMPRESS | Flags::ERROR;
        assert!(flags.contains(Flags::COMPRESS));
        assert!(!flags.contains(Flags::ENCRYPT));
        assert_eq!(flags.bits(), 0b0001_0001);
        assert_eq!(Flags::CACHE.bits(), 0x20);
        assert_eq!(Flags::EXTENDED.bits(), 0x08);
    }

    #[test]
    fn test_header_layout() {
        let header = FrameHeader {
            length: 0x0A0B0C,
            flags: Flags::ENCRYPT,
            checksum: 0xDEADBEEF,
            seq: 7,
            command: 0x01020304,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        // 24-bit length is three little-endian bytes followed by flags
        assert_eq!(&buf[0..4], &[0x0C, 0x0B, 0x0A, 0x02]);
        assert_eq!(&buf[4..8], &0xDEADBEEFu32.to_le_bytes());
        assert_eq!(&buf[8..12], &7u32.to_le_bytes());
        assert_eq!(&buf[12..16], &[0x04, 0x03, 0x02, 0x01]);

        let raw: [u8; HEADER_SIZE] = buf[..].try_into().unwrap();
        assert_eq!(FrameHeader::decode(&raw), header);
    }

    #[test]
    fn test_unknown_flag_bits_are_retained() {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0] = HEADER_SIZE as u8;
        raw[3] = 0x80 | Flags::CACHE.bits();

        let header = FrameHeader::decode(&raw);
        assert!(header.flags.contains(Flags::CACHE));
        assert_eq!(header.flags.bits(), 0xA0);
    }

    #[test]
    fn test_checksum_covers_flags() {
        let mut header = FrameHeader {
            length: 20,
            seq: 1,
            command: 2,
            ..Default::default()
        };
        let plain = header.compute_checksum(b"body");
        header.flags = Flags::CACHE;
        assert_ne!(plain, header.compute_checksum(b"body"));
    }
}
