//! Basic usage example for the gate wire protocol.

use bytes::BytesMut;
use gate_wire::{Flags, FrameCodec, NodeAddress, MAX_PACKET_SIZE};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Gate Wire Protocol Example ===\n");

    let codec = FrameCodec::new();

    // 1. Encode a small frame
    println!("1. Encoding a small frame...");
    let small = codec.encode(1, 0x0101, Flags::empty(), b"Hello, gateway!", None)?;
    println!("   Encoded frame size: {} bytes", small.len());

    // 2. Encode a large, compressible frame
    println!("\n2. Encoding a large frame...");
    let body: Vec<u8> = b"abcdefgh".iter().copied().cycle().take(64 * 1024).collect();
    let large = codec.encode(2, 0x0102, Flags::CACHE, &body, None)?;
    println!(
        "   {} body bytes -> {} wire bytes (compressed: {})",
        body.len(),
        large.len(),
        large[3] & Flags::COMPRESS.bits() != 0
    );

    // 3. Decode both from one buffer
    println!("\n3. Decoding...");
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&small);
    buf.extend_from_slice(&large);
    while let Some(frame) = codec.decode(&mut buf, MAX_PACKET_SIZE, None)? {
        println!(
            "   seq={} cmd={:#06x} flags={:?} body={} bytes",
            frame.seq,
            frame.command,
            frame.flags,
            frame.body.len()
        );
    }

    // 4. Node addresses
    println!("\n4. Node addresses...");
    let backend = NodeAddress::backend(0x1A, 3);
    let session = NodeAddress::gateway_session(2, 1001);
    println!("   backend {} = {:#018x}", backend, backend.raw());
    println!("   session {} = {:#018x}", session, session.raw());

    println!("\n=== Example completed successfully ===");
    Ok(())
}
