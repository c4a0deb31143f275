//! Basic usage example for the SpCore wire protocol.

use bytes::Buf;
use spcore_wire::{
    decode_message, encode_frame, encode_message, ConfigChange, ConfigRecord, FrameHeader,
    Identification, SpCoreMessage, FRAME_HEADER_SIZE,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== SpCore Wire Protocol Example ===\n");

    // 1. Encode an identification the way a controller announces itself
    println!("1. Encoding an Identification message...");
    let identification = SpCoreMessage::identification(Identification {
        id: Some("AA:BB:CC:DD:EE:FF".into()),
        protocol_version: Some("0.1".into()),
        max_body_length: Some(spcore_wire::MAX_BODY_LENGTH),
        ..Default::default()
    });
    let body = encode_message(&identification)?;
    let frame = encode_frame(&body)?;
    println!("   Body: {} bytes, frame: {} bytes", body.len(), frame.len());

    // 2. Split the frame back into header and body
    println!("\n2. Decoding the frame...");
    let mut cursor = &frame[..];
    let header = FrameHeader::decode(&mut cursor)?;
    println!("   Declared length: {}", header.length);
    let decoded = decode_message(&cursor.chunk()[..header.length as usize])?;
    println!(
        "   Kind: {:?}, id: {}",
        decoded.kind(),
        decoded.identification.unwrap_or_default().id()
    );

    // 3. A configuration change with one schedule
    println!("\n3. Encoding a ConfigChange...");
    let change = SpCoreMessage::config_change(ConfigChange {
        request_id: Some(1),
        schedules: vec![ConfigRecord::named(100, "Business hours")],
        ..Default::default()
    });
    let body = encode_message(&change)?;
    println!(
        "   Body: {} bytes (+{} header bytes)",
        body.len(),
        FRAME_HEADER_SIZE
    );

    Ok(())
}
