//! Integration tests for zero-copy codec operations
//!
//! The decoder splits whole frames off the read buffer; payloads share the
//! buffer's allocation instead of being copied out.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{Bytes, BytesMut};
use muxwire::core::codec::PacketCodec;
use muxwire::core::packet::{Packet, HEADER_SIZE};
use muxwire::error::ProtocolError;
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn test_codec_decode_zero_copy_split() {
    let mut codec = PacketCodec::new();
    let bytes = Packet::new(1, vec![1, 2, 3, 4, 5]).to_bytes().unwrap();

    let mut buffer = BytesMut::from(&bytes[..]);
    let original_capacity = buffer.capacity();

    let decoded = codec.decode(&mut buffer).expect("Failed to decode").unwrap();
    assert_eq!(decoded.payload.as_ref(), &[1, 2, 3, 4, 5]);
    assert_eq!(buffer.len(), 0);
    assert!(buffer.capacity() <= original_capacity);
}

#[test]
fn test_payload_points_into_read_buffer() {
    let mut codec = PacketCodec::new();
    let mut buffer = BytesMut::new();
    codec
        .encode(Packet::new(9, vec![0xAB; 64]), &mut buffer)
        .unwrap();
    let base = buffer.as_ptr() as usize;

    let decoded = codec.decode(&mut buffer).unwrap().unwrap();
    // Payload starts right after the header in the same allocation
    assert_eq!(decoded.payload.as_ptr() as usize, base + HEADER_SIZE);
}

#[test]
fn test_codec_partial_decode_preserves_buffer() {
    let mut codec = PacketCodec::new();

    // Header says 5 payload bytes, only 2 present
    let mut buffer = BytesMut::from(&[0x00, 0x05, 0x01, 0xAA, 0xBB][..]);
    let result = codec.decode(&mut buffer).expect("Decode should not error");

    assert!(result.is_none());
    assert_eq!(buffer.len(), 5);
}

#[test]
fn test_codec_encode_writes_exact_frame() {
    let mut codec = PacketCodec::new();
    let mut buffer = BytesMut::new();
    codec.encode(Packet::new(7, vec![0u8; 100]), &mut buffer).unwrap();

    assert_eq!(buffer.len(), HEADER_SIZE + 100);
    assert_eq!(&buffer[..3], &[0x00, 100, 7]);
}

#[test]
fn test_codec_multiple_packets_in_buffer() {
    let mut codec = PacketCodec::new();
    let mut buffer = BytesMut::new();
    codec.encode(Packet::new(1, vec![55]), &mut buffer).unwrap();
    codec
        .encode(Packet::new(255, vec![255, 255, 1, 253, 189]), &mut buffer)
        .unwrap();

    let first = codec.decode(&mut buffer).unwrap().unwrap();
    assert_eq!(first, Packet::new(1, vec![55]));
    let second = codec.decode(&mut buffer).unwrap().unwrap();
    assert_eq!(second, Packet::new(255, vec![255, 255, 1, 253, 189]));
    assert!(codec.decode(&mut buffer).unwrap().is_none());
    assert!(buffer.is_empty());
}

#[test]
fn test_codec_decode_with_exact_data() {
    let mut codec = PacketCodec::new();
    let mut buffer = BytesMut::from(&[0x00, 0x03, 0x02, 0x0A, 0x0B, 0x0C][..]);

    let decoded = codec.decode(&mut buffer).unwrap().unwrap();
    assert_eq!(decoded.type_id, 2);
    assert_eq!(decoded.payload, Bytes::from_static(&[0x0A, 0x0B, 0x0C]));
}

#[test]
fn test_codec_max_payload_boundary() {
    let mut codec = PacketCodec::new();
    let mut buffer = BytesMut::new();

    codec
        .encode(Packet::new(3, vec![0xEE; 65_535]), &mut buffer)
        .expect("65535 bytes fits the length field");
    let decoded = codec.decode(&mut buffer).unwrap().unwrap();
    assert_eq!(decoded.payload.len(), 65_535);

    let err = codec
        .encode(Packet::new(3, vec![0xEE; 65_536]), &mut buffer)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::PacketTooLarge(65_536)));
    assert!(buffer.is_empty());
}

#[test]
fn test_codec_configured_limit_rejects_header() {
    let mut codec = PacketCodec::with_max_payload(16);
    let mut buffer = BytesMut::from(&[0x00, 0x20, 0x01][..]);

    let err = codec.decode(&mut buffer).unwrap_err();
    assert!(matches!(err, ProtocolError::ProtocolDesync(_)));
}

#[test]
fn test_codec_buffer_reuse() {
    let mut codec = PacketCodec::new();
    let mut buffer = BytesMut::with_capacity(1024);

    for i in 0..10u8 {
        codec.encode(Packet::new(i, vec![i; 10]), &mut buffer).unwrap();
    }
    assert_eq!(buffer.len(), 10 * (HEADER_SIZE + 10));

    for i in 0..10u8 {
        let p = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(p.type_id, i);
        assert_eq!(p.payload.as_ref(), &[i; 10]);
    }
    assert!(buffer.is_empty());
}

#[test]
fn test_codec_incremental_buffer_fill() {
    let mut codec = PacketCodec::new();
    let bytes = Packet::new(4, b"slow network".to_vec()).to_bytes().unwrap();

    let mut buffer = BytesMut::new();
    for (i, byte) in bytes.iter().enumerate() {
        buffer.extend_from_slice(&[*byte]);
        let result = codec.decode(&mut buffer).unwrap();
        if i + 1 < bytes.len() {
            assert!(result.is_none(), "decoded early at byte {i}");
        } else {
            assert_eq!(result.unwrap().payload.as_ref(), b"slow network");
        }
    }
}

#[test]
fn test_codec_empty_payload() {
    let mut codec = PacketCodec::new();
    let mut buffer = BytesMut::from(&[0x00, 0x00, 0x2A][..]);

    let p = codec.decode(&mut buffer).unwrap().unwrap();
    assert_eq!(p.type_id, 42);
    assert!(p.payload.is_empty());
}
