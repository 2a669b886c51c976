#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests for boundary conditions, error scenarios, resource limits,
//! and concurrent use

use bytes::Bytes;
use muxwire::config::CryptoConfig;
use muxwire::core::packet::{Packet, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use muxwire::core::wire::{WireReader, WireWriter};
use muxwire::error::ProtocolError;
use muxwire::protocol::handshake::{respond, DhGroup, DhParams, DhSession};
use muxwire::protocol::message::{PacketTag, ServiceMessage, SERVICE_HEADER_LEN};
use muxwire::protocol::transform::{sealed_len, CryptoTransform, Role};
use muxwire::utils::crypto::{Crypto, SessionKey};
use muxwire::utils::timeout::{with_timeout, with_timeout_error};
use std::sync::Arc;
use std::time::Duration;

fn small_params() -> DhParams {
    DhParams {
        group: DhGroup::Random { modulus_bytes: 32 },
        exponent_bytes: 16,
        min_modulus_bytes: 16,
        max_modulus_bytes: 64,
    }
}

// ============================================================================
// PACKET EDGE CASES
// ============================================================================

#[test]
fn test_packet_empty_payload() {
    let bytes = Packet::new(0, Bytes::new()).to_bytes().unwrap();
    assert_eq!(bytes.len(), HEADER_SIZE);
    let decoded = Packet::from_bytes(&bytes).expect("Should decode empty payload");
    assert!(decoded.payload.is_empty());
    assert_eq!(decoded.type_id, 0);
}

#[test]
fn test_packet_payload_exactly_max() {
    let packet = Packet::new(1, vec![0x7E; MAX_PAYLOAD_SIZE]);
    let bytes = packet.to_bytes().expect("Max payload fits");
    assert_eq!(&bytes[..2], &[0xFF, 0xFF]);
    let decoded = Packet::from_bytes(&bytes).expect("Should decode max boundary");
    assert_eq!(decoded.payload.len(), MAX_PAYLOAD_SIZE);
}

#[test]
fn test_packet_payload_one_more_than_max_fails() {
    let packet = Packet::new(1, vec![0xFF; MAX_PAYLOAD_SIZE + 1]);
    assert!(matches!(
        packet.to_bytes(),
        Err(ProtocolError::PacketTooLarge(n)) if n == MAX_PAYLOAD_SIZE + 1
    ));
}

#[test]
fn test_packet_truncated_header() {
    assert!(matches!(
        Packet::from_bytes(&[0x00, 0x01]),
        Err(ProtocolError::DeserializeError(_))
    ));
    assert!(Packet::from_bytes(&[]).is_err());
}

#[test]
fn test_packet_declared_length_mismatch() {
    // Declares 4, carries 2
    assert!(Packet::from_bytes(&[0x00, 0x04, 0x01, 0xAA, 0xBB]).is_err());
    // Declares 1, carries 2
    assert!(Packet::from_bytes(&[0x00, 0x01, 0x01, 0xAA, 0xBB]).is_err());
}

// ============================================================================
// WIRE FIELD EDGE CASES
// ============================================================================

#[test]
fn test_wire_blob_length_beyond_buffer() {
    let mut w = WireWriter::new();
    w.put_u32(1_000);
    w.put_raw(&[1, 2, 3]);
    let bytes = w.into_vec();
    let mut r = WireReader::new(&bytes);
    assert!(matches!(r.read_blob(), Err(ProtocolError::DeserializeError(_))));
}

#[test]
fn test_wire_extreme_integers() {
    let mut w = WireWriter::new();
    w.put_i32(i32::MIN);
    w.put_i64(i64::MAX);
    w.put_u16(u16::MAX);
    let bytes = w.into_vec();

    let mut r = WireReader::new(&bytes);
    assert_eq!(r.read_i32().unwrap(), i32::MIN);
    assert_eq!(r.read_i64().unwrap(), i64::MAX);
    assert_eq!(r.read_u16().unwrap(), u16::MAX);
    r.finish().unwrap();
}

#[test]
fn test_wire_invalid_utf8_string() {
    let mut w = WireWriter::new();
    w.put_blob(&[0xFF, 0xFE]);
    let bytes = w.into_vec();
    assert!(WireReader::new(&bytes).read_string().is_err());
}

// ============================================================================
// SERVICE MESSAGE EDGE CASES
// ============================================================================

#[test]
fn test_service_message_empty_data() {
    let msg = ServiceMessage::new(5, Bytes::new());
    let encoded = msg.encode();
    assert_eq!(encoded.len(), SERVICE_HEADER_LEN);
    assert_eq!(ServiceMessage::decode(&encoded).unwrap(), msg);
}

#[test]
fn test_service_message_negative_id() {
    let msg = ServiceMessage::new(-7, Bytes::from_static(b"neg"));
    assert_eq!(ServiceMessage::decode(&msg.encode()).unwrap().service_id, -7);
}

#[test]
fn test_service_message_too_short() {
    for len in 0..SERVICE_HEADER_LEN {
        let bytes = vec![0u8; len];
        assert!(
            matches!(
                ServiceMessage::decode(&bytes),
                Err(ProtocolError::DeserializeError(_))
            ),
            "length {len} should fail"
        );
    }
}

#[test]
fn test_packet_tag_unknown() {
    assert!(matches!(
        PacketTag::try_from(3u8),
        Err(ProtocolError::ProtocolDesync(_))
    ));
    assert_eq!(PacketTag::try_from(2u8).unwrap(), PacketTag::AgreementResponse);
}

// ============================================================================
// CRYPTOGRAPHY EDGE CASES
// ============================================================================

#[test]
fn test_crypto_encrypt_empty_plaintext() {
    let crypto = Crypto::new();
    let key = SessionKey::from_bytes([7; 32]);
    let sealed = crypto.seal(&key, b"").unwrap();
    assert_eq!(sealed.len(), sealed_len(0));
    assert!(crypto.open(&key, &sealed).unwrap().is_empty());
}

#[test]
fn test_crypto_block_aligned_plaintext_gets_full_pad_block() {
    let crypto = Crypto::new();
    let key = SessionKey::from_bytes([7; 32]);
    let sealed = crypto.seal(&key, &[0u8; 32]).unwrap();
    assert_eq!(sealed.len(), 4 + 16 + 4 + 48);
}

#[test]
fn test_crypto_wrong_key() {
    let crypto = Crypto::new();
    let sealed = crypto
        .seal(&SessionKey::from_bytes([1; 32]), b"secret payload")
        .unwrap();
    let opened = crypto.open(&SessionKey::from_bytes([2; 32]), &sealed);
    assert_ne!(opened.ok(), Some(b"secret payload".to_vec()));
}

#[test]
fn test_crypto_truncated_envelope() {
    let crypto = Crypto::new();
    let key = SessionKey::from_bytes([3; 32]);
    let sealed = crypto.seal(&key, b"data").unwrap();
    for cut in [0, 3, 20, sealed.len() - 1] {
        assert!(matches!(
            crypto.open(&key, &sealed[..cut]),
            Err(ProtocolError::IntegrityFailure)
        ));
    }
}

#[test]
fn test_crypto_ciphertext_not_block_multiple() {
    let crypto = Crypto::new();
    let key = SessionKey::from_bytes([3; 32]);
    let mut w = WireWriter::new();
    w.put_blob(&[0u8; 16]);
    w.put_blob(&[0u8; 15]);
    assert!(matches!(
        crypto.open(&key, &w.into_vec()),
        Err(ProtocolError::IntegrityFailure)
    ));
}

#[test]
fn test_session_key_debug_is_redacted() {
    let key = SessionKey::from_bytes([0xAB; 32]);
    let shown = format!("{key:?}");
    assert!(!shown.contains("171"));
    assert!(!shown.to_lowercase().contains("ab, ab"));
}

// ============================================================================
// HANDSHAKE EDGE CASES
// ============================================================================

#[test]
fn test_handshake_agreement_small_group() {
    let params = small_params();
    let (session, request) = DhSession::initiate(&params).unwrap();
    let (response, responder_key) = respond(&request, &params).unwrap();
    let initiator_key = session.complete(&response).unwrap();
    assert_eq!(initiator_key, responder_key);
}

#[test]
fn test_handshake_rejects_oversized_modulus() {
    let wide = DhParams {
        group: DhGroup::Random { modulus_bytes: 128 },
        ..small_params()
    };
    let (_session, request) = DhSession::initiate(&wide).unwrap();
    assert!(matches!(
        respond(&request, &small_params()),
        Err(ProtocolError::HandshakeFailure(_))
    ));
}

#[test]
fn test_handshake_rejects_trivial_public_value() {
    let mut w = WireWriter::new();
    w.put_blob(&[2]);
    w.put_blob(&[0xFF; 32]);
    w.put_blob(&[1]);
    assert!(matches!(
        respond(&w.into_vec(), &small_params()),
        Err(ProtocolError::HandshakeFailure(_))
    ));
}

#[test]
fn test_handshake_rejects_trailing_bytes() {
    let params = small_params();
    let (_session, mut request) = DhSession::initiate(&params).unwrap();
    request.push(0);
    assert!(respond(&request, &params).is_err());
}

#[test]
fn test_handshake_response_out_of_range() {
    let params = small_params();
    let (session, _request) = DhSession::initiate(&params).unwrap();
    let mut w = WireWriter::new();
    w.put_blob(&[0xFF; 40]);
    assert!(matches!(
        session.complete(&w.into_vec()),
        Err(ProtocolError::HandshakeFailure(_))
    ));
}

// ============================================================================
// TRANSFORM EDGE CASES
// ============================================================================

#[test]
fn test_transform_enqueue_near_frame_limit() {
    let transform = CryptoTransform::new(Role::Initiator, &CryptoConfig::default());
    // Largest plaintext whose sealed form still fits one frame
    let fits = (0..MAX_PAYLOAD_SIZE)
        .rev()
        .find(|n| sealed_len(*n) <= MAX_PAYLOAD_SIZE)
        .unwrap();
    assert!(transform.enqueue(Bytes::from(vec![0u8; fits])).is_ok());
    assert!(matches!(
        transform.enqueue(Bytes::from(vec![0u8; fits + 16])),
        Err(ProtocolError::PacketTooLarge(_))
    ));
}

#[test]
fn test_transform_disposed_rejects_everything() {
    let transform = CryptoTransform::new(Role::Responder, &CryptoConfig::default());
    transform.dispose();
    transform.dispose();
    assert!(matches!(transform.start(), Err(ProtocolError::Disposed)));
    assert!(matches!(
        transform.receive(Packet::new(1, vec![0])),
        Err(ProtocolError::Disposed)
    ));
}

// ============================================================================
// TIMEOUT EDGE CASES
// ============================================================================

#[tokio::test]
async fn test_timeout_immediate_complete() {
    let result = with_timeout(async { "done" }, Duration::from_secs(10)).await;
    assert_eq!(result.unwrap(), "done");
}

#[tokio::test]
async fn test_timeout_exceeds_duration() {
    let result = with_timeout(
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            "should not reach"
        },
        Duration::from_millis(10),
    )
    .await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));
}

#[tokio::test]
async fn test_timeout_error_passes_inner_error_through() {
    let result: Result<(), ProtocolError> = with_timeout_error(
        async { Err(ProtocolError::Disposed) },
        Duration::from_secs(1),
    )
    .await;
    assert!(matches!(result, Err(ProtocolError::Disposed)));
}

// ============================================================================
// CONCURRENT EDGE CASES
// ============================================================================

#[tokio::test]
async fn test_concurrent_sealing_same_key() {
    let crypto = Arc::new(Crypto::new());
    let key = Arc::new(SessionKey::from_bytes([0xFF; 32]));

    let mut tasks = vec![];
    for i in 0..100 {
        let crypto = Arc::clone(&crypto);
        let key = Arc::clone(&key);
        tasks.push(tokio::spawn(async move {
            let plaintext = format!("message {i}").into_bytes();
            let sealed = crypto.seal(&key, &plaintext).expect("Should seal");
            let opened = crypto.open(&key, &sealed).expect("Should open");
            assert_eq!(opened, plaintext);
        }));
    }

    for task in tasks {
        task.await.expect("Task should complete");
    }
}

// ============================================================================
// ERROR PROPAGATION EDGE CASES
// ============================================================================

#[test]
fn test_error_display_formatting() {
    let errors = vec![
        ProtocolError::ProtocolDesync("bad length".into()),
        ProtocolError::PacketTooLarge(999),
        ProtocolError::DeserializeError("short".into()),
        ProtocolError::UnknownServiceTarget(42),
        ProtocolError::ServiceError("boom".into()),
        ProtocolError::HandshakeFailure("range".into()),
        ProtocolError::IntegrityFailure,
        ProtocolError::PolicyViolation("early data".into()),
        ProtocolError::Disposed,
        ProtocolError::Timeout,
        ProtocolError::ConfigError("bad".into()),
        ProtocolError::Io(std::io::Error::other("test error")),
    ];

    for err in errors {
        let display_str = format!("{err}");
        assert!(!display_str.is_empty(), "Error should have display format");
    }
}

#[test]
fn test_fatal_classification() {
    assert!(ProtocolError::IntegrityFailure.is_fatal());
    assert!(ProtocolError::HandshakeFailure("x".into()).is_fatal());
    assert!(ProtocolError::PolicyViolation("x".into()).is_fatal());
    assert!(ProtocolError::ProtocolDesync("x".into()).is_fatal());
    assert!(!ProtocolError::UnknownServiceTarget(1).is_fatal());
    assert!(!ProtocolError::DeserializeError("x".into()).is_fatal());
}

// ============================================================================
// RESOURCE CLEANUP EDGE CASES
// ============================================================================

#[test]
fn test_many_abandoned_exchanges() {
    let params = small_params();
    for _ in 0..50 {
        let _ = DhSession::initiate(&params).unwrap();
    }
}
