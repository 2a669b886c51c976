#![allow(clippy::unwrap_used)]

use bytes::{Bytes, BytesMut};
use muxwire::config::CryptoConfig;
use muxwire::core::codec::PacketCodec;
use muxwire::core::packet::Packet;
use muxwire::protocol::transform::{CryptoTransform, Received, Role};
use std::time::Instant;
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn stress_packet_encode_decode_large_series() {
    let mut codec = PacketCodec::new();
    let mut buf = BytesMut::new();

    for size in [0usize, 1, 64, 512, 4096, 65_535] {
        for _ in 0..5_000 {
            codec.encode(Packet::new(1, vec![0u8; size]), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.payload.len(), size);
            assert!(buf.is_empty());
        }
    }
}

#[test]
fn stress_sealed_traffic_with_packet_count_rekeys() {
    let config = CryptoConfig {
        rekey_packet_limit: 100,
        ..CryptoConfig::default()
    };
    let a = CryptoTransform::new(Role::Initiator, &config);
    let b = CryptoTransform::new(Role::Responder, &config);

    let mut to_b = a.start().unwrap();
    let mut to_a: Vec<Packet> = Vec::new();
    let mut at_b = 0usize;
    let mut at_a = 0usize;

    for round in 0..40 {
        // Held until the exchange completes
        for i in 0..25 {
            a.enqueue(Bytes::from(format!("{round}:{i}"))).unwrap();
        }
        to_b.extend(a.drain().unwrap());
        to_a.extend(b.poll(Instant::now()).unwrap());

        loop {
            for p in std::mem::take(&mut to_b) {
                match b.receive(p).unwrap() {
                    Received::Application(data) => {
                        at_b += 1;
                        b.enqueue(data).unwrap();
                    }
                    Received::Handshake(replies) => to_a.extend(replies),
                }
            }
            to_a.extend(b.drain().unwrap());

            for p in std::mem::take(&mut to_a) {
                match a.receive(p).unwrap() {
                    Received::Application(_) => at_a += 1,
                    Received::Handshake(replies) => to_b.extend(replies),
                }
            }
            to_b.extend(a.drain().unwrap());

            if to_a.is_empty() && to_b.is_empty() {
                break;
            }
        }
    }

    assert_eq!(at_b, 1000);
    assert_eq!(at_a, 1000);
    // Responder policy: b's own sealed count drives the rekeys
    assert!(b.cycle() > 4, "cycle {}", b.cycle());
    assert_eq!(a.cycle(), b.cycle());
}
