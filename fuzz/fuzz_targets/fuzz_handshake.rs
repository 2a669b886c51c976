#![no_main]

use libfuzzer_sys::fuzz_target;
use muxwire::config::{CryptoConfig, GroupKind};
use muxwire::core::packet::Packet;
use muxwire::protocol::handshake::{respond, DhGroup, DhParams};
use muxwire::protocol::message::ServiceMessage;
use muxwire::protocol::transform::{CryptoTransform, Role};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    // Small bounds keep modpow cheap on hostile moduli
    let params = DhParams {
        group: DhGroup::Random { modulus_bytes: 32 },
        exponent_bytes: 16,
        min_modulus_bytes: 16,
        max_modulus_bytes: 64,
    };
    let _ = respond(&data[1..], &params);

    if let Ok(msg) = ServiceMessage::decode(data) {
        assert_eq!(ServiceMessage::decode(&msg.encode()).ok(), Some(msg));
    }

    // First byte picks the tag, the rest is the payload
    let config = CryptoConfig {
        group: GroupKind::Random,
        random_modulus_bytes: 32,
        min_modulus_bytes: 16,
        max_modulus_bytes: 64,
        ..CryptoConfig::default()
    };
    let transform = CryptoTransform::new(Role::Responder, &config);
    let _ = transform.receive(Packet::new(data[0] % 4, data[1..].to_vec()));
});
