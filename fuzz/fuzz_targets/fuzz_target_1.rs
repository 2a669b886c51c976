#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use muxwire::core::codec::PacketCodec;
use muxwire::core::packet::Packet;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Single-frame parse
    let _ = Packet::from_bytes(data);

    // Streaming decode with a reduced limit: must stop at the first error
    let mut codec = PacketCodec::with_max_payload(4096);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(packet)) = codec.decode(&mut buf) {
        assert!(packet.payload.len() <= 4096);
    }
});
