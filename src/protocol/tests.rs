// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::config::CryptoConfig;
use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::protocol::balancer::Balancer;
use crate::protocol::message::ServiceMessage;
use crate::protocol::transform::{CryptoTransform, Received, Role};
use crate::service::{EchoService, MailboxService, ServiceHandle, ServicePriority};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame packets through the codec as the transport would
fn over_wire(packets: Vec<Packet>) -> Vec<Packet> {
    let mut codec = PacketCodec::new();
    let mut buf = BytesMut::new();
    for p in packets {
        codec.encode(p, &mut buf).expect("encode");
    }
    let mut out = Vec::new();
    while let Some(p) = codec.decode(&mut buf).expect("decode") {
        out.push(p);
    }
    out
}

fn establish(a: &CryptoTransform, b: &CryptoTransform) {
    let mut to_b = a.start().unwrap();
    let mut to_a: Vec<Packet> = Vec::new();
    while !to_a.is_empty() || !to_b.is_empty() {
        for p in over_wire(std::mem::take(&mut to_b)) {
            match b.receive(p).unwrap() {
                Received::Handshake(replies) => to_a.extend(replies),
                Received::Application(_) => panic!("unexpected application data"),
            }
        }
        for p in over_wire(std::mem::take(&mut to_a)) {
            match a.receive(p).unwrap() {
                Received::Handshake(replies) => to_b.extend(replies),
                Received::Application(_) => panic!("unexpected application data"),
            }
        }
    }
}

/// Outbound pass on one side feeding an inbound pass on the other
fn tick(from_bal: &Balancer, from: &CryptoTransform, to: &CryptoTransform, to_bal: &Balancer) {
    for msg in from_bal.collect_outbound() {
        from.enqueue(msg.encode()).unwrap();
    }
    for p in over_wire(from.drain().unwrap()) {
        match to.receive(p).unwrap() {
            Received::Application(data) => {
                let msg = ServiceMessage::decode(&data).unwrap();
                to_bal.dispatch_inbound(msg).unwrap();
            }
            Received::Handshake(_) => panic!("unexpected handshake traffic"),
        }
    }
}

#[test]
fn test_echo_through_full_pipeline() {
    let config = CryptoConfig::default();
    let client = CryptoTransform::new(Role::Initiator, &config);
    let server = CryptoTransform::new(Role::Responder, &config);
    establish(&client, &server);
    assert_eq!(client.cycle(), 2);
    assert_eq!(server.cycle(), 2);

    // Both sides register their service first so ids line up
    let client_bal = Balancer::new();
    let server_bal = Balancer::new();
    let (mailbox, mb_handle) = ServiceHandle::wrap(MailboxService::new());
    let (_echo, echo_handle) = ServiceHandle::wrap(EchoService::new());
    let id = client_bal
        .add_service(&mb_handle, ServicePriority::High)
        .unwrap();
    assert_eq!(
        server_bal.add_service(&echo_handle, ServicePriority::High),
        Some(id)
    );

    mailbox.push(Bytes::from_static(b"hello")).unwrap();
    mailbox.push(Bytes::from_static(b"world")).unwrap();

    tick(&client_bal, &client, &server, &server_bal);
    tick(&server_bal, &server, &client, &client_bal);

    assert_eq!(mailbox.pop().unwrap(), Some(Bytes::from_static(b"hello")));
    assert_eq!(mailbox.pop().unwrap(), Some(Bytes::from_static(b"world")));
    assert_eq!(mailbox.pop().unwrap(), None);
}

#[test]
fn test_random_group_session() {
    let config = CryptoConfig {
        group: crate::config::GroupKind::Random,
        random_modulus_bytes: 64,
        min_modulus_bytes: 32,
        ..CryptoConfig::default()
    };
    let client = CryptoTransform::new(Role::Initiator, &config);
    let server = CryptoTransform::new(Role::Responder, &config);
    establish(&client, &server);
    assert!(client.is_established() && server.is_established());

    server.enqueue(Bytes::from_static(b"ok")).unwrap();
    let packets = over_wire(server.drain().unwrap());
    assert_eq!(
        client.receive(packets[0].clone()).unwrap(),
        Received::Application(Bytes::from_static(b"ok"))
    );
}
