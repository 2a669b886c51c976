//! Transport behavior over real TCP loopback connections

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::BytesMut;
use muxwire::config::TransportConfig;
use muxwire::core::codec::PacketCodec;
use muxwire::core::packet::Packet;
use muxwire::error::ProtocolError;
use muxwire::transport::tcp::{connect, TransportListener};
use muxwire::transport::{CloseReason, Transport};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Encoder;

async fn pair() -> (Transport, Transport) {
    let listener = TransportListener::bind("127.0.0.1:0", 16).await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let config = TransportConfig::default();
    let (client, server) = tokio::join!(connect(&addr, &config), listener.accept());
    (client.unwrap(), server.unwrap())
}

async fn recv(t: &Transport) -> Packet {
    tokio::time::timeout(Duration::from_secs(5), t.recv())
        .await
        .expect("packet within deadline")
        .expect("transport open")
}

#[tokio::test]
async fn test_reference_packets_cross_the_wire() {
    let (client, server) = pair().await;

    client.enqueue(Packet::new(1, vec![55])).unwrap();
    client
        .enqueue(Packet::new(255, vec![255, 255, 1, 253, 189]))
        .unwrap();

    assert_eq!(recv(&server).await, Packet::new(1, vec![55]));
    assert_eq!(
        recv(&server).await,
        Packet::new(255, vec![255, 255, 1, 253, 189])
    );
    assert!(server.dequeue().unwrap().is_none());

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn test_largest_frame_round_trip() {
    let (client, server) = pair().await;

    client.enqueue(Packet::new(9, vec![0x5A; 65_535])).unwrap();
    let p = recv(&server).await;
    assert_eq!(p.payload.len(), 65_535);
    assert!(p.payload.iter().all(|b| *b == 0x5A));

    assert!(matches!(
        client.enqueue(Packet::new(9, vec![0; 65_536])),
        Err(ProtocolError::PacketTooLarge(65_536))
    ));

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn test_bidirectional_bursts_keep_order() {
    let (client, server) = pair().await;

    for i in 0..200u8 {
        client.enqueue(Packet::new(i, vec![i; i as usize])).unwrap();
        server.enqueue(Packet::new(i, vec![!i; 3])).unwrap();
    }
    for i in 0..200u8 {
        let at_server = recv(&server).await;
        assert_eq!(at_server.type_id, i);
        assert_eq!(at_server.payload.len(), i as usize);
        let at_client = recv(&client).await;
        assert_eq!(at_client.payload.as_ref(), &[!i; 3]);
    }

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn test_peer_disconnect_closes_transport() {
    let (client, server) = pair().await;

    client.dispose().await;
    assert_eq!(client.close_reason(), Some(CloseReason::Stopped));

    let reason = tokio::time::timeout(Duration::from_secs(5), server.closed())
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::PeerClosed);
    assert!(matches!(server.recv().await, Err(ProtocolError::Disposed)));
    assert!(matches!(
        server.enqueue(Packet::new(1, vec![1])),
        Err(ProtocolError::Disposed)
    ));
}

#[tokio::test]
async fn test_oversized_header_from_raw_peer_is_desync() {
    let config = TransportConfig {
        max_payload_size: 1024,
        ..TransportConfig::default()
    };
    let listener = TransportListener::bind_with_config(&TransportConfig {
        address: "127.0.0.1:0".into(),
        ..config.clone()
    })
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();

    let (raw, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let mut raw = raw.unwrap();
    let server = server.unwrap();

    // One valid frame, then a header declaring more than the limit
    let mut buf = BytesMut::new();
    PacketCodec::new()
        .encode(Packet::new(2, vec![7, 7]), &mut buf)
        .unwrap();
    buf.extend_from_slice(&[0x10, 0x00, 0x01]);
    raw.write_all(&buf).await.unwrap();

    assert_eq!(recv(&server).await, Packet::new(2, vec![7, 7]));
    let reason = tokio::time::timeout(Duration::from_secs(5), server.closed())
        .await
        .unwrap();
    assert!(matches!(reason, CloseReason::Error(msg) if msg.contains("Protocol desync")));
}

#[tokio::test]
async fn test_fragmented_writes_reassemble() {
    let listener = TransportListener::bind("127.0.0.1:0", 4).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (raw, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let mut raw = raw.unwrap();
    raw.set_nodelay(true).unwrap();
    let server = server.unwrap();

    let frame = Packet::new(77, b"fragmented".to_vec()).to_bytes().unwrap();
    for chunk in frame.chunks(3) {
        raw.write_all(chunk).await.unwrap();
        raw.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let p = recv(&server).await;
    assert_eq!(p.type_id, 77);
    assert_eq!(p.payload.as_ref(), b"fragmented");
}
