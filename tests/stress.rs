#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use session_net::config::NetworkConfig;
use session_net::core::codec::FrameCodec;
use session_net::core::packet::Packet;
use session_net::protocol::dispatcher::Dispatcher;
use session_net::service::ServerState;
use session_net::transport::tcp::outbound_channel;
use session_net::utils::metrics::Metrics;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

#[test]
fn stress_frame_encode_decode_large_series() {
    // Heavy burst of frames of growing size, decoded back from one buffer
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::new();

    for size in [1usize, 64, 512, 4096, 65_536] {
        for i in 0..2_000 {
            let mut payload = vec![0u8; size];
            payload[0] = (i % 251) as u8;
            codec.encode(Packet::from_vec(payload), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.len(), size);
            assert_eq!(decoded.as_bytes()[0], (i % 251) as u8);
            assert!(buf.is_empty());
        }
    }
}

#[test]
fn stress_dispatcher_backlog() {
    let dispatcher: Dispatcher<u64> = Dispatcher::new();
    for i in 0..200_000u64 {
        dispatcher.enqueue(move |sum: &mut u64| *sum += i).unwrap();
    }
    let mut sum = 0u64;
    assert_eq!(dispatcher.drain(&mut sum).unwrap(), 200_000);
    assert_eq!(sum, (0..200_000u64).sum::<u64>());
}

#[test]
fn stress_slot_churn() {
    let config = NetworkConfig::default_with_overrides(|c| c.server.max_ccu = 8);
    let mut state = ServerState::new(&config, None, Arc::new(Metrics::new()));
    let peer = SocketAddr::from(([127, 0, 0, 1], 5000));

    for round in 0..1_000 {
        let mut receivers = Vec::new();
        let mut tickets = Vec::new();
        for _ in 0..8 {
            let (tx, rx) = outbound_channel();
            let ticket = state.admit(peer, tx, CancellationToken::new()).unwrap();
            state.begin_handshake(ticket).unwrap();
            receivers.push(rx);
            tickets.push(ticket);
        }
        let (tx, _rx) = outbound_channel();
        assert!(state.admit(peer, tx, CancellationToken::new()).is_err());

        // Release in an order that varies per round
        tickets.rotate_left(round % 8);
        for ticket in tickets {
            assert!(state.disconnect_ticket(ticket));
        }
        assert_eq!(state.pool().populated_count(), 0);
    }

    let snap = state.metrics().snapshot();
    assert_eq!(snap.connections_active, 0);
    assert_eq!(snap.connections_rejected, 1_000);
}
