//! Property-based tests using proptest
//!
//! These tests validate wire invariants across randomly generated field
//! values, frame boundaries and tampering positions.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use glam::{Quat, Vec3};
use proptest::prelude::*;
use session_net::core::codec::FrameCodec;
use session_net::core::packet::Packet;
use session_net::core::types::{AnimationParam, Transform};
use session_net::protocol::message::{ClientMessage, ServerMessage, WireOptions};
use session_net::utils::HmacKey;
use tokio_util::codec::{Decoder, Encoder};

const ALL_ON: WireOptions = WireOptions {
    auth_tokens: true,
    hmac: true,
};

fn finite() -> impl Strategy<Value = f32> {
    -1.0e6f32..1.0e6f32
}

fn transform() -> impl Strategy<Value = Transform> {
    (
        finite(),
        finite(),
        finite(),
        finite(),
        finite(),
        finite(),
        finite(),
    )
        .prop_map(|(x, y, z, qx, qy, qz, qw)| {
            Transform::new(Vec3::new(x, y, z), Quat::from_xyzw(qx, qy, qz, qw))
        })
}

// Property: every primitive field reads back as written, in order
proptest! {
    #[test]
    fn prop_fields_roundtrip(
        a in any::<i32>(),
        f in finite(),
        b in any::<bool>(),
        byte in any::<u8>(),
        s in ".{0,64}",
        blob in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let mut p = Packet::new();
        p.write(&a).write(&f).write(&b).write(&byte).write(&s).write(&blob);

        prop_assert_eq!(p.read::<i32>().unwrap(), a);
        prop_assert_eq!(p.read::<f32>().unwrap(), f);
        prop_assert_eq!(p.read::<bool>().unwrap(), b);
        prop_assert_eq!(p.read::<u8>().unwrap(), byte);
        prop_assert_eq!(p.read::<String>().unwrap(), s);
        prop_assert_eq!(p.read::<Vec<u8>>().unwrap(), blob);
        prop_assert_eq!(p.unread_len(), 0);
    }
}

// Property: transforms survive the wire bit for bit
proptest! {
    #[test]
    fn prop_transform_roundtrip(t in transform()) {
        let mut p = Packet::new();
        p.write(&t);
        prop_assert_eq!(p.len(), 7 * 4);
        prop_assert_eq!(p.read::<Transform>().unwrap(), t);
    }
}

// Property: any split of a frame stream yields the same packets
proptest! {
    #[test]
    fn prop_framing_arbitrary_splits(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..256), 1..8),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..16),
    ) {
        let mut codec = FrameCodec::default();
        let mut wire = BytesMut::new();
        for payload in &payloads {
            codec.encode(Packet::from_vec(payload.clone()), &mut wire).unwrap();
        }
        let wire = wire.to_vec();

        let mut points: Vec<usize> = cuts.iter().map(|i| i.index(wire.len() + 1)).collect();
        points.push(0);
        points.push(wire.len());
        points.sort_unstable();
        points.dedup();

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for window in points.windows(2) {
            buf.extend_from_slice(&wire[window[0]..window[1]]);
            while let Some(packet) = codec.decode(&mut buf).unwrap() {
                decoded.push(packet.into_vec());
            }
        }

        prop_assert_eq!(decoded, payloads);
        prop_assert!(buf.is_empty());
    }
}

// Property: flipping any bit of a signed message breaks verification
proptest! {
    #[test]
    fn prop_hmac_detects_bit_flip(
        text in ".{0,64}",
        sender in 1i32..100,
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let key = HmacKey::generate().unwrap();
        let packet = ServerMessage::Message { text, sender_id: sender }
            .to_packet(Some(&key))
            .unwrap();
        prop_assert!(key.verify(&packet).is_ok());

        let mut bytes = packet.into_vec();
        let at = position.index(bytes.len());
        bytes[at] ^= 1 << bit;
        prop_assert!(key.verify(&Packet::from_vec(bytes)).is_err());
    }
}

// Property: client requests decode to what was encoded
proptest! {
    #[test]
    fn prop_client_requests_roundtrip(
        id in 1i32..1000,
        token in "[A-Za-z0-9]{32}",
        text in ".{0,128}",
        t in transform(),
        value in finite(),
        payload in prop::collection::vec(any::<u8>(), 0..2048),
    ) {
        let messages = vec![
            ClientMessage::MessageToAll { client_id: id, token: Some(token.clone()), text: text.clone() },
            ClientMessage::MessageToUser { client_id: id, token: Some(token.clone()), target_id: id + 1, text },
            ClientMessage::TransformChange { client_id: id, token: Some(token.clone()), transform: t },
            ClientMessage::AnimationChange {
                client_id: id,
                token: Some(token.clone()),
                animation: AnimationParam::float("speed", value),
            },
            ClientMessage::BandwidthRequest { client_id: id, token: Some(token), payload: payload.clone() },
            ClientMessage::ThroughputRequest { client_id: id, packet_id: id, payload },
        ];
        for msg in messages {
            let decoded = ClientMessage::decode(msg.encode(ALL_ON), ALL_ON).unwrap();
            prop_assert_eq!(decoded, msg);
        }
    }
}

// Property: decoding arbitrary bytes never panics
proptest! {
    #[test]
    fn prop_decode_garbage_is_safe(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = ClientMessage::decode(Packet::from_vec(bytes.clone()), ALL_ON);
        let _ = ServerMessage::decode(Packet::from_vec(bytes.clone()), ALL_ON);
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::from(&bytes[..]);
        while let Ok(Some(_)) = codec.decode(&mut buf) {}
    }
}
