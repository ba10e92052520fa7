#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use session_net::core::codec::FrameCodec;
use session_net::core::packet::Packet;
use session_net::protocol::message::{ClientMessage, ServerMessage, WireOptions};
use tokio_util::codec::Decoder;

const OPTS: WireOptions = WireOptions {
    auth_tokens: true,
    hmac: true,
};

fuzz_target!(|data: &[u8]| {
    // Framing, then both message decoders: must never panic or loop
    let mut codec = FrameCodec::new(64 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        let _ = ClientMessage::decode(frame.clone(), OPTS);
        let _ = ServerMessage::decode(frame, OPTS);
    }
    let _ = ClientMessage::decode(Packet::from_bytes(data), OPTS);
    let _ = session_net::transport::udp::parse_envelope(data);
});
