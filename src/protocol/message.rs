//! # Protocol Messages
//!
//! Typed messages for both directions of a session. Each message is encoded
//! as `[type: i32][fields...]`, optionally followed by a 32-byte HMAC tag,
//! and framed by the transport.
//!
//! Two switches change the layout and must match on both peers
//! ([`WireOptions`]):
//! - `auth_tokens`: privileged client requests carry the session token after the claimed id
//! - `hmac`: selected server messages carry a trailing tag signed with the recipient's key
//!
//! Client type tags 6 and 7 are reserved and decode as unknown.

use crate::core::packet::Packet;
use crate::core::types::{AnimationParam, Transform};
use crate::error::{ProtocolError, Result};
use crate::utils::crypto::HmacKey;

/// Optional wire fields negotiated through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireOptions {
    pub auth_tokens: bool,
    pub hmac: bool,
}

/// Preferred channel for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// TCP, ordered and reliable
    Reliable,
    /// UDP when enabled and the peer endpoint is known, else TCP
    Unreliable,
}

/// Server to client type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ServerPacket {
    Welcome = 1,
    SpawnUser = 2,
    DisconnectUser = 3,
    LatencyReply = 4,
    Message = 5,
    HmacKey = 6,
    AuthToken = 7,
    MessageAll = 8,
    TransformUpdate = 9,
    AnimationUpdate = 10,
    BandwidthReply = 11,
    ThroughputReply = 12,
}

impl ServerPacket {
    /// Whether the message carries an HMAC tag when HMAC is enabled.
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Self::SpawnUser | Self::DisconnectUser | Self::Message | Self::BandwidthReply
        )
    }
}

impl TryFrom<i32> for ServerPacket {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            1 => Self::Welcome,
            2 => Self::SpawnUser,
            3 => Self::DisconnectUser,
            4 => Self::LatencyReply,
            5 => Self::Message,
            6 => Self::HmacKey,
            7 => Self::AuthToken,
            8 => Self::MessageAll,
            9 => Self::TransformUpdate,
            10 => Self::AnimationUpdate,
            11 => Self::BandwidthReply,
            12 => Self::ThroughputReply,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// Client to server type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ClientPacket {
    WelcomeAck = 1,
    LatencyRequest = 2,
    DisconnectRequest = 3,
    MessageToUser = 4,
    MessageToAll = 5,
    TransformChange = 8,
    AnimationChange = 9,
    BandwidthRequest = 10,
    ThroughputRequest = 11,
}

impl TryFrom<i32> for ClientPacket {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            1 => Self::WelcomeAck,
            2 => Self::LatencyRequest,
            3 => Self::DisconnectRequest,
            4 => Self::MessageToUser,
            5 => Self::MessageToAll,
            8 => Self::TransformChange,
            9 => Self::AnimationChange,
            10 => Self::BandwidthRequest,
            11 => Self::ThroughputRequest,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// Content and tag of a signed message, checked once the key is at hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub content: Vec<u8>,
    pub tag: Vec<u8>,
}

impl Signature {
    pub fn verify(&self, key: &HmacKey) -> Result<()> {
        key.verify_parts(&self.content, &self.tag)
    }
}

/// A decoded message and, for signed types, its unverified signature.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound<M> {
    pub message: M,
    pub signature: Option<Signature>,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Welcome { greeting: String, client_id: i32 },
    SpawnUser { client_id: i32, username: String },
    DisconnectUser { client_id: i32 },
    LatencyReply { client_id: i32, ping_id: i32 },
    Message { text: String, sender_id: i32 },
    HmacKey { key: Vec<u8> },
    AuthToken { token: String, client_id: i32 },
    MessageAll { text: String, sender_id: i32 },
    TransformUpdate { client_id: i32, transform: Transform },
    AnimationUpdate { client_id: i32, animation: AnimationParam },
    BandwidthReply { client_id: i32 },
    ThroughputReply { packet_id: i32, size: i32 },
}

impl ServerMessage {
    pub fn packet_type(&self) -> ServerPacket {
        match self {
            Self::Welcome { .. } => ServerPacket::Welcome,
            Self::SpawnUser { .. } => ServerPacket::SpawnUser,
            Self::DisconnectUser { .. } => ServerPacket::DisconnectUser,
            Self::LatencyReply { .. } => ServerPacket::LatencyReply,
            Self::Message { .. } => ServerPacket::Message,
            Self::HmacKey { .. } => ServerPacket::HmacKey,
            Self::AuthToken { .. } => ServerPacket::AuthToken,
            Self::MessageAll { .. } => ServerPacket::MessageAll,
            Self::TransformUpdate { .. } => ServerPacket::TransformUpdate,
            Self::AnimationUpdate { .. } => ServerPacket::AnimationUpdate,
            Self::BandwidthReply { .. } => ServerPacket::BandwidthReply,
            Self::ThroughputReply { .. } => ServerPacket::ThroughputReply,
        }
    }

    pub fn delivery(&self) -> Delivery {
        match self {
            Self::LatencyReply { .. }
            | Self::TransformUpdate { .. }
            | Self::ThroughputReply { .. } => Delivery::Unreliable,
            _ => Delivery::Reliable,
        }
    }

    /// Encode without a tag.
    pub fn encode(&self) -> Packet {
        let mut p = Packet::with_type(self.packet_type() as i32);
        match self {
            Self::Welcome {
                greeting,
                client_id,
            } => {
                p.write(greeting).write(client_id);
            }
            Self::SpawnUser {
                client_id,
                username,
            } => {
                p.write(client_id).write(username);
            }
            Self::DisconnectUser { client_id } | Self::BandwidthReply { client_id } => {
                p.write(client_id);
            }
            Self::LatencyReply { client_id, ping_id } => {
                p.write(client_id).write(ping_id);
            }
            Self::Message { text, sender_id } | Self::MessageAll { text, sender_id } => {
                p.write(text).write(sender_id);
            }
            Self::HmacKey { key } => {
                p.write(key);
            }
            Self::AuthToken { token, client_id } => {
                p.write(token).write(client_id);
            }
            Self::TransformUpdate {
                client_id,
                transform,
            } => {
                p.write(client_id).write(transform);
            }
            Self::AnimationUpdate {
                client_id,
                animation,
            } => {
                p.write(client_id).write(animation);
            }
            Self::ThroughputReply { packet_id, size } => {
                p.write(packet_id).write(size);
            }
        }
        p
    }

    /// Encode, appending a tag when the type is signed and a key is given.
    pub fn to_packet(&self, key: Option<&HmacKey>) -> Result<Packet> {
        let mut packet = self.encode();
        if let Some(key) = key {
            if self.packet_type().is_signed() {
                key.sign(&mut packet)?;
            }
        }
        Ok(packet)
    }

    /// Decode a frame payload.
    ///
    /// With `opts.hmac`, signed types must end in a tag; it is split off and
    /// returned for verification but not checked here.
    pub fn decode(mut packet: Packet, opts: WireOptions) -> Result<Inbound<Self>> {
        let kind = ServerPacket::try_from(packet.read::<i32>()?)?;

        let signature = if opts.hmac && kind.is_signed() {
            let tag = packet.strip_hmac()?;
            Some(Signature {
                content: packet.as_bytes().to_vec(),
                tag,
            })
        } else {
            None
        };

        let message = match kind {
            ServerPacket::Welcome => Self::Welcome {
                greeting: packet.read()?,
                client_id: packet.read()?,
            },
            ServerPacket::SpawnUser => Self::SpawnUser {
                client_id: packet.read()?,
                username: packet.read()?,
            },
            ServerPacket::DisconnectUser => Self::DisconnectUser {
                client_id: packet.read()?,
            },
            ServerPacket::LatencyReply => Self::LatencyReply {
                client_id: packet.read()?,
                ping_id: packet.read()?,
            },
            ServerPacket::Message => Self::Message {
                text: packet.read()?,
                sender_id: packet.read()?,
            },
            ServerPacket::HmacKey => Self::HmacKey { key: packet.read()? },
            ServerPacket::AuthToken => Self::AuthToken {
                token: packet.read()?,
                client_id: packet.read()?,
            },
            ServerPacket::MessageAll => Self::MessageAll {
                text: packet.read()?,
                sender_id: packet.read()?,
            },
            ServerPacket::TransformUpdate => Self::TransformUpdate {
                client_id: packet.read()?,
                transform: packet.read()?,
            },
            ServerPacket::AnimationUpdate => Self::AnimationUpdate {
                client_id: packet.read()?,
                animation: packet.read()?,
            },
            ServerPacket::BandwidthReply => Self::BandwidthReply {
                client_id: packet.read()?,
            },
            ServerPacket::ThroughputReply => Self::ThroughputReply {
                packet_id: packet.read()?,
                size: packet.read()?,
            },
        };

        Ok(Inbound { message, signature })
    }
}

/// Messages sent by the client.
///
/// `token` is written only when auth tokens are enabled; `None` then
/// encodes as an empty string.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    WelcomeAck {
        client_id: i32,
        username: String,
    },
    LatencyRequest {
        client_id: i32,
        ping_id: i32,
    },
    DisconnectRequest {
        client_id: i32,
        token: Option<String>,
    },
    MessageToUser {
        client_id: i32,
        token: Option<String>,
        target_id: i32,
        text: String,
    },
    MessageToAll {
        client_id: i32,
        token: Option<String>,
        text: String,
    },
    TransformChange {
        client_id: i32,
        token: Option<String>,
        transform: Transform,
    },
    AnimationChange {
        client_id: i32,
        token: Option<String>,
        animation: AnimationParam,
    },
    BandwidthRequest {
        client_id: i32,
        token: Option<String>,
        payload: Vec<u8>,
    },
    ThroughputRequest {
        client_id: i32,
        packet_id: i32,
        payload: Vec<u8>,
    },
}

impl ClientMessage {
    pub fn packet_type(&self) -> ClientPacket {
        match self {
            Self::WelcomeAck { .. } => ClientPacket::WelcomeAck,
            Self::LatencyRequest { .. } => ClientPacket::LatencyRequest,
            Self::DisconnectRequest { .. } => ClientPacket::DisconnectRequest,
            Self::MessageToUser { .. } => ClientPacket::MessageToUser,
            Self::MessageToAll { .. } => ClientPacket::MessageToAll,
            Self::TransformChange { .. } => ClientPacket::TransformChange,
            Self::AnimationChange { .. } => ClientPacket::AnimationChange,
            Self::BandwidthRequest { .. } => ClientPacket::BandwidthRequest,
            Self::ThroughputRequest { .. } => ClientPacket::ThroughputRequest,
        }
    }

    pub fn delivery(&self) -> Delivery {
        match self {
            Self::LatencyRequest { .. }
            | Self::TransformChange { .. }
            | Self::ThroughputRequest { .. } => Delivery::Unreliable,
            _ => Delivery::Reliable,
        }
    }

    /// Id the sender claims to hold.
    pub fn client_id(&self) -> i32 {
        match self {
            Self::WelcomeAck { client_id, .. }
            | Self::LatencyRequest { client_id, .. }
            | Self::DisconnectRequest { client_id, .. }
            | Self::MessageToUser { client_id, .. }
            | Self::MessageToAll { client_id, .. }
            | Self::TransformChange { client_id, .. }
            | Self::AnimationChange { client_id, .. }
            | Self::BandwidthRequest { client_id, .. }
            | Self::ThroughputRequest { client_id, .. } => *client_id,
        }
    }

    /// Whether the request carries a token field when tokens are enabled.
    pub fn carries_token(&self) -> bool {
        matches!(
            self,
            Self::DisconnectRequest { .. }
                | Self::MessageToUser { .. }
                | Self::MessageToAll { .. }
                | Self::TransformChange { .. }
                | Self::AnimationChange { .. }
                | Self::BandwidthRequest { .. }
        )
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Self::DisconnectRequest { token, .. }
            | Self::MessageToUser { token, .. }
            | Self::MessageToAll { token, .. }
            | Self::TransformChange { token, .. }
            | Self::AnimationChange { token, .. }
            | Self::BandwidthRequest { token, .. } => token.as_deref(),
            _ => None,
        }
    }

    pub fn encode(&self, opts: WireOptions) -> Packet {
        let mut p = Packet::with_type(self.packet_type() as i32);
        p.write(&self.client_id());
        if opts.auth_tokens && self.carries_token() {
            p.write(self.token().unwrap_or(""));
        }
        match self {
            Self::WelcomeAck { username, .. } => {
                p.write(username);
            }
            Self::LatencyRequest { ping_id, .. } => {
                p.write(ping_id);
            }
            Self::DisconnectRequest { .. } => {}
            Self::MessageToUser {
                target_id, text, ..
            } => {
                p.write(target_id).write(text);
            }
            Self::MessageToAll { text, .. } => {
                p.write(text);
            }
            Self::TransformChange { transform, .. } => {
                p.write(transform);
            }
            Self::AnimationChange { animation, .. } => {
                p.write(animation);
            }
            Self::BandwidthRequest { payload, .. } => {
                p.write(payload);
            }
            Self::ThroughputRequest {
                packet_id, payload, ..
            } => {
                p.write(packet_id).write(payload);
            }
        }
        p
    }

    pub fn decode(mut packet: Packet, opts: WireOptions) -> Result<Self> {
        let kind = ClientPacket::try_from(packet.read::<i32>()?)?;
        let client_id: i32 = packet.read()?;

        let message = match kind {
            ClientPacket::WelcomeAck => Self::WelcomeAck {
                client_id,
                username: packet.read()?,
            },
            ClientPacket::LatencyRequest => Self::LatencyRequest {
                client_id,
                ping_id: packet.read()?,
            },
            ClientPacket::DisconnectRequest => Self::DisconnectRequest {
                client_id,
                token: read_token(&mut packet, opts)?,
            },
            ClientPacket::MessageToUser => {
                let token = read_token(&mut packet, opts)?;
                Self::MessageToUser {
                    client_id,
                    token,
                    target_id: packet.read()?,
                    text: packet.read()?,
                }
            }
            ClientPacket::MessageToAll => {
                let token = read_token(&mut packet, opts)?;
                Self::MessageToAll {
                    client_id,
                    token,
                    text: packet.read()?,
                }
            }
            ClientPacket::TransformChange => {
                let token = read_token(&mut packet, opts)?;
                Self::TransformChange {
                    client_id,
                    token,
                    transform: packet.read()?,
                }
            }
            ClientPacket::AnimationChange => {
                let token = read_token(&mut packet, opts)?;
                Self::AnimationChange {
                    client_id,
                    token,
                    animation: packet.read()?,
                }
            }
            ClientPacket::BandwidthRequest => {
                let token = read_token(&mut packet, opts)?;
                Self::BandwidthRequest {
                    client_id,
                    token,
                    payload: packet.read()?,
                }
            }
            ClientPacket::ThroughputRequest => Self::ThroughputRequest {
                client_id,
                packet_id: packet.read()?,
                payload: packet.read()?,
            },
        };

        Ok(message)
    }
}

fn read_token(packet: &mut Packet, opts: WireOptions) -> Result<Option<String>> {
    if opts.auth_tokens {
        packet.read::<String>().map(Some)
    } else {
        Ok(None)
    }
}
