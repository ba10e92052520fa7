//! Shared value types carried by protocol messages.

use glam::{Quat, Vec3};

use crate::core::packet::{Decode, Encode, Packet};
use crate::error::{ProtocolError, Result};

/// Position and orientation of a user.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Transform {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Quat::IDENTITY)
    }
}

impl Encode for Transform {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.position.encode(buf);
        self.rotation.encode(buf);
    }
}

impl Decode for Transform {
    fn decode(packet: &mut Packet) -> Result<Self> {
        Ok(Self::new(packet.read()?, packet.read()?))
    }
}

/// Animator parameter kind, encoded as an `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum AnimationKind {
    Bool = 0,
    Float = 1,
    Trigger = 2,
}

impl TryFrom<i32> for AnimationKind {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::Bool),
            1 => Ok(Self::Float),
            2 => Ok(Self::Trigger),
            other => Err(ProtocolError::InvalidEnumValue("animation kind", other)),
        }
    }
}

/// One animator parameter change.
///
/// Bool parameters travel as `0.0`/`1.0`. Triggers still carry a value,
/// always `0.0`, so every kind has the same layout.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationParam {
    pub kind: AnimationKind,
    pub name: String,
    pub value: f32,
}

impl AnimationParam {
    pub fn boolean(name: impl Into<String>, value: bool) -> Self {
        Self {
            kind: AnimationKind::Bool,
            name: name.into(),
            value: if value { 1.0 } else { 0.0 },
        }
    }

    pub fn float(name: impl Into<String>, value: f32) -> Self {
        Self {
            kind: AnimationKind::Float,
            name: name.into(),
            value,
        }
    }

    pub fn trigger(name: impl Into<String>) -> Self {
        Self {
            kind: AnimationKind::Trigger,
            name: name.into(),
            value: 0.0,
        }
    }
}

impl Encode for AnimationParam {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.kind as i32).encode(buf);
        self.name.encode(buf);
        self.value.encode(buf);
    }
}

impl Decode for AnimationParam {
    fn decode(packet: &mut Packet) -> Result<Self> {
        let kind = AnimationKind::try_from(packet.read::<i32>()?)?;
        let name = packet.read::<String>()?;
        let value = packet.read::<f32>()?;
        Ok(Self { kind, name, value })
    }
}
