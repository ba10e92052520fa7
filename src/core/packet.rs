//! # Packet
//!
//! Append-only byte buffer with an independent read cursor.
//!
//! All scalars are little-endian. Strings and blobs carry a 4-byte signed
//! length prefix. A vector is three `f32`, a quaternion four (`x y z w`).
//!
//! ```text
//! [len: i32][type: i32][fields...][hmac: 32 bytes, optional]
//! ```
//!
//! The length header is added last by [`Packet::prepend_length`] or by the
//! frame codec, so the HMAC tag (when present) covers the type and fields
//! but not the length.

use glam::{Quat, Vec3};

use crate::error::{ProtocolError, Result};

/// Size in bytes of an HMAC-SHA256 tag.
pub const HMAC_TAG_LEN: usize = 32;

/// Size in bytes of a length or id header.
pub const HEADER_LEN: usize = 4;

/// Values that can be appended to a packet.
pub trait Encode {
    fn encode(&self, buf: &mut Vec<u8>);
}

/// Values that can be read back from a packet.
pub trait Decode: Sized {
    fn decode(packet: &mut Packet) -> Result<Self>;
}

/// A single protocol message buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    buffer: Vec<u8>,
    read_pos: usize,
}

impl Packet {
    /// Empty packet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Packet whose first field is the message type tag.
    pub fn with_type(tag: i32) -> Self {
        let mut packet = Self::new();
        packet.write(&tag);
        packet
    }

    /// Packet for reading received bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_vec(bytes.to_vec())
    }

    pub fn from_vec(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            read_pos: 0,
        }
    }

    /// Append a value.
    pub fn write<T: Encode + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.encode(&mut self.buffer);
        self
    }

    /// Append bytes without a length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(bytes);
        self
    }

    /// Read a value at the cursor.
    ///
    /// On failure the cursor is left where it was.
    pub fn read<T: Decode>(&mut self) -> Result<T> {
        let start = self.read_pos;
        let result = T::decode(self);
        if result.is_err() {
            self.read_pos = start;
        }
        result
    }

    /// Take `len` raw bytes at the cursor.
    pub fn read_raw(&mut self, len: usize) -> Result<&[u8]> {
        self.take(len, "bytes")
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&[u8]> {
        let available = self.unread_len();
        if len > available {
            return Err(ProtocolError::Decode {
                field,
                needed: len,
                available,
            });
        }
        let start = self.read_pos;
        self.read_pos += len;
        Ok(&self.buffer[start..start + len])
    }

    fn take_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    fn take_prefixed(&mut self, field: &'static str) -> Result<&[u8]> {
        let len = i32::from_le_bytes(self.take_array::<4>(field)?);
        if len < 0 {
            return Err(ProtocolError::InvalidLength(field, len));
        }
        self.take(len as usize, field)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn unread_len(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Copy of the current contents. Calling it twice yields equal bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.buffer.clone()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }

    /// Insert the current total length as a 4-byte header.
    pub fn prepend_length(&mut self) -> &mut Self {
        let len = self.buffer.len() as i32;
        self.insert_header(len)
    }

    /// Insert a sender or recipient id as a 4-byte header.
    pub fn prepend_recipient(&mut self, id: i32) -> &mut Self {
        self.insert_header(id)
    }

    fn insert_header(&mut self, value: i32) -> &mut Self {
        self.buffer.splice(0..0, value.to_le_bytes());
        self
    }

    /// Split into signed content and trailing HMAC tag.
    pub fn split_hmac(&self) -> Option<(&[u8], &[u8])> {
        if self.buffer.len() < HMAC_TAG_LEN {
            return None;
        }
        Some(self.buffer.split_at(self.buffer.len() - HMAC_TAG_LEN))
    }

    pub fn content_without_hmac(&self) -> Option<&[u8]> {
        self.split_hmac().map(|(content, _)| content)
    }

    pub fn hmac_tag(&self) -> Option<&[u8]> {
        self.split_hmac().map(|(_, tag)| tag)
    }

    /// Drop the trailing HMAC tag so field decoding stops before it.
    pub fn strip_hmac(&mut self) -> Result<Vec<u8>> {
        if self.buffer.len() < HMAC_TAG_LEN {
            return Err(ProtocolError::IntegrityFailure(
                crate::error::constants::ERR_MISSING_HMAC,
            ));
        }
        let tag = self.buffer.split_off(self.buffer.len() - HMAC_TAG_LEN);
        self.read_pos = self.read_pos.min(self.buffer.len());
        Ok(tag)
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, buf: &mut Vec<u8>) {
        (**self).encode(buf)
    }
}

impl Encode for i32 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }
}

impl Decode for i32 {
    fn decode(packet: &mut Packet) -> Result<Self> {
        Ok(i32::from_le_bytes(packet.take_array("i32")?))
    }
}

impl Encode for f32 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }
}

impl Decode for f32 {
    fn decode(packet: &mut Packet) -> Result<Self> {
        Ok(f32::from_le_bytes(packet.take_array("f32")?))
    }
}

impl Encode for bool {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(u8::from(*self));
    }
}

impl Decode for bool {
    fn decode(packet: &mut Packet) -> Result<Self> {
        Ok(packet.take_array::<1>("bool")?[0] != 0)
    }
}

impl Encode for u8 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(*self);
    }
}

impl Decode for u8 {
    fn decode(packet: &mut Packet) -> Result<Self> {
        Ok(packet.take_array::<1>("u8")?[0])
    }
}

impl Encode for str {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.len() as i32).encode(buf);
        buf.extend_from_slice(self.as_bytes());
    }
}

impl Encode for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.as_str().encode(buf)
    }
}

impl Decode for String {
    fn decode(packet: &mut Packet) -> Result<Self> {
        let bytes = packet.take_prefixed("string")?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

impl Encode for [u8] {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.len() as i32).encode(buf);
        buf.extend_from_slice(self);
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.as_slice().encode(buf)
    }
}

impl Decode for Vec<u8> {
    fn decode(packet: &mut Packet) -> Result<Self> {
        Ok(packet.take_prefixed("blob")?.to_vec())
    }
}

impl Encode for Vec3 {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.x.encode(buf);
        self.y.encode(buf);
        self.z.encode(buf);
    }
}

impl Decode for Vec3 {
    fn decode(packet: &mut Packet) -> Result<Self> {
        let raw: [u8; 12] = packet.take_array("vec3")?;
        let f = |i: usize| f32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Ok(Vec3::new(f(0), f(4), f(8)))
    }
}

impl Encode for Quat {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.x.encode(buf);
        self.y.encode(buf);
        self.z.encode(buf);
        self.w.encode(buf);
    }
}

impl Decode for Quat {
    fn decode(packet: &mut Packet) -> Result<Self> {
        let raw: [u8; 16] = packet.take_array("quat")?;
        let f = |i: usize| f32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Ok(Quat::from_xyzw(f(0), f(4), f(8), f(12)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_layout_is_little_endian() {
        let mut packet = Packet::new();
        packet.write(&1i32).write(&true).write(&0x7fu8);
        assert_eq!(packet.as_bytes(), &[1, 0, 0, 0, 1, 0x7f]);
    }

    #[test]
    fn string_has_length_prefix() {
        let mut packet = Packet::new();
        packet.write("hi");
        assert_eq!(packet.as_bytes(), &[2, 0, 0, 0, b'h', b'i']);
        assert_eq!(packet.read::<String>().unwrap(), "hi");
        assert_eq!(packet.unread_len(), 0);
    }

    #[test]
    fn mixed_fields_round_trip() {
        let mut packet = Packet::with_type(9);
        packet
            .write(&-17i32)
            .write(&2.5f32)
            .write(&false)
            .write("héllo")
            .write(&vec![1u8, 2, 3])
            .write(&Vec3::new(1.0, -2.0, 3.5))
            .write(&Quat::from_xyzw(0.0, 0.0, 0.0, 1.0));

        let mut read = Packet::from_bytes(packet.as_bytes());
        assert_eq!(read.read::<i32>().unwrap(), 9);
        assert_eq!(read.read::<i32>().unwrap(), -17);
        assert_eq!(read.read::<f32>().unwrap(), 2.5);
        assert!(!read.read::<bool>().unwrap());
        assert_eq!(read.read::<String>().unwrap(), "héllo");
        assert_eq!(read.read::<Vec<u8>>().unwrap(), vec![1, 2, 3]);
        assert_eq!(read.read::<Vec3>().unwrap(), Vec3::new(1.0, -2.0, 3.5));
        assert_eq!(read.read::<Quat>().unwrap(), Quat::IDENTITY);
        assert_eq!(read.unread_len(), 0);
    }

    #[test]
    fn read_past_end_keeps_cursor() {
        let mut packet = Packet::from_bytes(&[5, 0, 0, 0, b'a']);
        let err = packet.read::<String>().unwrap_err();
        assert!(matches!(err, ProtocolError::Decode { needed: 5, available: 1, .. }));
        assert_eq!(packet.read_position(), 0);
        assert_eq!(packet.read::<i32>().unwrap(), 5);
    }

    #[test]
    fn negative_string_length_is_rejected() {
        let mut packet = Packet::new();
        packet.write(&-3i32);
        assert!(matches!(
            packet.read::<String>(),
            Err(ProtocolError::InvalidLength("string", -3))
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut packet = Packet::new();
        packet.write(&vec![0xffu8, 0xfe]);
        assert!(matches!(
            packet.read::<String>(),
            Err(ProtocolError::InvalidUtf8)
        ));
    }

    #[test]
    fn headers_are_prepended() {
        let mut packet = Packet::with_type(3);
        packet.prepend_length();
        assert_eq!(packet.as_bytes(), &[4, 0, 0, 0, 3, 0, 0, 0]);
        packet.prepend_recipient(7);
        assert_eq!(&packet.as_bytes()[..4], &[7, 0, 0, 0]);
        assert_eq!(packet.to_bytes(), packet.to_bytes());
    }

    #[test]
    fn hmac_split_and_strip() {
        let mut packet = Packet::with_type(2);
        packet.write_raw(&[0xaa; HMAC_TAG_LEN]);
        let (content, tag) = packet.split_hmac().unwrap();
        assert_eq!(content, &[2, 0, 0, 0]);
        assert_eq!(tag, &[0xaa; HMAC_TAG_LEN]);

        let stripped = packet.strip_hmac().unwrap();
        assert_eq!(stripped, vec![0xaa; HMAC_TAG_LEN]);
        assert_eq!(packet.len(), 4);
        assert!(Packet::from_bytes(&[1, 2]).strip_hmac().is_err());
    }
}
