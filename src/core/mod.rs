//! # Core Protocol Components
//!
//! Packet buffers, stream framing and the value types they carry.
//!
//! ## Components
//! - **Packet**: little-endian field writer/reader with a read cursor
//! - **Codec**: tokio codec splitting a byte stream into length-prefixed frames
//! - **Types**: transforms and animator parameters
//!
//! ## Wire Format
//! ```text
//! TCP:              [Length(4)] [Type(4)] [Fields(N)] [HMAC(32), optional]
//! UDP client->srv:  [SlotId(4)] [Length(4)] [Type(4)] [Fields(N)]
//! UDP srv->client:  [Length(4)] [Type(4)] [Fields(N)]
//! ```
//!
//! ## Security
//! - Maximum frame size: 16MB by default (prevents memory exhaustion)
//! - Length validation before allocation

pub mod codec;
pub mod packet;
pub mod types;
