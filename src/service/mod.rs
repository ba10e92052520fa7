//! # Service Layer
//!
//! The two ends of a session built on the transport and protocol layers.
//!
//! ## Components
//! - **Slot**: fixed pool of server-side connection slots, ids `1..=max_ccu`
//! - **Server**: listener tasks, handshake, routing and broadcast
//! - **Client**: connection handle with a command API and an event stream

pub mod client;
pub mod server;
pub mod slot;

pub use client::{Client, ClientEvent, ClientSession};
pub use server::{Server, ServerState};
pub use slot::{ConnectionSlot, SlotPool, SlotTicket};
