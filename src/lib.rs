//! # session-net
//!
//! Real-time client/server session networking over mixed TCP and UDP.
//!
//! A server admits up to `max_ccu` clients into numbered slots, greets each
//! one with a handshake that hands out an HMAC key and an auth token, and
//! routes chat, transform and animation updates between active clients.
//! Reliable traffic uses length-prefixed frames over TCP (optionally TLS);
//! latency probes, transform updates and throughput packets go over UDP.
//!
//! ## Layers
//! - [`core`]: packet buffer, field encoding and TCP framing
//! - [`protocol`]: typed messages, session lifecycle, dispatch queue
//! - [`transport`]: TCP, UDP and TLS plumbing
//! - [`service`]: [`Server`] and [`Client`]
//! - [`monitor`]: latency, loss, bandwidth and throughput probes
//!
//! ## Example
//! ```no_run
//! use session_net::{Client, ClientEvent, NetworkConfig, Server};
//!
//! # async fn run() -> session_net::Result<()> {
//! let server = Server::bind(NetworkConfig::default()).await?;
//! tokio::spawn(server.run());
//!
//! let (mut client, mut events) = Client::new(NetworkConfig::default());
//! client.connect().await?;
//! loop {
//!     client.tick()?;
//!     while let Ok(event) = events.try_recv() {
//!         if event == ClientEvent::Connected {
//!             client.send_message_all("hello")?;
//!         }
//!     }
//!     tokio::time::sleep(std::time::Duration::from_millis(20)).await;
//! }
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use core::packet::Packet;
pub use core::types::{AnimationKind, AnimationParam, Transform};
pub use error::{ProtocolError, Result};
pub use monitor::{QualityMonitor, QualityReport};
pub use protocol::message::{ClientMessage, ServerMessage, WireOptions};
pub use protocol::session::SessionState;
pub use service::{Client, ClientEvent, Server};
