//! # Transport Layer
//!
//! Byte movement for a session.
//!
//! ## Transports
//! - **TCP**: framed, ordered, reliable; optionally wrapped in TLS
//! - **UDP**: best-effort datagrams on the same port as TCP
//!
//! Decoding happens on the I/O tasks; everything that touches session state
//! is handed to the dispatch queue.

pub mod tcp;
pub mod tls;
pub mod udp;
