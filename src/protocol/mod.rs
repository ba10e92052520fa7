//! # Protocol Layer
//!
//! Message definitions, the session lifecycle and the dispatch queue that
//! moves network events onto the thread owning session state.
//!
//! ## Components
//! - **Message**: typed server and client messages with their wire layout
//! - **Session**: `Idle -> Connecting -> Handshaking -> Active -> Disconnected`
//! - **Dispatcher**: lock-protected FIFO of actions drained once per tick

pub mod dispatcher;
pub mod message;
pub mod session;
