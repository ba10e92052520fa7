//! Session lifecycle shared by server slots and the client.
//!
//! ```text
//! Idle -> Connecting -> Handshaking -> Active -> Disconnected
//!              |             |                       |
//!              +-------------+--> Disconnected       +--> Connecting (reconnect)
//! ```

use std::fmt;

use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Idle,
    /// TCP (and TLS) being established
    Connecting,
    /// Welcome sent or received; waiting for the acknowledgement
    Handshaking,
    /// Handshake complete; messages are routed
    Active,
    Disconnected,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Active => "active",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Handshaking)
                | (Connecting, Disconnected)
                | (Handshaking, Active)
                | (Handshaking, Disconnected)
                | (Active, Disconnected)
                | (Disconnected, Connecting)
        )
    }

    /// Move to `next`, rejecting moves outside the lifecycle.
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(ProtocolError::InvalidTransition {
                from: self.name(),
                to: next.name(),
            });
        }
        *self = next;
        Ok(())
    }

    pub fn is_active(self) -> bool {
        self == Self::Active
    }

    /// Connecting, handshaking or active.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Handshaking | Self::Active)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
