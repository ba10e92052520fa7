//! Fixed pool of connection slots.
//!
//! Slots are numbered `1..=max_ccu`; id 0 is never assigned and means
//! "nobody" on the wire. A slot is either empty or fully populated. When a
//! connection ends its slot is replaced by a fresh empty one, and every
//! population gets a new generation number so events from a dead connection
//! cannot reach the next occupant.

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::core::packet::Packet;
use crate::protocol::session::SessionState;
use crate::transport::tcp::{try_queue, Outbound, SendOutcome};
use crate::utils::crypto::HmacKey;
use crate::utils::token::AuthToken;

/// Identifies one occupant of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotTicket {
    pub id: i32,
    pub generation: u64,
}

#[derive(Debug)]
pub struct ConnectionSlot {
    pub id: i32,
    pub generation: u64,
    pub state: SessionState,
    pub peer: Option<SocketAddr>,
    pub username: Option<String>,
    pub udp_endpoint: Option<SocketAddr>,
    pub(crate) hmac_key: Option<HmacKey>,
    pub(crate) auth_token: Option<AuthToken>,
    outbound: Option<Outbound>,
    cancel: Option<CancellationToken>,
}

impl ConnectionSlot {
    pub fn empty(id: i32) -> Self {
        Self {
            id,
            generation: 0,
            state: SessionState::Idle,
            peer: None,
            username: None,
            udp_endpoint: None,
            hmac_key: None,
            auth_token: None,
            outbound: None,
            cancel: None,
        }
    }

    pub fn is_populated(&self) -> bool {
        self.outbound.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.is_populated() && self.state.is_active()
    }

    pub fn ticket(&self) -> SlotTicket {
        SlotTicket {
            id: self.id,
            generation: self.generation,
        }
    }

    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or("unknown")
    }

    /// Queue a packet on the TCP writer without waiting.
    pub fn send_tcp(&self, packet: Packet) -> SendOutcome {
        match &self.outbound {
            Some(tx) => try_queue(tx, packet),
            None => SendOutcome::Closed,
        }
    }

    /// Stop the reader so the connection task releases the slot.
    /// Returns false if it was already stopping.
    pub fn abort(&self) -> bool {
        match &self.cancel {
            Some(cancel) if !cancel.is_cancelled() => {
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Stop the reader. Queued packets still flush once the sender drops.
    fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.outbound = None;
    }
}

pub struct SlotPool {
    slots: Vec<ConnectionSlot>,
    next_generation: u64,
}

impl SlotPool {
    pub fn new(max_ccu: usize) -> Self {
        Self {
            slots: (1..=max_ccu as i32).map(ConnectionSlot::empty).collect(),
            next_generation: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Put a new connection into the first free slot.
    pub fn assign(
        &mut self,
        peer: SocketAddr,
        outbound: Outbound,
        cancel: CancellationToken,
    ) -> Option<SlotTicket> {
        let generation = self.next_generation;
        let slot = self.slots.iter_mut().find(|s| !s.is_populated())?;
        self.next_generation += 1;

        slot.generation = generation;
        slot.state = SessionState::Connecting;
        slot.peer = Some(peer);
        slot.outbound = Some(outbound);
        slot.cancel = Some(cancel);
        Some(slot.ticket())
    }

    pub fn get(&self, id: i32) -> Option<&ConnectionSlot> {
        if id < 1 {
            return None;
        }
        self.slots.get(id as usize - 1)
    }

    pub fn get_mut(&mut self, id: i32) -> Option<&mut ConnectionSlot> {
        if id < 1 {
            return None;
        }
        self.slots.get_mut(id as usize - 1)
    }

    /// The slot, if it is still held by the ticket's connection.
    pub fn by_ticket(&self, ticket: SlotTicket) -> Option<&ConnectionSlot> {
        self.get(ticket.id)
            .filter(|s| s.is_populated() && s.generation == ticket.generation)
    }

    pub fn by_ticket_mut(&mut self, ticket: SlotTicket) -> Option<&mut ConnectionSlot> {
        self.get_mut(ticket.id)
            .filter(|s| s.is_populated() && s.generation == ticket.generation)
    }

    /// Close the slot's connection and replace it with an empty slot.
    pub fn release(&mut self, id: i32) -> Option<ConnectionSlot> {
        let slot = self.get_mut(id)?;
        if !slot.is_populated() {
            return None;
        }
        let mut old = std::mem::replace(slot, ConnectionSlot::empty(id));
        old.close();
        Some(old)
    }

    pub fn populated(&self) -> impl Iterator<Item = &ConnectionSlot> {
        self.slots.iter().filter(|s| s.is_populated())
    }

    pub fn active(&self) -> impl Iterator<Item = &ConnectionSlot> {
        self.slots.iter().filter(|s| s.is_active())
    }

    pub fn populated_count(&self) -> usize {
        self.populated().count()
    }
}
