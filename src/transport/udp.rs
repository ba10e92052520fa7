//! # UDP Datagram Channel
//!
//! Unreliable channel for latency probes, transform updates and throughput
//! tests.
//!
//! ```text
//! client -> server:  [SlotId(4)] [Length(4)] [Payload(Length)]
//! hello:             [SlotId(4)]
//! server -> client:  [Length(4)] [Payload(Length)]
//! ```
//!
//! The server learns a client's UDP endpoint from its hello datagram and
//! afterwards accepts datagrams for that slot only from that endpoint.
//!
//! Each socket has one send task fed by a bounded queue. When the queue is
//! full the datagram is dropped, as the network would.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::packet::{Packet, HEADER_LEN};
use crate::error::{ProtocolError, Result};

/// Largest datagram the receive loops accept.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Datagrams waiting for a socket's send task.
pub const SEND_QUEUE_CAPACITY: usize = 4096;

/// A parsed client datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender_id: i32,
    /// `None` for a hello datagram
    pub frame: Option<Packet>,
}

/// Client to server datagram.
pub fn encode_envelope(sender_id: i32, packet: &Packet) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * HEADER_LEN + packet.len());
    out.extend_from_slice(&sender_id.to_le_bytes());
    out.extend_from_slice(&(packet.len() as i32).to_le_bytes());
    out.extend_from_slice(packet.as_bytes());
    out
}

/// Datagram announcing the client's UDP endpoint.
pub fn encode_hello(sender_id: i32) -> Vec<u8> {
    sender_id.to_le_bytes().to_vec()
}

pub fn parse_envelope(bytes: &[u8]) -> Result<Envelope> {
    let mut packet = Packet::from_bytes(bytes);
    let sender_id: i32 = packet.read()?;
    if packet.unread_len() == 0 {
        return Ok(Envelope {
            sender_id,
            frame: None,
        });
    }
    let frame = read_frame(&mut packet)?;
    Ok(Envelope { sender_id, frame })
}

/// Server to client datagram.
pub fn encode_datagram(packet: &Packet) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + packet.len());
    out.extend_from_slice(&(packet.len() as i32).to_le_bytes());
    out.extend_from_slice(packet.as_bytes());
    out
}

pub fn decode_datagram(bytes: &[u8]) -> Result<Packet> {
    let mut packet = Packet::from_bytes(bytes);
    read_frame(&mut packet)?.ok_or(ProtocolError::InvalidFrameLength)
}

fn read_frame(packet: &mut Packet) -> Result<Option<Packet>> {
    let len: i32 = packet.read()?;
    if len == 0 {
        return Ok(None);
    }
    if len < 0 || len as usize > packet.unread_len() {
        return Err(ProtocolError::InvalidFrameLength);
    }
    Ok(Some(Packet::from_bytes(packet.read_raw(len as usize)?)))
}

/// Queue feeding a socket's send task.
pub type DatagramSender = mpsc::Sender<(SocketAddr, Vec<u8>)>;

/// What happened to a datagram handed to [`try_send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queued {
    Yes,
    /// Dropped because the send queue is full
    Dropped,
    /// The send task has stopped
    Closed,
}

/// Queue a datagram without waiting.
pub fn try_send(sender: &DatagramSender, addr: SocketAddr, bytes: Vec<u8>) -> Queued {
    match sender.try_send((addr, bytes)) {
        Ok(()) => Queued::Yes,
        Err(TrySendError::Full(_)) => Queued::Dropped,
        Err(TrySendError::Closed(_)) => Queued::Closed,
    }
}

/// Spawn the single send task for `socket`.
pub fn spawn_sender(socket: Arc<UdpSocket>) -> DatagramSender {
    let (tx, mut rx) = mpsc::channel::<(SocketAddr, Vec<u8>)>(SEND_QUEUE_CAPACITY);
    tokio::spawn(async move {
        while let Some((addr, bytes)) = rx.recv().await {
            if let Err(e) = socket.send_to(&bytes, addr).await {
                warn!(%addr, error = %e, "UDP send failed");
            }
        }
        debug!("UDP sender stopped");
    });
    tx
}

/// Spawn the receive loop for `socket`, calling `on_datagram` for each one.
///
/// Receive errors are logged and the loop keeps going; on some platforms an
/// ICMP unreachable from one peer surfaces as a receive error.
pub fn spawn_receiver<F>(socket: Arc<UdpSocket>, cancel: CancellationToken, mut on_datagram: F)
where
    F: FnMut(&[u8], SocketAddr) + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => on_datagram(&buf[..n], from),
                    Err(e) => debug!(error = %e, "UDP receive error"),
                },
            }
        }
        debug!("UDP receiver stopped");
    });
}
