//! # TCP Connection Driver
//!
//! Runs one framed TCP (or TLS-over-TCP) connection.
//!
//! The stream is split in two. A writer task drains a bounded channel of
//! outbound packets into a `FramedWrite`; it keeps running until every
//! sender is dropped, so packets queued just before a disconnect are still
//! flushed. Producers use `try_send` and never wait on a slow peer; a full
//! queue is reported as [`QueueFull`](SendOutcome::QueueFull), and a frame
//! the peer does not accept within [`DEFAULT_TIMEOUT`] ends the writer. The reader decodes frames with [`FrameCodec`] and hands each one
//! to a callback until the peer closes, a frame is malformed, or the
//! connection's [`CancellationToken`] fires.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::codec::FrameCodec;
use crate::core::packet::Packet;
use crate::error::ProtocolError;
use crate::utils::timeout::{with_timeout_error, DEFAULT_TIMEOUT};

/// Packets a connection may have queued before it counts as stalled.
pub const OUTBOUND_CAPACITY: usize = 1024;

/// Any byte stream a session can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A plain or TLS stream behind one type.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Sending side of a connection's outbound queue.
pub type Outbound = mpsc::Sender<Packet>;

/// Receiving side, owned by the writer task.
pub type OutboundReceiver = mpsc::Receiver<Packet>;

pub fn outbound_channel() -> (Outbound, OutboundReceiver) {
    outbound_channel_with_capacity(OUTBOUND_CAPACITY)
}

pub fn outbound_channel_with_capacity(capacity: usize) -> (Outbound, OutboundReceiver) {
    mpsc::channel(capacity)
}

/// Result of queueing one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// The peer is not draining its queue
    QueueFull,
    /// The writer has stopped
    Closed,
}

/// Queue `packet` without waiting.
pub fn try_queue(outbound: &Outbound, packet: Packet) -> SendOutcome {
    match outbound.try_send(packet) {
        Ok(()) => SendOutcome::Queued,
        Err(TrySendError::Full(_)) => SendOutcome::QueueFull,
        Err(TrySendError::Closed(_)) => SendOutcome::Closed,
    }
}

/// Why the read side stopped.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed the stream
    PeerClosed,
    /// The local side cancelled the connection
    Cancelled,
    /// Read or framing error
    Error(ProtocolError),
}

/// Drive `stream` until it closes.
///
/// `on_packet` runs on the reader task for every decoded frame. A write
/// failure cancels `cancel` so the reader stops as well.
pub async fn run_connection<S, F>(
    stream: S,
    outbound: OutboundReceiver,
    cancel: CancellationToken,
    max_frame_size: usize,
    mut on_packet: F,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: FnMut(Packet),
{
    let codec = FrameCodec::new(max_frame_size);
    let (read_half, write_half) = tokio::io::split(stream);

    tokio::spawn(write_loop(write_half, outbound, codec, cancel.clone()));

    let mut reader = FramedRead::new(read_half, codec);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return CloseReason::Cancelled,
            frame = reader.next() => match frame {
                Some(Ok(packet)) => on_packet(packet),
                Some(Err(e)) => return CloseReason::Error(e),
                None => return CloseReason::PeerClosed,
            },
        }
    }
}

async fn write_loop<S>(
    write_half: WriteHalf<S>,
    mut outbound: OutboundReceiver,
    codec: FrameCodec,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite,
{
    let mut writer = FramedWrite::new(write_half, codec);

    while let Some(packet) = outbound.recv().await {
        if let Err(e) = with_timeout_error(writer.send(packet), DEFAULT_TIMEOUT).await {
            warn!(error = %e, "Write failed, closing connection");
            cancel.cancel();
            return;
        }
    }

    if let Err(e) = writer.close().await {
        debug!(error = %e, "Error while closing stream");
    }
}
