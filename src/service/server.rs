//! # Session Server
//!
//! Accepts TCP (optionally TLS) connections and a shared UDP socket, assigns
//! each connection a slot, runs the welcome handshake and routes client
//! requests between slots.
//!
//! ## Threading
//! I/O tasks only decode bytes. Every change to session state happens inside
//! an action queued on the [`Dispatcher`] and executed by the server loop on
//! its tick, which owns the [`ServerState`].
//!
//! ## Handshake
//! 1. TCP accepted, slot assigned (`Connecting`), TLS handshake if enabled
//! 2. Server sends `Welcome`, then `HmacKey` and `AuthToken` when enabled (`Handshaking`)
//! 3. Client answers `WelcomeAck` with its username (`Active`)
//! 4. Newcomer learns every active user; everyone learns the newcomer

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::NetworkConfig;
use crate::error::{constants, ErrorCategory, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::message::{ClientMessage, Delivery, ServerMessage, WireOptions};
use crate::protocol::session::SessionState;
use crate::service::slot::{ConnectionSlot, SlotPool, SlotTicket};
use crate::transport::tcp::{
    outbound_channel, run_connection, BoxedStream, CloseReason, Outbound, SendOutcome,
};
use crate::transport::tls::{self, TlsServerConfig};
use crate::transport::udp::{self, DatagramSender, Queued};
use crate::utils::crypto::HmacKey;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{with_timeout_error, DEFAULT_TIMEOUT};
use crate::utils::token::AuthToken;

type ServerQueue = Dispatcher<ServerState>;

/// Session state owned by the server loop.
pub struct ServerState {
    opts: WireOptions,
    allow_udp: bool,
    welcome_message: String,
    pool: SlotPool,
    udp: Option<DatagramSender>,
    metrics: Arc<Metrics>,
}

impl ServerState {
    pub fn new(config: &NetworkConfig, udp: Option<DatagramSender>, metrics: Arc<Metrics>) -> Self {
        Self {
            opts: config.wire_options(),
            allow_udp: config.network.allow_udp,
            welcome_message: if config.server.send_welcome_message {
                config.server.welcome_message.clone()
            } else {
                String::new()
            },
            pool: SlotPool::new(config.server.max_ccu),
            udp,
            metrics,
        }
    }

    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Give a new connection a slot, or refuse it when all are taken.
    pub fn admit(
        &mut self,
        peer: SocketAddr,
        outbound: Outbound,
        cancel: CancellationToken,
    ) -> Result<SlotTicket> {
        match self.pool.assign(peer, outbound, cancel) {
            Some(ticket) => {
                self.metrics.connection_admitted();
                info!(slot = ticket.id, %peer, "Connection assigned to slot");
                Ok(ticket)
            }
            None => {
                self.metrics.connection_rejected();
                warn!(%peer, capacity = self.pool.capacity(), "{}", constants::ERR_SERVER_FULL);
                Err(ProtocolError::CapacityExceeded(self.pool.capacity()))
            }
        }
    }

    /// Issue credentials and send the welcome sequence.
    pub fn begin_handshake(&mut self, ticket: SlotTicket) -> Result<()> {
        let key = HmacKey::generate()?;
        let token = AuthToken::generate();
        let opts = self.opts;

        let slot = self
            .pool
            .by_ticket_mut(ticket)
            .ok_or(ProtocolError::ConnectionClosed)?;
        slot.state.transition(SessionState::Handshaking)?;

        let welcome = ServerMessage::Welcome {
            greeting: self.welcome_message.clone(),
            client_id: ticket.id,
        };
        let key_msg = ServerMessage::HmacKey {
            key: key.as_bytes().to_vec(),
        };
        let token_msg = ServerMessage::AuthToken {
            token: token.as_str().to_string(),
            client_id: ticket.id,
        };
        slot.hmac_key = Some(key);
        slot.auth_token = Some(token);

        self.send_to(ticket.id, &welcome);
        if opts.hmac {
            self.send_to(ticket.id, &key_msg);
        }
        if opts.auth_tokens {
            self.send_to(ticket.id, &token_msg);
        }
        debug!(slot = ticket.id, "Welcome sequence sent");
        Ok(())
    }

    /// Route one client request.
    pub fn handle_message(&mut self, ticket: SlotTicket, msg: ClientMessage) -> Result<()> {
        let Some(slot) = self.pool.by_ticket(ticket) else {
            trace!(slot = ticket.id, "Ignoring message from a closed connection");
            return Ok(());
        };
        let id = slot.id;

        if msg.client_id() != id {
            self.metrics.authorization_failure();
            warn!(slot = id, claimed = msg.client_id(), "{}", constants::ERR_ID_MISMATCH);
            return Err(ProtocolError::Unauthorized(constants::ERR_ID_MISMATCH.into()));
        }

        if self.opts.auth_tokens && msg.carries_token() {
            let presented = msg.token().unwrap_or("");
            let valid = slot
                .auth_token
                .as_ref()
                .is_some_and(|t| t.matches(presented));
            if !valid {
                self.metrics.authorization_failure();
                warn!(slot = id, kind = ?msg.packet_type(), "{}", constants::ERR_TOKEN_MISMATCH);
                return Err(ProtocolError::Unauthorized(
                    constants::ERR_TOKEN_MISMATCH.into(),
                ));
            }
        }

        if let ClientMessage::WelcomeAck { username, .. } = msg {
            return self.complete_handshake(id, username);
        }

        if !slot.is_active() {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "{:?} before handshake completed",
                msg.packet_type()
            )));
        }

        match msg {
            ClientMessage::WelcomeAck { .. } => Ok(()),
            ClientMessage::LatencyRequest { ping_id, .. } => {
                self.send_to(
                    id,
                    &ServerMessage::LatencyReply {
                        client_id: id,
                        ping_id,
                    },
                );
                Ok(())
            }
            ClientMessage::DisconnectRequest { .. } => {
                let name = slot.display_name().to_string();
                info!(slot = id, user = %name, "Client requested disconnect");
                self.send_to_active(
                    &ServerMessage::MessageAll {
                        text: format!("Server message: {name} has disconnected"),
                        sender_id: id,
                    },
                    Some(id),
                );
                self.disconnect(id);
                Ok(())
            }
            ClientMessage::MessageToUser {
                target_id, text, ..
            } => {
                if !self.pool.get(target_id).is_some_and(ConnectionSlot::is_active) {
                    return Err(ProtocolError::UnexpectedMessage(format!(
                        "message for unknown user {target_id}"
                    )));
                }
                self.send_to(
                    target_id,
                    &ServerMessage::Message {
                        text,
                        sender_id: id,
                    },
                );
                Ok(())
            }
            ClientMessage::MessageToAll { text, .. } => {
                self.send_to_active(
                    &ServerMessage::MessageAll {
                        text,
                        sender_id: id,
                    },
                    Some(id),
                );
                Ok(())
            }
            ClientMessage::TransformChange { transform, .. } => {
                self.send_to_active(
                    &ServerMessage::TransformUpdate {
                        client_id: id,
                        transform,
                    },
                    None,
                );
                Ok(())
            }
            ClientMessage::AnimationChange { animation, .. } => {
                self.send_to_active(
                    &ServerMessage::AnimationUpdate {
                        client_id: id,
                        animation,
                    },
                    None,
                );
                Ok(())
            }
            ClientMessage::BandwidthRequest { payload, .. } => {
                debug!(slot = id, bytes = payload.len(), "Bandwidth probe received");
                self.send_to(id, &ServerMessage::BandwidthReply { client_id: id });
                Ok(())
            }
            ClientMessage::ThroughputRequest {
                packet_id, payload, ..
            } => {
                self.send_to(
                    id,
                    &ServerMessage::ThroughputReply {
                        packet_id,
                        size: payload.len() as i32,
                    },
                );
                Ok(())
            }
        }
    }

    fn complete_handshake(&mut self, id: i32, username: String) -> Result<()> {
        let slot = self
            .pool
            .get_mut(id)
            .ok_or(ProtocolError::ConnectionClosed)?;
        if slot.state != SessionState::Handshaking {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "welcome acknowledgement in state {}",
                slot.state
            )));
        }
        slot.state.transition(SessionState::Active)?;
        slot.username = Some(username.clone());
        let peer = slot.peer;
        self.metrics.handshake_completed();
        info!(slot = id, peer = ?peer, user = %username, "Client connected and active");

        let others: Vec<(i32, String)> = self
            .pool
            .active()
            .filter(|s| s.id != id)
            .map(|s| (s.id, s.display_name().to_string()))
            .collect();
        for (other_id, other_name) in others {
            self.send_to(
                id,
                &ServerMessage::SpawnUser {
                    client_id: other_id,
                    username: other_name,
                },
            );
        }

        self.send_to_active(
            &ServerMessage::SpawnUser {
                client_id: id,
                username: username.clone(),
            },
            None,
        );
        self.send_to_active(
            &ServerMessage::MessageAll {
                text: format!("Server message: {username} has connected"),
                sender_id: id,
            },
            Some(id),
        );
        Ok(())
    }

    /// Handle a datagram already parsed on the UDP task.
    ///
    /// The first datagram for a slot records its endpoint and is otherwise
    /// ignored. Later datagrams are accepted only from that endpoint.
    pub fn handle_datagram(
        &mut self,
        from: SocketAddr,
        sender_id: i32,
        message: Option<ClientMessage>,
    ) -> Result<()> {
        let Some(slot) = self.pool.get_mut(sender_id).filter(|s| s.is_populated()) else {
            self.metrics.datagram_dropped();
            trace!(slot = sender_id, %from, "Datagram for an empty slot");
            return Ok(());
        };

        match slot.udp_endpoint {
            None => {
                slot.udp_endpoint = Some(from);
                debug!(slot = sender_id, endpoint = %from, "UDP endpoint bound");
                Ok(())
            }
            Some(endpoint) if endpoint != from => {
                self.metrics.datagram_dropped();
                warn!(slot = sender_id, %from, bound = %endpoint, "Datagram from unexpected endpoint");
                Ok(())
            }
            Some(_) => match message {
                Some(msg) => {
                    let ticket = slot.ticket();
                    self.handle_message(ticket, msg)
                }
                None => Ok(()),
            },
        }
    }

    /// Disconnect a slot: notify everyone (the leaver included), close its
    /// sockets and reset the slot. Returns false if it was already empty.
    pub fn disconnect(&mut self, id: i32) -> bool {
        let Some(slot) = self.pool.get(id).filter(|s| s.is_populated()) else {
            debug!(slot = id, "Slot already disconnected");
            return false;
        };
        info!(slot = id, peer = ?slot.peer, user = %slot.display_name(), "Client disconnected");

        let notice = ServerMessage::DisconnectUser { client_id: id };
        for other in self.pool.populated() {
            if other.state != SessionState::Connecting {
                self.send_to_slot(other, &notice);
            }
        }

        self.pool.release(id);
        self.metrics.connection_closed();
        true
    }

    /// Disconnect only if the slot still belongs to the ticket's connection.
    pub fn disconnect_ticket(&mut self, ticket: SlotTicket) -> bool {
        if self.pool.by_ticket(ticket).is_none() {
            return false;
        }
        self.disconnect(ticket.id)
    }

    pub fn shutdown_all(&mut self) {
        let ids: Vec<i32> = self.pool.populated().map(|s| s.id).collect();
        for id in ids {
            self.disconnect(id);
        }
    }

    fn send_to(&self, id: i32, msg: &ServerMessage) {
        if let Some(slot) = self.pool.get(id).filter(|s| s.is_populated()) {
            self.send_to_slot(slot, msg);
        }
    }

    fn send_to_active(&self, msg: &ServerMessage, except: Option<i32>) {
        for slot in self.pool.active() {
            if Some(slot.id) != except {
                self.send_to_slot(slot, msg);
            }
        }
    }

    /// Sign with the recipient's key and pick UDP or TCP.
    fn send_to_slot(&self, slot: &ConnectionSlot, msg: &ServerMessage) {
        let key = if self.opts.hmac {
            slot.hmac_key.as_ref()
        } else {
            None
        };
        let packet = match msg.to_packet(key) {
            Ok(packet) => packet,
            Err(e) => {
                error!(slot = slot.id, error = %e, "Failed to encode message");
                return;
            }
        };
        let bytes = packet.len() as u64;

        if msg.delivery() == Delivery::Unreliable && self.allow_udp {
            if let (Some(udp), Some(endpoint)) = (&self.udp, slot.udp_endpoint) {
                match udp::try_send(udp, endpoint, udp::encode_datagram(&packet)) {
                    Queued::Yes => {
                        self.metrics.message_sent(bytes);
                        return;
                    }
                    Queued::Dropped => {
                        self.metrics.datagram_dropped();
                        trace!(slot = slot.id, "UDP send queue full, datagram dropped");
                        return;
                    }
                    Queued::Closed => debug!(slot = slot.id, "UDP sender closed, using TCP"),
                }
            }
        }

        match slot.send_tcp(packet) {
            SendOutcome::Queued => self.metrics.message_sent(bytes),
            SendOutcome::QueueFull => {
                if slot.abort() {
                    self.metrics.connection_error();
                    warn!(slot = slot.id, "Outbound queue full, dropping stalled connection");
                }
            }
            SendOutcome::Closed => debug!(slot = slot.id, "TCP writer already closed"),
        }
    }
}

/// A bound server, ready to run.
pub struct Server {
    config: NetworkConfig,
    listener: TcpListener,
    udp: Option<Arc<UdpSocket>>,
    tls: Option<TlsAcceptor>,
    metrics: Arc<Metrics>,
}

impl Server {
    /// Validate the configuration and bind TCP, then UDP on the same port.
    #[instrument(skip(config))]
    pub async fn bind(config: NetworkConfig) -> Result<Self> {
        config.validate_strict()?;

        let listener = TcpListener::bind(config.network.listen_addr()?).await?;
        let local = listener.local_addr()?;

        let udp = if config.network.allow_udp {
            Some(Arc::new(UdpSocket::bind(local).await?))
        } else {
            None
        };

        let tls = if config.security.use_tls {
            Some(TlsServerConfig::from_security(&config.security)?.acceptor()?)
        } else {
            None
        };

        info!(
            address = %local,
            udp = udp.is_some(),
            tls = tls.is_some(),
            max_ccu = config.server.max_ccu,
            "Server listening"
        );

        Ok(Self {
            config,
            listener,
            udp,
            tls,
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Run until CTRL+C.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
        });
        self.run_with_shutdown(shutdown_rx).await
    }

    /// Run until `shutdown_rx` yields or every sender is dropped.
    pub async fn run_with_shutdown(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let queue: Arc<ServerQueue> = Arc::new(Dispatcher::new());
        let shutdown = CancellationToken::new();
        let opts = self.config.wire_options();
        let max_frame_size = self.config.server.max_frame_size;

        let udp_sender = self.udp.as_ref().map(|socket| udp::spawn_sender(socket.clone()));
        if let Some(socket) = &self.udp {
            spawn_udp_listener(socket.clone(), queue.clone(), shutdown.clone(), opts, self.metrics.clone());
        }

        let mut state = ServerState::new(&self.config, udp_sender, self.metrics.clone());
        let mut tick = tokio::time::interval(self.config.server.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutting down server");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.metrics.connection_accepted();
                        let conn = ConnectionContext {
                            queue: queue.clone(),
                            tls: self.tls.clone(),
                            shutdown: shutdown.clone(),
                            metrics: self.metrics.clone(),
                            opts,
                            max_frame_size,
                        };
                        tokio::spawn(conn.serve(stream, peer));
                    }
                    Err(e) => {
                        self.metrics.connection_error();
                        error!(error = %e, "Error accepting connection");
                    }
                },
                _ = tick.tick() => {
                    if let Err(e) = queue.drain(&mut state) {
                        error!(error = %e, "Dispatch queue drain failed");
                    }
                }
            }
        }

        if let Err(e) = queue.drain(&mut state) {
            error!(error = %e, "Dispatch queue drain failed");
        }
        state.shutdown_all();
        shutdown.cancel();
        self.metrics.log_metrics();
        Ok(())
    }
}

fn spawn_udp_listener(
    socket: Arc<UdpSocket>,
    queue: Arc<ServerQueue>,
    shutdown: CancellationToken,
    opts: WireOptions,
    metrics: Arc<Metrics>,
) {
    udp::spawn_receiver(socket, shutdown, move |bytes, from| {
        let envelope = match udp::parse_envelope(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics.datagram_dropped();
                trace!(%from, error = %e, "Malformed datagram");
                return;
            }
        };
        if envelope.sender_id <= 0 {
            metrics.datagram_dropped();
            return;
        }

        let message = match envelope.frame {
            None => None,
            Some(frame) => match ClientMessage::decode(frame, opts) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    metrics.protocol_error();
                    warn!(slot = envelope.sender_id, %from, error = %e, "Dropping malformed datagram");
                    return;
                }
            },
        };
        metrics.message_received(bytes.len() as u64);

        let sender_id = envelope.sender_id;
        let queued = queue.enqueue(move |state: &mut ServerState| {
            if let Err(e) = state.handle_datagram(from, sender_id, message) {
                log_rejection(sender_id, &e);
            }
        });
        if let Err(e) = queued {
            error!(error = %e, "Failed to queue datagram");
        }
    });
}

fn log_rejection(slot: i32, err: &ProtocolError) {
    match err.category() {
        ErrorCategory::Authorization => warn!(slot, error = %err, "Request rejected"),
        _ => debug!(slot, error = %err, "Request ignored"),
    }
}

struct ConnectionContext {
    queue: Arc<ServerQueue>,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
    metrics: Arc<Metrics>,
    opts: WireOptions,
    max_frame_size: usize,
}

impl ConnectionContext {
    #[instrument(skip_all, fields(peer = %peer))]
    async fn serve(self, stream: TcpStream, peer: SocketAddr) {
        let (outbound, outbound_rx) = outbound_channel();
        let cancel = self.shutdown.child_token();

        let (reply_tx, reply_rx) = oneshot::channel();
        let slot_cancel = cancel.clone();
        let queued = self.queue.enqueue(move |state: &mut ServerState| {
            let _ = reply_tx.send(state.admit(peer, outbound, slot_cancel));
        });
        if queued.is_err() {
            return;
        }

        let ticket = tokio::select! {
            reply = reply_rx => match reply {
                Ok(Ok(ticket)) => ticket,
                Ok(Err(e)) => {
                    info!(error = %e, "Connection refused");
                    return;
                }
                Err(_) => return,
            },
            _ = self.shutdown.cancelled() => return,
        };

        let stream: BoxedStream = match &self.tls {
            Some(acceptor) => {
                match with_timeout_error(tls::accept(acceptor, stream), DEFAULT_TIMEOUT).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        self.metrics.connection_error();
                        warn!(slot = ticket.id, error = %e, "TLS handshake failed");
                        self.release(ticket);
                        return;
                    }
                }
            }
            None => Box::new(stream),
        };

        let queued = self.queue.enqueue(move |state: &mut ServerState| {
            if let Err(e) = state.begin_handshake(ticket) {
                warn!(slot = ticket.id, error = %e, "Handshake could not start");
                state.disconnect_ticket(ticket);
            }
        });
        if queued.is_err() {
            return;
        }

        let queue = self.queue.clone();
        let metrics = self.metrics.clone();
        let opts = self.opts;
        let reason = run_connection(stream, outbound_rx, cancel, self.max_frame_size, move |packet| {
            metrics.message_received(packet.len() as u64);
            match ClientMessage::decode(packet, opts) {
                Ok(msg) => {
                    let queued = queue.enqueue(move |state: &mut ServerState| {
                        if let Err(e) = state.handle_message(ticket, msg) {
                            log_rejection(ticket.id, &e);
                        }
                    });
                    if let Err(e) = queued {
                        error!(error = %e, "Failed to queue message");
                    }
                }
                Err(e) => {
                    metrics.protocol_error();
                    warn!(slot = ticket.id, error = %e, "Dropping malformed message");
                }
            }
        })
        .await;

        match reason {
            CloseReason::PeerClosed => debug!(slot = ticket.id, "Peer closed connection"),
            CloseReason::Cancelled => debug!(slot = ticket.id, "Connection closed by server"),
            CloseReason::Error(e) => {
                self.metrics.connection_error();
                warn!(slot = ticket.id, error = %e, "Connection error");
            }
        }
        self.release(ticket);
    }

    fn release(&self, ticket: SlotTicket) {
        let _ = self.queue.enqueue(move |state: &mut ServerState| {
            state.disconnect_ticket(ticket);
        });
    }
}
