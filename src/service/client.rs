//! # Session Client
//!
//! Connects to a server, completes the welcome handshake and exposes the
//! session as a command API plus a stream of [`ClientEvent`]s.
//!
//! Network tasks never touch the session directly. They decode packets and
//! queue actions on a [`Dispatcher`]; the owner calls [`Client::tick`] from
//! its own loop to apply them, which is also when events are emitted.
//!
//! ```text
//! connect() --TCP/TLS--> Handshaking --Welcome, HmacKey, AuthToken--> Active --DisconnectUser(own id)--> Disconnected
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::NetworkConfig;
use crate::core::packet::Packet;
use crate::core::types::{AnimationParam, Transform};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::message::{ClientMessage, Delivery, Inbound, ServerMessage, WireOptions};
use crate::protocol::session::SessionState;
use crate::transport::tcp::{
    outbound_channel, run_connection, try_queue, BoxedStream, CloseReason, Outbound, SendOutcome,
};
use crate::transport::tls::{self, TlsClientConfig};
use crate::transport::udp::{self, DatagramSender, Queued};
use crate::utils::crypto::HmacKey;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;
use crate::utils::token::AuthToken;

/// Something the application should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Handshake finished; commands are accepted
    Connected,
    ConnectionFailed(String),
    Disconnected,
    /// `sender_id` 0 is the server greeting
    MessageReceived { sender_id: i32, text: String },
    UserSpawned {
        client_id: i32,
        username: String,
        is_local: bool,
    },
    UserLeft { client_id: i32 },
    TransformReceived { client_id: i32, transform: Transform },
    AnimationReceived {
        client_id: i32,
        animation: AnimationParam,
    },
    PingReply(i32),
    BandwidthReply,
    ThroughputReply { packet_id: i32, size: i32 },
}

/// Connection state of one client.
pub struct ClientSession {
    id: i32,
    username: String,
    state: SessionState,
    generation: u64,
    opts: WireOptions,
    server_addr: Option<SocketAddr>,
    outbound: Option<Outbound>,
    udp: Option<DatagramSender>,
    cancel: Option<CancellationToken>,
    hmac_key: Option<HmacKey>,
    auth_token: Option<AuthToken>,
    events: UnboundedSender<ClientEvent>,
    metrics: Arc<Metrics>,
}

impl ClientSession {
    fn new(
        username: String,
        opts: WireOptions,
        events: UnboundedSender<ClientEvent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id: 0,
            username,
            state: SessionState::Idle,
            generation: 0,
            opts,
            server_addr: None,
            outbound: None,
            udp: None,
            cancel: None,
            hmac_key: None,
            auth_token: None,
            events,
            metrics,
        }
    }

    /// Slot id assigned by the server, 0 until welcomed.
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_hmac_key(&self) -> bool {
        self.hmac_key.is_some()
    }

    pub fn has_auth_token(&self) -> bool {
        self.auth_token.is_some()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn token_field(&self) -> Option<String> {
        self.auth_token.as_ref().map(|t| t.as_str().to_string())
    }

    fn begin_connect(&mut self) -> Result<u64> {
        self.state.transition(SessionState::Connecting)?;
        self.generation += 1;
        Ok(self.generation)
    }

    fn attach(
        &mut self,
        server_addr: SocketAddr,
        outbound: Outbound,
        udp: Option<DatagramSender>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.state.transition(SessionState::Handshaking)?;
        self.server_addr = Some(server_addr);
        self.outbound = Some(outbound);
        self.udp = udp;
        self.cancel = Some(cancel);
        Ok(())
    }

    fn send_tcp(&self, packet: Packet) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(ProtocolError::NotConnected)?;
        let bytes = packet.len() as u64;
        match try_queue(outbound, packet) {
            SendOutcome::Queued => {
                self.metrics.message_sent(bytes);
                Ok(())
            }
            SendOutcome::QueueFull => Err(ProtocolError::QueueFull),
            SendOutcome::Closed => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Send a request, over UDP when it is unreliable and UDP is open.
    fn send(&self, msg: ClientMessage) -> Result<()> {
        if !self.state.is_active() {
            return Err(ProtocolError::NotConnected);
        }
        let packet = msg.encode(self.opts);

        if msg.delivery() == Delivery::Unreliable {
            if let (Some(udp), Some(server)) = (&self.udp, self.server_addr) {
                let datagram = udp::encode_envelope(self.id, &packet);
                let bytes = datagram.len() as u64;
                match udp::try_send(udp, server, datagram) {
                    Queued::Yes => self.metrics.message_sent(bytes),
                    Queued::Dropped => self.metrics.datagram_dropped(),
                    Queued::Closed => return Err(ProtocolError::ConnectionClosed),
                }
                return Ok(());
            }
        }
        self.send_tcp(packet)
    }

    /// Apply one message from the server.
    fn handle_inbound(&mut self, generation: u64, inbound: Inbound<ServerMessage>) {
        if generation != self.generation || !self.state.is_live() {
            trace!("Ignoring message from a previous connection");
            return;
        }

        if let Some(signature) = &inbound.signature {
            let verified = match &self.hmac_key {
                Some(key) => signature.verify(key),
                None => Err(ProtocolError::IntegrityFailure(constants::ERR_INTEGRITY_FAILURE)),
            };
            if let Err(e) = verified {
                self.metrics.integrity_failure();
                warn!(
                    kind = ?inbound.message.packet_type(),
                    error = %e,
                    "Dropping message that failed verification"
                );
                return;
            }
        }

        match inbound.message {
            ServerMessage::Welcome {
                greeting,
                client_id,
            } => self.on_welcome(greeting, client_id),
            ServerMessage::HmacKey { key } => match HmacKey::from_bytes(&key) {
                Ok(key) => {
                    debug!("HMAC key received");
                    self.hmac_key = Some(key);
                    self.try_activate();
                }
                Err(e) => warn!(error = %e, "Invalid HMAC key"),
            },
            ServerMessage::AuthToken { token, client_id } => {
                if client_id == self.id {
                    debug!("Auth token received");
                    self.auth_token = Some(AuthToken::from_string(token));
                    self.try_activate();
                } else {
                    warn!(client_id, own = self.id, "Auth token for another client");
                }
            }
            ServerMessage::SpawnUser {
                client_id,
                username,
            } => self.emit(ClientEvent::UserSpawned {
                client_id,
                is_local: client_id == self.id,
                username,
            }),
            ServerMessage::DisconnectUser { client_id } => {
                if client_id == self.id {
                    info!("Server closed the session");
                    self.teardown();
                } else {
                    self.emit(ClientEvent::UserLeft { client_id });
                }
            }
            ServerMessage::LatencyReply { ping_id, .. } => self.emit(ClientEvent::PingReply(ping_id)),
            ServerMessage::Message { text, sender_id }
            | ServerMessage::MessageAll { text, sender_id } => {
                self.emit(ClientEvent::MessageReceived { sender_id, text })
            }
            ServerMessage::TransformUpdate {
                client_id,
                transform,
            } => self.emit(ClientEvent::TransformReceived {
                client_id,
                transform,
            }),
            ServerMessage::AnimationUpdate {
                client_id,
                animation,
            } => self.emit(ClientEvent::AnimationReceived {
                client_id,
                animation,
            }),
            ServerMessage::BandwidthReply { .. } => self.emit(ClientEvent::BandwidthReply),
            ServerMessage::ThroughputReply { packet_id, size } => {
                self.emit(ClientEvent::ThroughputReply { packet_id, size })
            }
        }
    }

    fn on_welcome(&mut self, greeting: String, client_id: i32) {
        if self.state != SessionState::Handshaking || self.id != 0 {
            warn!(state = %self.state, "Unexpected welcome");
            return;
        }
        self.id = client_id;
        info!(client_id, "Welcome received");
        if !greeting.is_empty() {
            self.emit(ClientEvent::MessageReceived {
                sender_id: 0,
                text: greeting,
            });
        }

        let ack = ClientMessage::WelcomeAck {
            client_id,
            username: self.username.clone(),
        };
        if let Err(e) = self.send_tcp(ack.encode(self.opts)) {
            self.fail(&ProtocolError::HandshakeError(format!(
                "could not acknowledge welcome: {e}"
            )));
            return;
        }

        if let (Some(udp), Some(server)) = (&self.udp, self.server_addr) {
            if udp::try_send(udp, server, udp::encode_hello(client_id)) != Queued::Yes {
                debug!("UDP hello not queued");
            }
        }

        self.try_activate();
    }

    /// Whether every credential the wire layout needs has arrived.
    fn credentials_ready(&self) -> bool {
        (!self.opts.hmac || self.hmac_key.is_some())
            && (!self.opts.auth_tokens || self.auth_token.is_some())
    }

    /// Go `Active` once welcomed and holding the enabled credentials.
    fn try_activate(&mut self) {
        if self.state != SessionState::Handshaking || self.id == 0 || !self.credentials_ready() {
            return;
        }
        if let Err(e) = self.state.transition(SessionState::Active) {
            warn!(error = %e, "Cannot activate session");
            return;
        }
        debug!(client_id = self.id, "Session active");
        self.emit(ClientEvent::Connected);
    }

    fn connection_lost(&mut self, generation: u64, reason: CloseReason) {
        if generation != self.generation {
            return;
        }
        match (&reason, self.state) {
            (_, SessionState::Handshaking) => {
                self.fail(&ProtocolError::HandshakeError(format!(
                    "connection closed: {reason:?}"
                )));
            }
            (CloseReason::Error(e), _) => {
                warn!(error = %e, "Connection lost");
                self.teardown();
            }
            _ => {
                debug!(?reason, "Connection closed");
                self.teardown();
            }
        }
    }

    /// Drop every link and credential. Returns false if nothing was live.
    fn reset(&mut self) -> bool {
        if !self.state.is_live() {
            return false;
        }
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.outbound = None;
        self.udp = None;
        self.server_addr = None;
        self.hmac_key = None;
        self.auth_token = None;
        self.id = 0;
        self.generation += 1;
        self.state = SessionState::Disconnected;
        true
    }

    fn teardown(&mut self) {
        if self.reset() {
            info!(user = %self.username, "Disconnected");
            self.emit(ClientEvent::Disconnected);
        }
    }

    fn fail(&mut self, error: &ProtocolError) {
        if self.reset() {
            warn!(%error, "Connection failed");
            self.emit(ClientEvent::ConnectionFailed(error.to_string()));
        }
    }
}

/// Handle to one client session.
pub struct Client {
    config: NetworkConfig,
    session: ClientSession,
    queue: Arc<Dispatcher<ClientSession>>,
}

impl Client {
    /// Create a disconnected client and the receiver for its events.
    pub fn new(config: NetworkConfig) -> (Self, UnboundedReceiver<ClientEvent>) {
        let (events_tx, events_rx) = unbounded_channel();
        let username = config
            .client
            .username
            .clone()
            .unwrap_or_else(guest_name);
        let session = ClientSession::new(
            username,
            config.wire_options(),
            events_tx,
            Arc::new(Metrics::new()),
        );
        let client = Self {
            config,
            session,
            queue: Arc::new(Dispatcher::new()),
        };
        (client, events_rx)
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn id(&self) -> i32 {
        self.session.id
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.session.metrics.clone()
    }

    pub fn is_active(&self) -> bool {
        self.session.state.is_active()
    }

    /// Open TCP (plus TLS and UDP when configured) and start the handshake.
    ///
    /// Returns once the transport is up; `Connected` follows on a later
    /// [`tick`](Self::tick) after the welcome and any enabled credentials arrive.
    #[instrument(skip(self), fields(user = %self.session.username))]
    pub async fn connect(&mut self) -> Result<()> {
        if self.session.state.is_live() {
            return Err(ProtocolError::UnexpectedMessage("already connected".into()));
        }
        let generation = self.session.begin_connect()?;

        match self.establish().await {
            Ok((server_addr, stream, udp_socket)) => {
                self.start(generation, server_addr, stream, udp_socket)
            }
            Err(e) => {
                self.session.fail(&e);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<(SocketAddr, BoxedStream, Option<Arc<UdpSocket>>)> {
        let server_addr = self.config.network.server_addr()?;
        let timeout = self.config.client.connection_timeout;

        let tcp = with_timeout_error(async { Ok(TcpStream::connect(server_addr).await?) }, timeout)
            .await?;
        tcp.set_nodelay(true)?;
        let local = tcp.local_addr()?;
        debug!(%server_addr, %local, "TCP connected");

        let stream: BoxedStream = if self.config.security.use_tls {
            let tls_config = TlsClientConfig::from_security(&self.config.security);
            let connector = tls_config.connector()?;
            let server_name = tls_config.server_name()?;
            with_timeout_error(tls::connect(&connector, server_name, tcp), timeout).await?
        } else {
            Box::new(tcp)
        };

        let udp_socket = if self.config.network.allow_udp {
            Some(Arc::new(bind_udp(local).await?))
        } else {
            None
        };

        Ok((server_addr, stream, udp_socket))
    }

    fn start(
        &mut self,
        generation: u64,
        server_addr: SocketAddr,
        stream: BoxedStream,
        udp_socket: Option<Arc<UdpSocket>>,
    ) -> Result<()> {
        let opts = self.session.opts;
        let cancel = CancellationToken::new();
        let (outbound, outbound_rx) = outbound_channel();

        let udp_sender = udp_socket.map(|socket| {
            let queue = self.queue.clone();
            let metrics = self.session.metrics.clone();
            udp::spawn_receiver(socket.clone(), cancel.clone(), move |bytes, from| {
                if from != server_addr {
                    trace!(%from, "Datagram from unknown source");
                    return;
                }
                let decoded =
                    udp::decode_datagram(bytes).and_then(|packet| ServerMessage::decode(packet, opts));
                match decoded {
                    Ok(inbound) => {
                        metrics.message_received(bytes.len() as u64);
                        queue_inbound(&queue, generation, inbound)
                    }
                    Err(e) => {
                        metrics.protocol_error();
                        debug!(error = %e, "Dropping malformed datagram")
                    }
                }
            });
            udp::spawn_sender(socket)
        });

        self.session
            .attach(server_addr, outbound, udp_sender, cancel.clone())?;

        let queue = self.queue.clone();
        let metrics = self.session.metrics.clone();
        let max_frame_size = self.config.server.max_frame_size;
        tokio::spawn(async move {
            let reader_queue = queue.clone();
            let reason = run_connection(stream, outbound_rx, cancel, max_frame_size, move |packet| {
                metrics.message_received(packet.len() as u64);
                match ServerMessage::decode(packet, opts) {
                    Ok(inbound) => queue_inbound(&reader_queue, generation, inbound),
                    Err(e) => {
                        metrics.protocol_error();
                        warn!(error = %e, "Dropping malformed message")
                    }
                }
            })
            .await;
            let _ = queue.enqueue(move |session: &mut ClientSession| {
                session.connection_lost(generation, reason)
            });
        });

        info!(%server_addr, "Connected, waiting for welcome");
        Ok(())
    }

    /// Apply queued network events. Call this regularly from the owner's loop.
    pub fn tick(&mut self) -> Result<usize> {
        self.queue.drain(&mut self.session)
    }

    /// Ask the server to end the session, or tear down locally when the
    /// handshake has not finished. No-op when already disconnected.
    pub fn disconnect(&mut self) {
        match self.session.state {
            SessionState::Active => {
                let request = ClientMessage::DisconnectRequest {
                    client_id: self.session.id,
                    token: self.session.token_field(),
                };
                if let Err(e) = self.session.send(request) {
                    debug!(error = %e, "Disconnect request not sent");
                    self.session.teardown();
                }
            }
            SessionState::Connecting | SessionState::Handshaking => self.session.teardown(),
            SessionState::Idle | SessionState::Disconnected => {
                debug!("Already disconnected");
            }
        }
    }

    /// Notify the server if possible and tear down immediately.
    pub fn close(&mut self) {
        if self.session.state.is_active() {
            let request = ClientMessage::DisconnectRequest {
                client_id: self.session.id,
                token: self.session.token_field(),
            };
            let _ = self.session.send(request);
        }
        self.session.teardown();
    }

    pub fn send_message_to(&self, user: i32, text: impl Into<String>) -> Result<()> {
        self.session.send(ClientMessage::MessageToUser {
            client_id: self.session.id,
            token: self.session.token_field(),
            target_id: user,
            text: text.into(),
        })
    }

    pub fn send_message_all(&self, text: impl Into<String>) -> Result<()> {
        self.session.send(ClientMessage::MessageToAll {
            client_id: self.session.id,
            token: self.session.token_field(),
            text: text.into(),
        })
    }

    pub fn send_transform(&self, transform: &Transform) -> Result<()> {
        self.session.send(ClientMessage::TransformChange {
            client_id: self.session.id,
            token: self.session.token_field(),
            transform: *transform,
        })
    }

    pub fn send_animation(&self, animation: AnimationParam) -> Result<()> {
        self.session.send(ClientMessage::AnimationChange {
            client_id: self.session.id,
            token: self.session.token_field(),
            animation,
        })
    }

    pub fn request_ping(&self, ping_id: i32) -> Result<()> {
        self.session.send(ClientMessage::LatencyRequest {
            client_id: self.session.id,
            ping_id,
        })
    }

    pub fn request_bandwidth_test(&self, payload: Vec<u8>) -> Result<()> {
        self.session.send(ClientMessage::BandwidthRequest {
            client_id: self.session.id,
            token: self.session.token_field(),
            payload,
        })
    }

    pub fn send_throughput_packet(&self, packet_id: i32, payload: Vec<u8>) -> Result<()> {
        self.session.send(ClientMessage::ThroughputRequest {
            client_id: self.session.id,
            packet_id,
            payload,
        })
    }
}

fn queue_inbound(
    queue: &Dispatcher<ClientSession>,
    generation: u64,
    inbound: Inbound<ServerMessage>,
) {
    let queued = queue.enqueue(move |session: &mut ClientSession| {
        session.handle_inbound(generation, inbound)
    });
    if let Err(e) = queued {
        warn!(error = %e, "Failed to queue server message");
    }
}

/// Bind UDP on the TCP local port, or any port if that one is taken.
async fn bind_udp(local: SocketAddr) -> Result<UdpSocket> {
    match UdpSocket::bind(local).await {
        Ok(socket) => Ok(socket),
        Err(e) => {
            warn!(%local, error = %e, "UDP port matching TCP unavailable, using an ephemeral port");
            Ok(UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await?)
        }
    }
}

fn guest_name() -> String {
    format!("Guest{}", rand::rng().random_range(0..1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::{outbound_channel_with_capacity, OutboundReceiver};

    struct Harness {
        session: ClientSession,
        events: UnboundedReceiver<ClientEvent>,
        wire: OutboundReceiver,
        key: HmacKey,
    }

    fn opts() -> WireOptions {
        WireOptions {
            auth_tokens: true,
            hmac: true,
        }
    }

    fn harness() -> Harness {
        let (events_tx, events) = unbounded_channel();
        let mut session =
            ClientSession::new("Guest7".into(), opts(), events_tx, Arc::new(Metrics::new()));
        let generation = session.begin_connect().unwrap();
        assert_eq!(generation, 1);
        let (outbound, wire) = outbound_channel();
        session
            .attach(
                SocketAddr::from(([127, 0, 0, 1], 7777)),
                outbound,
                None,
                CancellationToken::new(),
            )
            .unwrap();
        Harness {
            session,
            events,
            wire,
            key: HmacKey::generate().unwrap(),
        }
    }

    /// Encode as the server would and decode as the reader task does.
    fn deliver(h: &mut Harness, msg: ServerMessage) {
        let packet = msg.to_packet(Some(&h.key)).unwrap();
        let inbound = ServerMessage::decode(packet, opts()).unwrap();
        let generation = h.session.generation;
        h.session.handle_inbound(generation, inbound);
    }

    fn welcome(h: &mut Harness) {
        deliver(
            h,
            ServerMessage::Welcome {
                greeting: "Welcome to server!".into(),
                client_id: 3,
            },
        );
        let key = h.key.as_bytes().to_vec();
        deliver(h, ServerMessage::HmacKey { key });
        deliver(
            h,
            ServerMessage::AuthToken {
                token: "tok".into(),
                client_id: 3,
            },
        );
    }

    #[test]
    fn welcome_activates_and_acknowledges() {
        let mut h = harness();
        welcome(&mut h);

        assert_eq!(h.session.id(), 3);
        assert!(h.session.state().is_active());
        assert!(h.session.has_hmac_key() && h.session.has_auth_token());

        let ack = ClientMessage::decode(h.wire.try_recv().unwrap(), opts()).unwrap();
        assert_eq!(
            ack,
            ClientMessage::WelcomeAck {
                client_id: 3,
                username: "Guest7".into()
            }
        );
        assert_eq!(
            h.events.try_recv().unwrap(),
            ClientEvent::MessageReceived {
                sender_id: 0,
                text: "Welcome to server!".into()
            }
        );
        assert_eq!(h.events.try_recv().unwrap(), ClientEvent::Connected);
    }

    #[test]
    fn tampered_signed_message_is_dropped() {
        let mut h = harness();
        welcome(&mut h);
        while h.events.try_recv().is_ok() {}

        let mut packet = ServerMessage::Message {
            text: "hi".into(),
            sender_id: 2,
        }
        .to_packet(Some(&h.key))
        .unwrap();
        let mut bytes = packet.into_vec();
        bytes[8] ^= 0x01;
        packet = Packet::from_vec(bytes);
        let inbound = ServerMessage::decode(packet, opts()).unwrap();
        h.session.handle_inbound(1, inbound);
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.session.metrics.snapshot().integrity_failures, 1);
    }

    #[test]
    fn spawn_and_leave_events() {
        let mut h = harness();
        welcome(&mut h);
        while h.events.try_recv().is_ok() {}

        deliver(
            &mut h,
            ServerMessage::SpawnUser {
                client_id: 3,
                username: "Guest7".into(),
            },
        );
        deliver(&mut h, ServerMessage::DisconnectUser { client_id: 5 });
        assert_eq!(
            h.events.try_recv().unwrap(),
            ClientEvent::UserSpawned {
                client_id: 3,
                username: "Guest7".into(),
                is_local: true
            }
        );
        assert_eq!(
            h.events.try_recv().unwrap(),
            ClientEvent::UserLeft { client_id: 5 }
        );
    }

    #[test]
    fn own_disconnect_tears_down_once() {
        let mut h = harness();
        welcome(&mut h);
        while h.events.try_recv().is_ok() {}

        deliver(&mut h, ServerMessage::DisconnectUser { client_id: 3 });
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert_eq!(h.session.id(), 0);
        assert!(!h.session.has_hmac_key());
        assert_eq!(h.events.try_recv().unwrap(), ClientEvent::Disconnected);

        h.session.teardown();
        assert!(h.events.try_recv().is_err());
        assert!(h.session.begin_connect().is_ok());
    }

    #[test]
    fn stale_generation_is_ignored() {
        let mut h = harness();
        h.session.handle_inbound(
            0,
            Inbound {
                message: ServerMessage::Welcome {
                    greeting: String::new(),
                    client_id: 9,
                },
                signature: None,
            },
        );
        assert_eq!(h.session.id(), 0);
    }

    #[test]
    fn connected_waits_for_credentials() {
        let mut h = harness();
        deliver(
            &mut h,
            ServerMessage::Welcome {
                greeting: String::new(),
                client_id: 3,
            },
        );
        assert_eq!(h.session.id(), 3);
        assert_eq!(h.session.state(), SessionState::Handshaking);
        assert!(h.events.try_recv().is_err());
        // Commands are refused rather than sent with an empty token
        assert!(matches!(
            h.session.send(ClientMessage::MessageToAll {
                client_id: 3,
                token: h.session.token_field(),
                text: "hi".into(),
            }),
            Err(ProtocolError::NotConnected)
        ));

        let key = h.key.as_bytes().to_vec();
        deliver(&mut h, ServerMessage::HmacKey { key });
        assert_eq!(h.session.state(), SessionState::Handshaking);
        assert!(h.events.try_recv().is_err());

        deliver(
            &mut h,
            ServerMessage::AuthToken {
                token: "tok".into(),
                client_id: 3,
            },
        );
        assert!(h.session.state().is_active());
        assert_eq!(h.events.try_recv().unwrap(), ClientEvent::Connected);
        assert_eq!(h.session.token_field().as_deref(), Some("tok"));
    }

    #[test]
    fn welcome_alone_activates_without_credentials() {
        let (events_tx, mut events) = unbounded_channel();
        let mut session = ClientSession::new(
            "Guest7".into(),
            WireOptions::default(),
            events_tx,
            Arc::new(Metrics::new()),
        );
        session.begin_connect().unwrap();
        let (outbound, _wire) = outbound_channel();
        session
            .attach(
                SocketAddr::from(([127, 0, 0, 1], 7777)),
                outbound,
                None,
                CancellationToken::new(),
            )
            .unwrap();
        session.handle_inbound(
            1,
            Inbound {
                message: ServerMessage::Welcome {
                    greeting: String::new(),
                    client_id: 4,
                },
                signature: None,
            },
        );
        assert!(session.state().is_active());
        assert_eq!(events.try_recv().unwrap(), ClientEvent::Connected);
    }

    #[test]
    fn full_outbound_queue_is_reported() {
        let (events_tx, _events) = unbounded_channel();
        let mut session = ClientSession::new(
            "Guest7".into(),
            WireOptions::default(),
            events_tx,
            Arc::new(Metrics::new()),
        );
        session.begin_connect().unwrap();
        let (outbound, _wire) = outbound_channel_with_capacity(2);
        session
            .attach(
                SocketAddr::from(([127, 0, 0, 1], 7777)),
                outbound,
                None,
                CancellationToken::new(),
            )
            .unwrap();
        session.handle_inbound(
            1,
            Inbound {
                message: ServerMessage::Welcome {
                    greeting: String::new(),
                    client_id: 4,
                },
                signature: None,
            },
        );
        // The welcome ack took the first place in the queue
        let chat = || ClientMessage::MessageToAll {
            client_id: 4,
            token: None,
            text: "hi".into(),
        };
        assert!(session.send(chat()).is_ok());
        assert!(matches!(session.send(chat()), Err(ProtocolError::QueueFull)));
        assert!(session.state().is_active());
    }

    #[test]
    fn closed_before_welcome_is_a_failure() {
        let mut h = harness();
        h.session.connection_lost(1, CloseReason::PeerClosed);
        match h.events.try_recv().unwrap() {
            ClientEvent::ConnectionFailed(reason) => assert!(reason.starts_with("Handshake failed")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn commands_need_an_active_session() {
        let (client, _events) = Client::new(NetworkConfig::default());
        assert!(matches!(
            client.send_message_all("hello"),
            Err(ProtocolError::NotConnected)
        ));
        assert!(client.session().username().starts_with("Guest"));
    }
}
