//! End-to-end tests: a real server on an ephemeral port and live clients

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::{Quat, Vec3};
use serial_test::serial;
use session_net::config::NetworkConfig;
use session_net::core::types::{AnimationParam, Transform};
use session_net::error::Result;
use session_net::monitor::{QualityMonitor, QualityReport};
use session_net::utils::metrics::Metrics;
use session_net::{Client, ClientEvent, Server};
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::sleep;

const WAIT: Duration = Duration::from_secs(5);

struct RunningServer {
    addr: SocketAddr,
    shutdown: mpsc::Sender<()>,
    handle: JoinHandle<Result<()>>,
    metrics: Arc<Metrics>,
}

impl RunningServer {
    async fn stop(self) {
        let _ = self.shutdown.send(()).await;
        self.handle.await.unwrap().unwrap();
    }
}

async fn start_server<F>(mutator: F) -> RunningServer
where
    F: FnOnce(&mut NetworkConfig),
{
    let config = NetworkConfig::default_with_overrides(|c| {
        c.network.port = 0;
        c.server.tick_interval = Duration::from_millis(5);
        mutator(c);
    });
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let metrics = server.metrics();
    let (shutdown, shutdown_rx) = mpsc::channel(1);
    let handle = tokio::spawn(server.run_with_shutdown(shutdown_rx));
    RunningServer {
        addr,
        shutdown,
        handle,
        metrics,
    }
}

fn client_config(server: &RunningServer, name: &str) -> NetworkConfig {
    let addr = server.addr;
    NetworkConfig::default_with_overrides(|c| {
        c.network.port = addr.port();
        c.client.username = Some(name.to_string());
    })
}

/// Tick until an event matching `pred` shows up; other events are discarded.
async fn wait_for<F>(
    client: &mut Client,
    events: &mut UnboundedReceiver<ClientEvent>,
    mut pred: F,
) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        client.tick().unwrap();
        while let Ok(event) = events.try_recv() {
            if pred(&event) {
                return event;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for event");
        sleep(Duration::from_millis(5)).await;
    }
}

/// Connect and wait until the server has announced this client.
async fn join(server: &RunningServer, name: &str) -> (Client, UnboundedReceiver<ClientEvent>) {
    let (mut client, mut events) = Client::new(client_config(server, name));
    client.connect().await.unwrap();
    wait_for(&mut client, &mut events, |e| {
        matches!(e, ClientEvent::UserSpawned { is_local: true, .. })
    })
    .await;
    assert!(client.is_active());
    (client, events)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_connect_receives_greeting_and_id() {
    let server = start_server(|_| {}).await;
    let (mut client, mut events) = Client::new(client_config(&server, "Alice"));
    client.connect().await.unwrap();

    let greeting = wait_for(&mut client, &mut events, |e| {
        matches!(e, ClientEvent::MessageReceived { sender_id: 0, .. })
    })
    .await;
    assert_eq!(
        greeting,
        ClientEvent::MessageReceived {
            sender_id: 0,
            text: "Welcome to server!".into()
        }
    );
    wait_for(&mut client, &mut events, |e| *e == ClientEvent::Connected).await;
    assert_eq!(client.id(), 1);

    let spawn = wait_for(&mut client, &mut events, |e| {
        matches!(e, ClientEvent::UserSpawned { .. })
    })
    .await;
    assert_eq!(
        spawn,
        ClientEvent::UserSpawned {
            client_id: 1,
            username: "Alice".into(),
            is_local: true
        }
    );
    assert!(client.session().has_hmac_key());
    assert!(client.session().has_auth_token());

    client.close();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_chat_between_two_clients() {
    let server = start_server(|_| {}).await;
    let (mut alice, mut alice_events) = join(&server, "Alice").await;
    let (mut bob, mut bob_events) = join(&server, "Bob").await;

    let spawned = wait_for(&mut alice, &mut alice_events, |e| {
        matches!(e, ClientEvent::UserSpawned { is_local: false, .. })
    })
    .await;
    assert_eq!(
        spawned,
        ClientEvent::UserSpawned {
            client_id: bob.id(),
            username: "Bob".into(),
            is_local: false
        }
    );

    bob.send_message_all("hello everyone").unwrap();
    let received = wait_for(&mut alice, &mut alice_events, |e| {
        matches!(e, ClientEvent::MessageReceived { text, .. } if text == "hello everyone")
    })
    .await;
    assert_eq!(
        received,
        ClientEvent::MessageReceived {
            sender_id: bob.id(),
            text: "hello everyone".into()
        }
    );

    alice.send_message_to(bob.id(), "just you").unwrap();
    let private = wait_for(&mut bob, &mut bob_events, |e| {
        matches!(e, ClientEvent::MessageReceived { text, .. } if text == "just you")
    })
    .await;
    assert_eq!(
        private,
        ClientEvent::MessageReceived {
            sender_id: alice.id(),
            text: "just you".into()
        }
    );

    alice.close();
    bob.close();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_transform_and_animation_relay() {
    let server = start_server(|_| {}).await;
    let (mut alice, mut alice_events) = join(&server, "Alice").await;
    let (mut bob, _bob_events) = join(&server, "Bob").await;
    bob.tick().unwrap();

    let transform = Transform::new(Vec3::new(4.0, 0.5, -2.0), Quat::IDENTITY);
    let event = {
        // Datagrams may race the endpoint binding, so resend until one lands
        let deadline = Instant::now() + WAIT;
        loop {
            bob.send_transform(&transform).unwrap();
            alice.tick().unwrap();
            let mut found = None;
            while let Ok(e) = alice_events.try_recv() {
                if matches!(e, ClientEvent::TransformReceived { .. }) {
                    found = Some(e);
                }
            }
            if let Some(e) = found {
                break e;
            }
            assert!(Instant::now() < deadline, "transform never arrived");
            sleep(Duration::from_millis(20)).await;
        }
    };
    assert_eq!(
        event,
        ClientEvent::TransformReceived {
            client_id: bob.id(),
            transform
        }
    );

    bob.send_animation(AnimationParam::boolean("running", true))
        .unwrap();
    let anim = wait_for(&mut alice, &mut alice_events, |e| {
        matches!(e, ClientEvent::AnimationReceived { .. })
    })
    .await;
    assert_eq!(
        anim,
        ClientEvent::AnimationReceived {
            client_id: bob.id(),
            animation: AnimationParam::boolean("running", true)
        }
    );

    alice.close();
    bob.close();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_ping_over_tcp_when_udp_disabled() {
    let server = start_server(|c| c.network.allow_udp = false).await;
    let mut config = client_config(&server, "Alice");
    config.network.allow_udp = false;
    let (mut client, mut events) = Client::new(config);
    client.connect().await.unwrap();
    wait_for(&mut client, &mut events, |e| {
        matches!(e, ClientEvent::UserSpawned { is_local: true, .. })
    })
    .await;

    client.request_ping(7).unwrap();
    let reply = wait_for(&mut client, &mut events, |e| {
        matches!(e, ClientEvent::PingReply(_))
    })
    .await;
    assert_eq!(reply, ClientEvent::PingReply(7));

    client.close();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_server_full_fails_connection() {
    let server = start_server(|c| c.server.max_ccu = 1).await;
    let (mut alice, _alice_events) = join(&server, "Alice").await;

    let (mut bob, mut bob_events) = Client::new(client_config(&server, "Bob"));
    bob.connect().await.unwrap();
    let failed = wait_for(&mut bob, &mut bob_events, |e| {
        matches!(
            e,
            ClientEvent::ConnectionFailed(_) | ClientEvent::Connected
        )
    })
    .await;
    assert!(matches!(failed, ClientEvent::ConnectionFailed(_)));
    assert!(!bob.is_active());
    assert_eq!(server.metrics.snapshot().connections_rejected, 1);

    alice.close();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_disconnect_notifies_others() {
    let server = start_server(|_| {}).await;
    let (mut alice, mut alice_events) = join(&server, "Alice").await;
    let (mut bob, mut bob_events) = join(&server, "Bob").await;
    let alice_id = alice.id();

    alice.disconnect();
    wait_for(&mut alice, &mut alice_events, |e| {
        *e == ClientEvent::Disconnected
    })
    .await;
    assert_eq!(alice.id(), 0);

    let left = wait_for(&mut bob, &mut bob_events, |e| {
        matches!(e, ClientEvent::UserLeft { .. })
    })
    .await;
    assert_eq!(left, ClientEvent::UserLeft { client_id: alice_id });

    // A second disconnect is a no-op
    alice.disconnect();
    alice.tick().unwrap();
    assert!(alice_events.try_recv().is_err());

    bob.close();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_server_shutdown_disconnects_clients() {
    let server = start_server(|_| {}).await;
    let (mut alice, mut alice_events) = join(&server, "Alice").await;

    server.stop().await;
    wait_for(&mut alice, &mut alice_events, |e| {
        *e == ClientEvent::Disconnected
    })
    .await;
    assert!(!alice.is_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_reconnect_after_disconnect() {
    let server = start_server(|c| c.server.max_ccu = 1).await;
    let (mut alice, mut events) = join(&server, "Alice").await;

    alice.disconnect();
    wait_for(&mut alice, &mut events, |e| *e == ClientEvent::Disconnected).await;

    // Give the server a moment to free the slot
    sleep(Duration::from_millis(50)).await;
    alice.connect().await.unwrap();
    wait_for(&mut alice, &mut events, |e| {
        matches!(e, ClientEvent::UserSpawned { is_local: true, .. })
    })
    .await;
    assert_eq!(alice.id(), 1);

    alice.close();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_quality_probes() {
    let server = start_server(|_| {}).await;
    let mut config = client_config(&server, "Alice");
    config.monitor.bandwidth_payload_size = 64 * 1024;
    config.monitor.throughput_packet_count = 20;
    config.monitor.throughput_packet_size = 256;
    config.monitor.throughput_timeout = Duration::from_secs(3);
    let monitor_config = config.monitor.clone();

    let (mut client, mut events) = Client::new(config);
    client.connect().await.unwrap();
    wait_for(&mut client, &mut events, |e| {
        matches!(e, ClientEvent::UserSpawned { is_local: true, .. })
    })
    .await;

    let mut monitor = QualityMonitor::new(&monitor_config);
    monitor
        .start_bandwidth_test(&client, Instant::now())
        .unwrap();
    let reply = wait_for(&mut client, &mut events, |e| {
        *e == ClientEvent::BandwidthReply
    })
    .await;
    match monitor.on_event(&reply, Instant::now()) {
        Some(QualityReport::Bandwidth(report)) => assert_eq!(report.bytes, 64 * 1024),
        other => panic!("expected bandwidth report, got {other:?}"),
    }

    monitor
        .start_throughput_test(&client, Instant::now())
        .unwrap();
    let deadline = Instant::now() + WAIT;
    let report = loop {
        client.tick().unwrap();
        let mut done = None;
        while let Ok(event) = events.try_recv() {
            if let Some(QualityReport::Throughput(r)) = monitor.on_event(&event, Instant::now()) {
                done = Some(r);
            }
        }
        for r in monitor.poll(&client, Instant::now()).unwrap() {
            if let QualityReport::Throughput(r) = r {
                done = Some(r);
            }
        }
        if let Some(r) = done {
            break r;
        }
        assert!(Instant::now() < deadline, "throughput test never finished");
        sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(report.total, 20);
    assert_eq!(report.packet_size, 256);
    assert!(report.acknowledged > 0);

    client.close();
    server.stop().await;
}
