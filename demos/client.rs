//! Example: A client that chats, moves around and measures its link
//!
//! Connects to the configured server, announces itself, walks in a circle
//! and runs the bandwidth then throughput probes. Pings run continuously.
//! Stop with CTRL+C.
//!
//! Run with: `cargo run --example client -- [config.toml]`

use std::path::Path;
use std::time::{Duration, Instant};

use glam::{Quat, Vec3};
use session_net::config::NetworkConfig;
use session_net::core::types::Transform;
use session_net::monitor::{QualityMonitor, QualityReport};
use session_net::utils::logging::init_logging;
use session_net::{Client, ClientEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "session-net.toml".to_string());
    let config = if Path::new(&path).exists() {
        NetworkConfig::from_file(&path)?
    } else {
        NetworkConfig::from_env()?
    };
    init_logging(&config.logging)?;

    let mut monitor = QualityMonitor::new(&config.monitor);
    let mut tick = tokio::time::interval(config.client.tick_interval);
    let (mut client, mut events) = Client::new(config);
    client.connect().await?;

    let started = Instant::now();
    let mut probes_started = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = tick.tick() => {}
        }

        client.tick()?;
        let now = Instant::now();
        while let Ok(event) = events.try_recv() {
            if let Some(report) = monitor.on_event(&event, now) {
                println!("{}", describe(&report));
                if let QualityReport::Bandwidth(_) = report {
                    monitor.start_throughput_test(&client, now)?;
                }
            }
            match event {
                ClientEvent::Connected => {
                    println!("Connected as client {}", client.id());
                    client.send_message_all("hello from the demo client")?;
                }
                ClientEvent::MessageReceived { sender_id, text } => {
                    println!("[{sender_id}] {text}");
                }
                ClientEvent::UserSpawned { client_id, username, is_local } => {
                    let who = if is_local { " (you)" } else { "" };
                    println!("{username} joined as {client_id}{who}");
                    if is_local && !probes_started {
                        probes_started = true;
                        monitor.start_bandwidth_test(&client, now)?;
                    }
                }
                ClientEvent::UserLeft { client_id } => println!("Client {client_id} left"),
                ClientEvent::ConnectionFailed(reason) => {
                    println!("Connection failed: {reason}");
                    return Ok(());
                }
                ClientEvent::Disconnected => {
                    println!("Disconnected");
                    return Ok(());
                }
                _ => {}
            }
        }

        if client.is_active() {
            let angle = started.elapsed().as_secs_f32();
            let position = Vec3::new(angle.cos() * 5.0, 0.0, angle.sin() * 5.0);
            client.send_transform(&Transform::new(position, Quat::from_rotation_y(angle)))?;
        }

        for report in monitor.poll(&client, now)? {
            println!("{}", describe(&report));
        }
    }

    monitor.stop();
    client.disconnect();
    // Let the disconnect request reach the server
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.tick()?;
    Ok(())
}

fn describe(report: &QualityReport) -> String {
    match report {
        QualityReport::Loss(r) => r.to_string(),
        QualityReport::Bandwidth(r) => r.to_string(),
        QualityReport::Throughput(r) => r.to_string(),
    }
}
