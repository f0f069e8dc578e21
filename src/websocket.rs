//! WebSocket Server for Web Interface Communication
//!
//! Inbound text messages are `{action, data}` envelopes handed to the
//! command dispatcher. Everything the session publishes is serialised once
//! and broadcast to every connected client.

use crate::config::Config;
use crate::constants::limits;
use crate::dispatcher::{ActionKind, UiAction};
use crate::publisher::OutboundMessage;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Rate limit: maximum actions per second per connection
const MAX_ACTIONS_PER_SECOND: usize = 20;

/// Global connection counter
static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Channels a client connection needs
#[derive(Clone)]
pub struct Bridge {
    pub intake: mpsc::Sender<UiAction>,
    pub outbound: broadcast::Sender<String>,
    pub config: watch::Receiver<Config>,
}

/// Serialise published messages and broadcast them to all clients
pub async fn forward_outbound(mut messages: mpsc::Receiver<OutboundMessage>, outbound: broadcast::Sender<String>) {
    while let Some(message) = messages.recv().await {
        match serde_json::to_string(&message) {
            Ok(json) => {
                // No receivers just means no browser is attached
                let _ = outbound.send(json);
            }
            Err(e) => error!("Failed to serialise {}: {}", message.kind(), e),
        }
    }
    debug!("Outbound channel closed");
}

/// Run the WebSocket server
pub async fn run_server(port: u16, bridge: Bridge) -> Result<()> {
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket server listening on ws://{}", addr);

    serve(listener, bridge).await
}

/// Accept clients on an already bound listener
pub async fn serve(listener: TcpListener, bridge: Bridge) -> Result<()> {
    while let Ok((stream, addr)) = listener.accept().await {
        let current = ACTIVE_CONNECTIONS.load(Ordering::SeqCst);
        if current >= limits::MAX_CONNECTIONS {
            warn!(
                "Connection rejected from {}: max connections ({}) reached",
                addr,
                limits::MAX_CONNECTIONS
            );
            drop(stream);
            continue;
        }

        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
        info!("New connection from: {} (active: {})", addr, current + 1);

        let bridge = bridge.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, bridge).await {
                error!("Connection error: {}", e);
            }
            let remaining = ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst) - 1;
            info!("Connection closed (active: {})", remaining);
        });
    }

    Ok(())
}

async fn handle_connection(stream: TcpStream, bridge: Bridge) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();
    let mut outbound = bridge.outbound.subscribe();

    // Current configuration first, so the page can fill in its controls
    let config = bridge.config.borrow().clone();
    let welcome = serde_json::to_string(&OutboundMessage::Config(config))?;
    write.send(Message::Text(welcome)).await?;

    let mut action_count = 0usize;
    let mut rate_limit_start = Instant::now();

    loop {
        tokio::select! {
            msg = read.next() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        debug!("Received: {}", text);
                        match serde_json::from_str::<UiAction>(&text) {
                            Ok(action) => {
                                // Controls are never rate limited
                                if !action.kind().is_some_and(ActionKind::is_control) {
                                    if rate_limit_start.elapsed().as_secs_f64() >= 1.0 {
                                        action_count = 0;
                                        rate_limit_start = Instant::now();
                                    }

                                    action_count += 1;
                                    if action_count > MAX_ACTIONS_PER_SECOND {
                                        warn!(
                                            "Rate limit exceeded ({} actions/sec), dropping '{}'",
                                            action_count, action.action
                                        );
                                        continue;
                                    }
                                }

                                if bridge.intake.send(action).await.is_err() {
                                    warn!("Command intake closed");
                                    break;
                                }
                            }
                            Err(e) => warn!("Invalid message: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("Client disconnected");
                        break;
                    }
                    Ok(Message::Ping(data)) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            json = outbound.recv() => {
                match json {
                    Ok(json) => write.send(Message::Text(json)).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Client lagging, skipped {} messages", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    async fn start() -> (String, mpsc::Receiver<UiAction>, mpsc::Sender<OutboundMessage>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let (intake_tx, intake_rx) = mpsc::channel(64);
        let (outbound_tx, _) = broadcast::channel(8);
        let (ui_tx, ui_rx) = mpsc::channel(8);
        let (_config_tx, config_rx) = watch::channel(Config::default());

        tokio::spawn(forward_outbound(ui_rx, outbound_tx.clone()));
        tokio::spawn(serve(
            listener,
            Bridge {
                intake: intake_tx,
                outbound: outbound_tx,
                config: config_rx,
            },
        ));

        (url, intake_rx, ui_tx)
    }

    #[tokio::test]
    async fn test_client_receives_config_then_broadcasts() {
        let (url, _intake_rx, ui_tx) = start().await;
        let (mut client, _) = connect_async(url.as_str()).await.unwrap();

        let first = client.next().await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert_eq!(json["action"], "config");
        assert_eq!(json["data"]["loop"], "inf");

        ui_tx
            .send(OutboundMessage::ConnectionStatus(
                crate::publisher::ConnectionStatus::disconnected(),
            ))
            .await
            .unwrap();

        let next = client.next().await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(next.to_text().unwrap()).unwrap();
        assert_eq!(json["action"], "connection-status");
        assert_eq!(json["data"]["connected"], false);
    }

    #[tokio::test]
    async fn test_actions_reach_intake() {
        let (url, mut intake_rx, _ui_tx) = start().await;
        let (mut client, _) = connect_async(url.as_str()).await.unwrap();
        let _config = client.next().await.unwrap().unwrap();

        client
            .send(Message::Text(r#"{"action":"pause"}"#.to_string()))
            .await
            .unwrap();
        client
            .send(Message::Text("not json".to_string()))
            .await
            .unwrap();
        client
            .send(Message::Text(r#"{"action":"reset-ecu"}"#.to_string()))
            .await
            .unwrap();

        assert_eq!(intake_rx.recv().await.unwrap(), UiAction::new("pause"));
        assert_eq!(intake_rx.recv().await.unwrap(), UiAction::new("reset-ecu"));
    }

    #[tokio::test]
    async fn test_rate_limit_spares_controls() {
        let (url, mut intake_rx, _ui_tx) = start().await;
        let (mut client, _) = connect_async(url.as_str()).await.unwrap();
        let _config = client.next().await.unwrap().unwrap();

        for _ in 0..MAX_ACTIONS_PER_SECOND + 5 {
            client
                .send(Message::Text(r#"{"action":"reset-ecu"}"#.to_string()))
                .await
                .unwrap();
        }
        client
            .send(Message::Text(r#"{"action":"pause"}"#.to_string()))
            .await
            .unwrap();

        for _ in 0..MAX_ACTIONS_PER_SECOND {
            assert_eq!(intake_rx.recv().await.unwrap(), UiAction::new("reset-ecu"));
        }
        assert_eq!(intake_rx.recv().await.unwrap(), UiAction::new("pause"));
    }
}
