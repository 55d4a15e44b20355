use crate::fanout::FanoutBroker;
use crate::models::event::PublicEvent;
use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

/// How long a client may take to name its symbols before being turned away.
const SYMBOLS_WAIT: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(20);
/// Per-subscriber delivery buffer; a client that falls this far behind is
/// dropped by the broker.
const DELIVERY_BUFFER: usize = 256;

/// Per-symbol WebSocket push server.
///
/// Clients declare symbols either in the upgrade query string
/// (`?symbols=BTC,ETH`) or as their first message — a plain CSV string or
/// `{"symbols":"BTC,ETH"}`. From then on the server pushes one JSON event
/// per delivery; anything the client sends is ignored and merely keeps the
/// connection warm.
pub async fn serve(
    broker: Arc<FanoutBroker>,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind WS port {port}"))?;
    info!("WS push server listening on 0.0.0.0:{port}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_client(stream, peer, broker.clone()));
                    }
                    Err(e) => warn!("WS accept failed: {e}"),
                }
            }
            _ = shutdown.recv() => {
                info!("WS push server shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, broker: Arc<FanoutBroker>) {
    let mut request_path: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        request_path = Some(req.uri().to_string());
        Ok(resp)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WS handshake failed for {peer}: {e}");
            return;
        }
    };

    let (mut write, mut read) = ws.split();

    let mut symbols = symbols_from_path(request_path.as_deref());
    if symbols.is_empty() {
        // No query parameter: the first message names the symbols
        symbols = match tokio::time::timeout(SYMBOLS_WAIT, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => symbols_from_message(&text),
            _ => Vec::new(),
        };
    }

    if symbols.is_empty() {
        let _ = write
            .send(Message::Text(r#"{"error":"symbols required"}"#.to_string()))
            .await;
        let _ = write.send(Message::Close(None)).await;
        debug!("WS client {peer} closed: no symbols");
        return;
    }

    info!("WS client {peer} subscribed to {symbols:?}");
    let (subscriber_id, mut deliveries) = broker.subscribe(&symbols, DELIVERY_BUFFER);

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            delivery = deliveries.recv() => {
                match delivery {
                    Some(stored) => {
                        let payload = match serde_json::to_string(&PublicEvent::from(&stored)) {
                            Ok(p) => p,
                            Err(_) => continue,
                        };
                        if write.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    // The broker already dropped us (lagging consumer)
                    None => break,
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    // Client chatter is ignored; it doubles as keepalive
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WS client {peer} error: {e}");
                        break;
                    }
                }
            }
            _ = ping_timer.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    broker.unsubscribe(subscriber_id);
    info!("WS client {peer} disconnected");
}

fn symbols_from_path(path: Option<&str>) -> Vec<String> {
    let Some(path) = path else {
        return Vec::new();
    };
    let Ok(url) = Url::parse(&format!("ws://localhost{path}")) else {
        return Vec::new();
    };
    url.query_pairs()
        .find(|(key, _)| key == "symbols")
        .map(|(_, value)| parse_symbol_list(&value))
        .unwrap_or_default()
}

/// First-message subscription: a JSON object with a `symbols` field, or any
/// other text treated as a bare CSV list.
fn symbols_from_message(text: &str) -> Vec<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        if let Some(object) = value.as_object() {
            return object
                .get("symbols")
                .and_then(|v| v.as_str())
                .map(parse_symbol_list)
                .unwrap_or_default();
        }
    }
    parse_symbol_list(text)
}

fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}
