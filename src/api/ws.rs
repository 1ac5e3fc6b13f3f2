use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use tokio::sync::mpsc;
use tracing::debug;

use super::AppState;
use crate::broadcast::{ObserverConnection, SubscriptionClass};

/// Bridges the broadcaster to one websocket through a bounded channel.
/// A closed or saturated channel surfaces as a send error, which makes
/// the broadcaster drop the connection.
struct WsObserver {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl ObserverConnection for WsObserver {
    async fn send(&self, payload: &serde_json::Value) -> anyhow::Result<()> {
        let text = serde_json::to_string(payload)?;
        self.tx
            .send(text)
            .await
            .map_err(|_| anyhow::anyhow!("websocket channel closed"))?;
        Ok(())
    }
}

pub async fn ws_alerts(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, SubscriptionClass::AlertsOnly))
}

pub async fn ws_traffic(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, SubscriptionClass::AllTraffic))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, class: SubscriptionClass) {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let id = state
        .broadcaster
        .register(Arc::new(WsObserver { tx }), class)
        .await;

    loop {
        tokio::select! {
            // Forward broadcaster payloads to the client
            payload = rx.recv() => {
                match payload {
                    Some(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            // Drain incoming frames and detect disconnect
            msg = socket.recv() => {
                match msg {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }

    state.broadcaster.deregister(id).await;
    debug!(%id, ?class, "websocket closed");
}
