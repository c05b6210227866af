//! WebSocket event stream for browser clients

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use intercept_core::Received;
use tracing::{debug, error, info};

use crate::routes::AppState;

/// Handle WebSocket upgrade request
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Wire form of one delivery
fn encode(received: &Received) -> Option<String> {
    let encoded = match received {
        Received::Event(event) => serde_json::to_string(event.as_ref()),
        Received::Overrun(dropped) => serde_json::to_string(&serde_json::json!({
            "type": "overrun",
            "dropped": dropped,
        })),
    };
    match encoded {
        Ok(json) => Some(json),
        Err(e) => {
            error!("Failed to encode event: {}", e);
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // subscribe before the snapshot so nothing falls between the two
    let mut sub = state.controller.subscribe();
    let id = sub.id();
    info!("WebSocket client {} connected", id);

    let snapshot = serde_json::json!({
        "type": "snapshot",
        "modes": state.controller.modes(),
        "devices": state.controller.devices(),
    });
    if let Ok(json) = serde_json::to_string(&snapshot) {
        if sender.send(Message::Text(json)).await.is_err() {
            return;
        }
    }

    let mut send_task = tokio::spawn(async move {
        while let Some(received) = sub.recv().await {
            if let Received::Overrun(n) = &received {
                debug!("WebSocket client {} lagged by {} events", id, n);
            }
            let Some(json) = encode(&received) else {
                continue;
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => debug!("Client {} sent: {}", id, text),
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!("WebSocket client {} error: {}", id, e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    info!("WebSocket client {} disconnected", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use intercept_core::event::{EventPayload, InterfaceRenamed};
    use intercept_core::{Event, ModeKind};

    #[test]
    fn test_event_frame_is_flat_json() {
        let event = Event::new(
            ModeKind::WifiScan,
            3,
            EventPayload::InterfaceRenamed(InterfaceRenamed {
                from: "wlan0".into(),
                to: "wlan0mon".into(),
            }),
        );
        let json = encode(&Received::Event(Arc::new(event))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "interface_renamed");
        assert_eq!(value["mode"], "wifi_scan");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["to"], "wlan0mon");
    }

    #[test]
    fn test_overrun_frame() {
        let json = encode(&Received::Overrun(42)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, serde_json::json!({"type": "overrun", "dropped": 42}));
    }
}
