//! WebSocket signaling
//!
//! One signaling transport corresponds to one peer session. The dialect is
//! minimal: the server greets with `welcome`, the client sends `connect`,
//! the server replies with the gathered offer, then `answer`/`candidate`
//! complete negotiation. Closing the transport destroys the session.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::any,
    Router,
};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// Messages the browser sends over the signaling transport
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Connect,
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(default)]
        mid: Option<String>,
    },
}

/// Messages the server sends
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Welcome {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
}

impl ServerMessage {
    /// Wrap a local description whose type the peer connection chose
    fn description(sdp_type: &str, sdp: String) -> Self {
        match sdp_type {
            "answer" => ServerMessage::Answer { sdp },
            _ => ServerMessage::Offer { sdp },
        }
    }
}

/// Router served on the signaling port
pub fn signaling_router(state: Arc<AppState>) -> Router {
    Router::new().route("/", any(ws_handler)).with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_transport(socket, state))
}

async fn handle_transport(mut socket: WebSocket, state: Arc<AppState>) {
    let welcome = ServerMessage::Welcome {
        peer_id: "server".to_string(),
    };
    if send(&mut socket, &welcome).await.is_err() {
        return;
    }

    let mut peer_id: Option<String> = None;

    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };

        let parsed = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!("Unrecognized signaling message '{}': {}", text, e);
                continue;
            }
        };

        match parsed {
            ClientMessage::Connect => {
                if peer_id.is_some() {
                    tracing::warn!("Duplicate connect on one signaling transport");
                    continue;
                }
                match state.sessions.create_session().await {
                    Ok((id, sdp_type, sdp)) => {
                        peer_id = Some(id);
                        if send(&mut socket, &ServerMessage::description(&sdp_type, sdp))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to create peer session: {}", e);
                        break;
                    }
                }
            }
            ClientMessage::Answer { sdp } => {
                let Some(ref id) = peer_id else { continue };
                if let Err(e) = state.sessions.apply_answer(id, sdp).await {
                    tracing::warn!("Answer from {} rejected: {}", id, e);
                }
            }
            ClientMessage::Candidate { candidate, mid } => {
                let Some(ref id) = peer_id else { continue };
                if candidate.is_empty() {
                    continue;
                }
                if let Err(e) = state.sessions.add_candidate(id, candidate, mid).await {
                    tracing::debug!("Candidate for {} dropped: {}", id, e);
                }
            }
        }
    }

    if let Some(id) = peer_id {
        state.sessions.remove_session(&id).await;
    }
    tracing::debug!("Signaling transport closed");
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).expect("signaling messages serialize");
    socket.send(Message::Text(json)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_spellings_match_the_dialect() {
        assert!(matches!(
            serde_json::from_str::<ClientMessage>("{\"type\":\"connect\"}").unwrap(),
            ClientMessage::Connect
        ));

        let answer =
            serde_json::from_str::<ClientMessage>("{\"type\":\"answer\",\"sdp\":\"v=0\"}").unwrap();
        assert!(matches!(answer, ClientMessage::Answer { sdp } if sdp == "v=0"));

        let candidate = serde_json::from_str::<ClientMessage>(
            "{\"type\":\"candidate\",\"candidate\":\"candidate:1 1 UDP 1 1.2.3.4 5 typ host\",\"mid\":\"0\"}",
        )
        .unwrap();
        assert!(
            matches!(candidate, ClientMessage::Candidate { ref mid, .. } if mid.as_deref() == Some("0"))
        );

        // mid may be absent
        let bare = serde_json::from_str::<ClientMessage>(
            "{\"type\":\"candidate\",\"candidate\":\"candidate:2\"}",
        )
        .unwrap();
        assert!(matches!(bare, ClientMessage::Candidate { mid: None, .. }));
    }

    #[test]
    fn outbound_spellings_match_the_dialect() {
        let welcome = serde_json::to_string(&ServerMessage::Welcome {
            peer_id: "server".into(),
        })
        .unwrap();
        assert_eq!(welcome, "{\"type\":\"welcome\",\"peerId\":\"server\"}");

        let offer = serde_json::to_string(&ServerMessage::Offer { sdp: "v=0".into() }).unwrap();
        assert_eq!(offer, "{\"type\":\"offer\",\"sdp\":\"v=0\"}");
    }

    #[test]
    fn escaped_sdp_strings_round_trip() {
        // Standard JSON escapes in the sdp field must survive parsing
        let raw = "{\"type\":\"answer\",\"sdp\":\"v=0\\r\\no=- 1 1 IN IP4 0.0.0.0\\r\\n\"}";
        let msg = serde_json::from_str::<ClientMessage>(raw).unwrap();
        if let ClientMessage::Answer { sdp } = msg {
            assert!(sdp.contains("\r\no=-"));
        } else {
            panic!("expected answer");
        }
    }
}
