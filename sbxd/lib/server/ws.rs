//! WebSocket endpoints: outbound event streaming and inbound sidecar ingest.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
};
use sbxapi::{now_timestamp, ExecEvent};
use serde::Deserialize;

use crate::management::sandbox_namespace;

use super::state::ServerState;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Query parameters of the stream endpoint.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Restrict the stream to one exec.
    pub exec_id: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for GET /sandboxes/{id}/stream (WebSocket upgrade)
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_session(state, socket, id, query.exec_id))
}

/// Handler for GET /sandboxes/{id}/ingest (WebSocket upgrade)
pub async fn ingest_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ingest_session(state, socket, id))
}

//--------------------------------------------------------------------------------------------------
// Functions: Sessions
//--------------------------------------------------------------------------------------------------

/// Replays the snapshot, then forwards live events until the client goes
/// away. Events are rewritten to carry the id the client addressed us with.
async fn stream_session(
    state: ServerState,
    mut socket: WebSocket,
    id: String,
    exec_filter: Option<String>,
) {
    let namespace = sandbox_namespace(&id);
    let mut sub = state.get_hub().subscribe(&namespace);

    for evt in std::mem::take(&mut sub.snapshot) {
        if !send_event(&mut socket, evt, &id, exec_filter.as_deref()).await {
            state.get_hub().unsubscribe(&namespace, sub.id);
            return;
        }
    }
    while let Some(evt) = sub.rx.recv().await {
        if !send_event(&mut socket, evt, &id, exec_filter.as_deref()).await {
            break;
        }
    }
    state.get_hub().unsubscribe(&namespace, sub.id);
}

/// Sends one event unless the exec filter drops it. Returns `false` once the
/// socket is gone.
async fn send_event(
    socket: &mut WebSocket,
    mut evt: ExecEvent,
    id: &str,
    exec_filter: Option<&str>,
) -> bool {
    if let Some(filter) = exec_filter {
        if evt.exec_id != filter {
            return true;
        }
    }
    evt.sandbox_id = id.to_string();
    let Result::Ok(payload) = serde_json::to_string(&evt) else {
        return true;
    };
    socket.send(Message::Text(payload.into())).await.is_ok()
}

/// Reads event frames from a sidecar forwarder, stamps and republishes them.
/// Malformed frames are skipped silently; the session ends on transport
/// error or close.
async fn ingest_session(state: ServerState, mut socket: WebSocket, id: String) {
    let namespace = sandbox_namespace(&id);
    while let Some(frame) = socket.recv().await {
        let payload = match frame {
            Result::Ok(Message::Text(text)) => text.to_string(),
            Result::Ok(Message::Binary(bytes)) => {
                String::from_utf8_lossy(bytes.as_ref()).into_owned()
            }
            Result::Ok(Message::Close(_)) | Err(_) => return,
            Result::Ok(_) => continue,
        };
        if let Some(evt) = parse_ingest_frame(&payload, &namespace) {
            state.get_hub().publish(evt);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Parses one ingest frame, stamping the authoritative sandbox id and
/// filling the timestamp when the producer left it empty. Returns `None` for
/// frames that do not parse.
fn parse_ingest_frame(payload: &str, namespace: &str) -> Option<ExecEvent> {
    let mut evt: ExecEvent = serde_json::from_str(payload).ok()?;
    evt.sandbox_id = namespace.to_string();
    if evt.time.is_empty() {
        evt.time = now_timestamp();
    }
    Some(evt)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use sbxapi::EventType;

    use super::*;

    #[test]
    fn test_parse_ingest_frame_stamps_sandbox_and_time() {
        let payload = r#"{"sandbox_id":"spoofed","exec_id":"ab","type":"start"}"#;
        let evt = parse_ingest_frame(payload, "sbx-real").unwrap();
        assert_eq!(evt.sandbox_id, "sbx-real");
        assert_eq!(evt.event_type, EventType::Start);
        assert!(!evt.time.is_empty());
    }

    #[test]
    fn test_parse_ingest_frame_keeps_producer_time() {
        let payload = r#"{"sandbox_id":"x","exec_id":"ab","type":"exit","exit_code":0,
                          "time":"2024-01-01T00:00:00.000000001Z"}"#;
        let evt = parse_ingest_frame(payload, "sbx-real").unwrap();
        assert_eq!(evt.time, "2024-01-01T00:00:00.000000001Z");
        assert_eq!(evt.exit_code, Some(0));
    }

    #[test]
    fn test_parse_ingest_frame_rejects_malformed() {
        assert!(parse_ingest_frame("not json", "sbx-a").is_none());
        assert!(parse_ingest_frame(r#"{"type":"bogus"}"#, "sbx-a").is_none());
    }
}
