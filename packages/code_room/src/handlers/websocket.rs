use axum::{
    extract::{Path, State, WebSocketUpgrade, ws::rejection::WebSocketUpgradeRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::config::RoomConfig;
use crate::session::is_valid_room_id;
use crate::ws;

/// Headroom for frame envelopes and run requests
const FRAME_OVERHEAD_BYTES: usize = 64 * 1024;

/// Worst-case JSON growth of one document byte (`\u00XX`)
const JSON_ESCAPE_FACTOR: usize = 6;

/// Largest client message accepted, so a near-limit edit is still decoded and
/// answered with `document_too_large` instead of a dropped connection
fn max_message_size(room_config: &RoomConfig) -> usize {
    room_config
        .max_document_bytes
        .saturating_mul(JSON_ESCAPE_FACTOR)
        .saturating_add(FRAME_OVERHEAD_BYTES)
}

/// Room WebSocket - one connection per participant
pub async fn room_websocket_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !is_valid_room_id(&room_id) {
        return (StatusCode::BAD_REQUEST, "invalid room id").into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let registry = state.registry.clone();
    let metrics = state.metrics.clone();
    let max_message = max_message_size(registry.room_config());

    ws.max_message_size(max_message)
        .max_frame_size(max_message)
        .on_upgrade(move |socket| ws::handle_room_ws(socket, room_id, registry, metrics))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_limit_fits_a_fully_escaped_document() {
        let room_config = crate::test_helpers::test_room_config();
        let doc = "\u{1}".repeat(room_config.max_document_bytes);
        let frame = serde_json::json!({
            "type": "edit",
            "data": {"baseVersion": 0, "rangeStart": 0, "rangeEnd": 0, "text": doc}
        })
        .to_string();
        assert!(frame.len() > room_config.max_document_bytes + FRAME_OVERHEAD_BYTES);
        assert!(frame.len() <= max_message_size(&room_config));

        let huge = RoomConfig {
            max_document_bytes: usize::MAX,
            ..room_config
        };
        assert_eq!(max_message_size(&huge), usize::MAX);
    }
    use axum::{Router, body::Body, http::Request, routing::get};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_invalid_room_id_is_rejected_before_upgrade() {
        let app = Router::new()
            .route("/ws/{room_id}", get(room_websocket_handler))
            .with_state(crate::test_helpers::test_app_state());

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/ws/bad%20room")
                    .header("connection", "upgrade")
                    .header("upgrade", "websocket")
                    .header("sec-websocket-version", "13")
                    .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
