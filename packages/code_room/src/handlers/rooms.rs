use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::session::SessionInfo;

pub async fn list_rooms(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list().await)
}

pub async fn get_room(State(state): State<AppState>, Path(room_id): Path<String>) -> Response {
    let info = match state.registry.get(&room_id).await {
        Some(handle) => handle.get_info().await,
        None => None,
    };
    match info {
        Some(info) => Json(info).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LanguagesResponse {
    /// Language of a room created without a preference
    pub default: String,
    /// Languages that can be executed
    pub runnable: Vec<String>,
}

pub async fn list_languages(State(state): State<AppState>) -> Json<LanguagesResponse> {
    Json(LanguagesResponse {
        default: state.registry.room_config().default_language.clone(),
        runnable: state.run_config.languages.keys().cloned().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Participant;
    use axum::{Router, body::Body, http::Request, routing::get};
    use tower::ServiceExt;

    fn test_router(state: AppState) -> Router {
        Router::new()
            .route("/api/rooms", get(list_rooms))
            .route("/api/rooms/{room_id}", get(get_room))
            .route("/api/languages", get(list_languages))
            .with_state(state)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(resp: Response) -> T {
        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_list_rooms_empty() {
        let app = test_router(crate::test_helpers::test_app_state());
        let resp = app.oneshot(get_req("/api/rooms")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let rooms: Vec<SessionInfo> = body_json(resp).await;
        assert!(rooms.is_empty());
    }

    #[tokio::test]
    async fn test_get_room_not_found() {
        let app = test_router(crate::test_helpers::test_app_state());
        let resp = app.oneshot(get_req("/api/rooms/nowhere")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_room_after_join() {
        let state = crate::test_helpers::test_app_state();
        let (participant, _rx) = Participant::channel(8);
        state
            .registry
            .join("room-7", participant, Some("cpp"))
            .await
            .unwrap();

        let resp = test_router(state)
            .oneshot(get_req("/api/rooms/room-7"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let info: SessionInfo = body_json(resp).await;
        assert_eq!(info.room_id, "room-7");
        assert_eq!(info.language, "cpp");
        assert_eq!(info.participants, 1);
        assert_eq!(info.version, 0);
        assert!(!info.running);
    }

    #[tokio::test]
    async fn test_list_languages() {
        let app = test_router(crate::test_helpers::test_app_state());
        let resp = app.oneshot(get_req("/api/languages")).await.unwrap();
        let languages: LanguagesResponse = body_json(resp).await;
        assert_eq!(languages.default, "python");
        assert!(languages.runnable.contains(&"shell".to_string()));
    }
}
