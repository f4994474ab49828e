//! The admin HTTP surface over the client-status snapshot.

use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use vigil_status::{StatusBucket, StatusStore as _, StatusStoreService};

/// Shared state of the admin routes.
#[derive(Clone)]
pub struct AdminState {
    /// The status store backing every route.
    pub status: StatusStoreService,
    /// Name this server reports in its responses.
    pub server_name: String,
}

#[derive(Debug, Deserialize)]
struct KeysRequest {
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ClientStatusKind {
    Normal,
    Pause,
    Block,
}

impl ClientStatusKind {
    fn name(&self) -> &'static str {
        match self {
            ClientStatusKind::Normal => "normal",
            ClientStatusKind::Pause => "pause",
            ClientStatusKind::Block => "block",
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusUpdateRequest {
    username: String,
    status: ClientStatusKind,
}

/// Creates the admin `Router`, CORS-restricted to `allowed_origin`.
pub fn routes(state: AdminState, allowed_origin: &str) -> eyre::Result<Router> {
    let origin = allowed_origin
        .parse::<HeaderValue>()
        .map_err(|err| eyre::eyre!("invalid admin origin '{allowed_origin}': {err}"))?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([http::header::CONTENT_TYPE])
        .allow_credentials(true);
    Ok(Router::new()
        .route("/redis/get", post(get_from_snapshot))
        .route("/client/status/update", post(update_client_status))
        .layer(cors)
        .with_state(state))
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": detail.into() }))).into_response()
}

async fn get_from_snapshot(
    State(state): State<AdminState>,
    Json(request): Json<KeysRequest>,
) -> Response {
    if request.keys.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "No keys provided");
    }
    let snapshot = match state.status.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("status store error: {err}"),
            );
        }
    };
    tracing::debug!("[/redis/get] current snapshot: {snapshot:?}");
    let mut data = Vec::with_capacity(request.keys.len());
    for key in &request.keys {
        let Some(bucket) = StatusBucket::from_key(key) else {
            return error_response(StatusCode::NOT_FOUND, format!("Key '{key}' not found"));
        };
        data.push(json!({ key: snapshot.bucket(bucket) }));
    }
    Json(json!({ "server": state.server_name, "data": data })).into_response()
}

/// Moves a client between the normal/paused/blocked states.
///
/// Transitions pop the client from its previous bucket and push it into the
/// target one; asking for the current state is a no-op reported with
/// `success: false`.
async fn update_client_status(
    State(state): State<AdminState>,
    Json(request): Json<StatusUpdateRequest>,
) -> Response {
    let snapshot = match state.status.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("status store error: {err}"),
            );
        }
    };
    tracing::debug!("[/client/status/update] current snapshot: {snapshot:?}");
    let mut paused = snapshot.paused_clients.clone();
    let mut blocked = snapshot.blocked_clients.clone();
    let username = request.username;

    let prev_status = if paused.iter().any(|name| *name == username) {
        ClientStatusKind::Pause
    } else if blocked.iter().any(|name| *name == username) {
        ClientStatusKind::Block
    } else {
        ClientStatusKind::Normal
    };
    if prev_status == request.status {
        return Json(json!({
            "success": false,
            "message": format!("{username} already in {} clients.", request.status.name()),
        }))
        .into_response();
    }

    paused.retain(|name| *name != username);
    blocked.retain(|name| *name != username);
    match request.status {
        ClientStatusKind::Pause => paused.push(username.clone()),
        ClientStatusKind::Block => blocked.push(username.clone()),
        ClientStatusKind::Normal => {}
    }

    let writes = [
        state
            .status
            .replace_bucket(StatusBucket::Paused, paused.clone())
            .await,
        state
            .status
            .replace_bucket(StatusBucket::Blocked, blocked.clone())
            .await,
    ];
    if let Some(err) = writes.into_iter().find_map(Result::err) {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("status store error: {err}"),
        );
    }

    Json(json!({
        "success": true,
        "message": format!(
            "{username} moved from {} to {}.",
            prev_status.name(),
            request.status.name()
        ),
        "prev_status": prev_status.name(),
        "new_status": request.status.name(),
        "data": {
            "paused_clients": paused,
            "blocked_clients": blocked,
        }
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum_test::TestServer;
    use vigil_test_utils::MemoryStatusStore;

    use super::*;

    fn server(store: Arc<MemoryStatusStore>) -> TestServer {
        let router = routes(
            AdminState {
                status: store,
                server_name: "test-server".to_owned(),
            },
            "http://localhost:3000",
        )
        .unwrap();
        TestServer::new(router).unwrap()
    }

    #[tokio::test]
    async fn reads_known_buckets_and_rejects_unknown_keys() {
        let store = Arc::new(MemoryStatusStore::default());
        store.seed(StatusBucket::Paused, &["obama"]);
        let server = server(store);

        let response = server
            .post("/redis/get")
            .json(&json!({ "keys": ["paused_clients"] }))
            .await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["server"], "test-server");
        assert_eq!(body["data"][0]["paused_clients"][0], "obama");

        server
            .post("/redis/get")
            .json(&json!({ "keys": ["nope"] }))
            .await
            .assert_status_not_found();
        server
            .post("/redis/get")
            .json(&json!({ "keys": [] }))
            .await
            .assert_status_bad_request();
    }

    #[tokio::test]
    async fn status_transitions_move_between_buckets() {
        let store = Arc::new(MemoryStatusStore::default());
        let server = server(store.clone());

        let response = server
            .post("/client/status/update")
            .json(&json!({ "username": "obama", "status": "pause" }))
            .await;
        let body: serde_json::Value = response.json();
        assert_eq!(body["success"], true);
        assert_eq!(body["prev_status"], "normal");
        assert_eq!(body["new_status"], "pause");

        let response = server
            .post("/client/status/update")
            .json(&json!({ "username": "obama", "status": "block" }))
            .await;
        let body: serde_json::Value = response.json();
        assert_eq!(body["prev_status"], "pause");
        assert_eq!(body["data"]["paused_clients"].as_array().unwrap().len(), 0);
        assert_eq!(body["data"]["blocked_clients"][0], "obama");

        // back to normal clears both buckets
        let response = server
            .post("/client/status/update")
            .json(&json!({ "username": "obama", "status": "normal" }))
            .await;
        let body: serde_json::Value = response.json();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["blocked_clients"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn repeating_the_current_status_is_a_no_op() {
        let store = Arc::new(MemoryStatusStore::default());
        store.seed(StatusBucket::Paused, &["obama"]);
        let server = server(store);

        let response = server
            .post("/client/status/update")
            .json(&json!({ "username": "obama", "status": "pause" }))
            .await;
        let body: serde_json::Value = response.json();
        assert_eq!(body["success"], false);
    }
}
