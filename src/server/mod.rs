use crate::connection::{ClickOutcome, ConnectError, ConnectionError, ConnectionManager};
use crate::mirror::PresenterView;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Clone)]
struct ServerState {
    token: String,
    rx: watch::Receiver<PresenterView>,
    manager: Arc<ConnectionManager>,
}

pub async fn start(
    addr: SocketAddr,
    token: String,
    rx: watch::Receiver<PresenterView>,
    manager: Arc<ConnectionManager>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = Arc::new(ServerState { token, rx, manager });

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "control surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/state", get(state_handler))
        .route("/ws", get(ws_handler))
        .route("/connect", post(connect_handler))
        .route("/recording/toggle", post(toggle_recording_handler))
        .with_state(state)
}

async fn state_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let view = state.rx.borrow().clone();
    (StatusCode::OK, Json(view)).into_response()
}

async fn connect_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.manager.connect_clicked().await {
        Ok(outcome) => {
            let outcome = match outcome {
                ClickOutcome::Connected => "connected",
                ClickOutcome::Disconnected => "disconnected",
            };
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "outcome": outcome,
                    "view": state.manager.mirror().snapshot().view(),
                })),
            )
                .into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn toggle_recording_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.manager.toggle_recording_clicked().await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "requested" })),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &ConnectionError) -> Response {
    let status = error_status(err);
    tracing::warn!(error = %err, status = status.as_u16(), "command failed");
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

fn error_status(err: &ConnectionError) -> StatusCode {
    match err {
        ConnectionError::Connect(ConnectError::Busy(_))
        | ConnectionError::Connect(ConnectError::Cancelled)
        | ConnectionError::NotConnected => StatusCode::CONFLICT,
        ConnectionError::Connect(ConnectError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
        ConnectionError::Auth(_)
        | ConnectionError::Connect(_)
        | ConnectionError::Request(_) => StatusCode::BAD_GATEWAY,
    }
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let rx = state.rx.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

async fn handle_socket(mut socket: WebSocket, mut rx: watch::Receiver<PresenterView>) {
    // Current view first, then one frame per presenter publish.
    let mut pending = true;

    loop {
        if pending {
            let payload = match serde_json::to_string(&*rx.borrow_and_update()) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(error = %err, "presenter view not serializable");
                    break;
                }
            };
            if socket.send(Message::Text(payload)).await.is_err() {
                break;
            }
            pending = false;
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                pending = true;
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn is_token_valid(headers: &HeaderMap, query: &HashMap<String, String>, token: &str) -> bool {
    // Authorization: Bearer <token>
    if let Some(auth_header) = headers.get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(provided_token) = auth_str.strip_prefix("Bearer ") {
                return provided_token == token;
            }
        }
    }

    // Browser sources cannot set headers.
    query.get("token").map(|t| t == token).unwrap_or(false)
}

async fn health_check(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "connection": state.manager.state(),
            "applied_updates": state.manager.mirror().applies(),
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionSettings;
    use crate::mirror::StateMirror;
    use crate::model::ConnectionState;
    use crate::transport::fake::{ConnectBehavior, FakeTransport};
    use std::time::Duration;

    const TOKEN: &str = "s3cret";

    fn server_state() -> (Arc<FakeTransport>, watch::Sender<PresenterView>, Arc<ServerState>) {
        let fake = Arc::new(FakeTransport::new());
        let mirror = StateMirror::new();
        let (tx, rx) = watch::channel(mirror.snapshot().view());
        let manager = ConnectionManager::new(
            fake.clone(),
            mirror,
            ConnectionSettings {
                address: "ws://127.0.0.1:4455".parse().unwrap(),
                password: None,
                timeout: Duration::from_millis(500),
            },
        );
        let state = Arc::new(ServerState {
            token: TOKEN.to_string(),
            rx,
            manager: Arc::new(manager),
        });
        (fake, tx, state)
    }

    fn authed() -> Query<HashMap<String, String>> {
        Query(HashMap::from([("token".to_string(), TOKEN.to_string())]))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn token_from_header_or_query() {
        let empty = HashMap::new();
        let mut headers = HeaderMap::new();
        assert!(!is_token_valid(&headers, &empty, TOKEN));

        headers.insert("authorization", "Bearer s3cret".parse().unwrap());
        assert!(is_token_valid(&headers, &empty, TOKEN));

        headers.insert("authorization", "Bearer nope".parse().unwrap());
        let query = HashMap::from([("token".to_string(), TOKEN.to_string())]);
        // A wrong header is not rescued by a correct query token.
        assert!(!is_token_valid(&headers, &query, TOKEN));
        assert!(is_token_valid(&HeaderMap::new(), &query, TOKEN));
    }

    #[test]
    fn command_errors_map_to_statuses() {
        use crate::connection::AuthError;
        assert_eq!(
            error_status(&ConnectError::Busy(ConnectionState::Connecting).into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&ConnectionError::NotConnected),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(
                &ConnectError::Timeout {
                    step: "connect",
                    timeout_ms: 500
                }
                .into()
            ),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            error_status(
                &AuthError {
                    address: "ws://127.0.0.1:4455".to_string(),
                    reason: "Authentication failed.".to_string(),
                }
                .into()
            ),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn state_requires_token() {
        let (_fake, _tx, state) = server_state();
        let resp = state_handler(State(state), HeaderMap::new(), Query(HashMap::new())).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn state_serves_latest_published_view() {
        let (_fake, tx, state) = server_state();
        let resp = state_handler(State(state.clone()), HeaderMap::new(), authed()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["connection_label"], "Connect");
        assert_eq!(body["streaming_label"], "Offline");

        let mut view = state.rx.borrow().clone();
        view.current_scene = "Intermission".to_string();
        tx.send(view).unwrap();
        let body = body_json(state_handler(State(state), HeaderMap::new(), authed()).await).await;
        assert_eq!(body["current_scene"], "Intermission");
    }

    #[tokio::test]
    async fn connect_then_disconnect_via_surface() {
        let (fake, _tx, state) = server_state();
        fake.set_status(true, false);

        let resp = connect_handler(State(state.clone()), HeaderMap::new(), authed()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["outcome"], "connected");
        assert_eq!(body["view"]["streaming_label"], "Stop streaming");
        assert_eq!(state.manager.state(), ConnectionState::Connected);

        let resp = connect_handler(State(state.clone()), HeaderMap::new(), authed()).await;
        assert_eq!(body_json(resp).await["outcome"], "disconnected");
        assert_eq!(fake.handler_count(), 0);
    }

    #[tokio::test]
    async fn failed_connect_reports_bad_gateway() {
        let (fake, _tx, state) = server_state();
        fake.set_behavior(ConnectBehavior::Unreachable);
        let resp = connect_handler(State(state.clone()), HeaderMap::new(), authed()).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(state.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn toggle_recording_needs_session() {
        let (fake, _tx, state) = server_state();
        let resp = toggle_recording_handler(State(state.clone()), HeaderMap::new(), authed()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        connect_handler(State(state.clone()), HeaderMap::new(), authed()).await;
        let resp = toggle_recording_handler(State(state), HeaderMap::new(), authed()).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(fake.calls(|c| c.toggle_recording), 1);
    }

    #[tokio::test]
    async fn health_reports_connection_state() {
        let (_fake, _tx, state) = server_state();
        let body = body_json(health_check(State(state)).await.into_response()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connection"], "Disconnected");
        assert_eq!(body["applied_updates"], 0);
    }

    #[tokio::test]
    async fn health_counts_applied_updates() {
        let (_fake, _tx, state) = server_state();
        connect_handler(State(state.clone()), HeaderMap::new(), authed()).await;
        let body = body_json(health_check(State(state)).await.into_response()).await;
        assert_eq!(body["connection"], "Connected");
        // Connected plus version, streaming and recording from reconciliation.
        assert_eq!(body["applied_updates"], 4);
    }
}
