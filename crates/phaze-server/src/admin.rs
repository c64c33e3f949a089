//! Admin HTTP API: provisioning and telemetry.
//!
//! Every route except `/health` requires the admin token, passed as
//! `x-admin-token` or `Authorization: Bearer`. Tokens shorter than 32
//! characters disable the API entirely.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use phaze_common::helpers::constant_time_eq;
use phaze_core::ClientMode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::dispatcher::{Dispatcher, Reply};
use crate::registry::{ClientInfo, ClientRegistry, RegistryError};

/// Minimum admin token length.
pub const MIN_ADMIN_TOKEN_LEN: usize = 32;

#[derive(Clone)]
pub struct AdminState {
    pub dispatcher: Arc<Dispatcher>,
    pub token: Option<Arc<str>>,
    /// Teardown frames for disconnected sessions go out through the server.
    pub outbound: Option<mpsc::Sender<Reply>>,
}

#[derive(Serialize)]
struct AdminError {
    error: String,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    established_sessions: usize,
    half_open_sessions: usize,
}

#[derive(Deserialize)]
pub struct CreateClientRequest {
    name: String,
    password: String,
    #[serde(default)]
    mode: ClientMode,
    #[serde(default)]
    tunnel_address: Option<IpAddr>,
}

#[derive(Deserialize)]
pub struct RotatePasswordRequest {
    password: String,
}

#[derive(Deserialize)]
pub struct SetModeRequest {
    mode: ClientMode,
}

#[derive(Deserialize)]
pub struct SetTunnelRequest {
    address: Option<IpAddr>,
}

#[derive(Serialize)]
struct RevokeResponse {
    revoked: bool,
    sessions_closed: usize,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/stats", get(stats))
        .route("/v1/clients", get(list_clients).post(create_client))
        .route("/v1/clients/:name", delete(revoke_client))
        .route("/v1/clients/:name/password", post(rotate_password))
        .route("/v1/clients/:name/mode", put(set_mode))
        .route("/v1/clients/:name/tunnel", put(set_tunnel))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(AdminError {
            error: message.into(),
        }),
    )
        .into_response()
}

fn unauthorized(message: &str) -> Response {
    error(StatusCode::UNAUTHORIZED, message)
}

fn extract_admin_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-admin-token") {
        if let Ok(token) = value.to_str() {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

enum AdminAuthError {
    Disabled,
    Invalid,
}

fn assert_admin(state: &AdminState, headers: &HeaderMap) -> Result<(), AdminAuthError> {
    let Some(expected) = state
        .token
        .as_deref()
        .filter(|t| t.len() >= MIN_ADMIN_TOKEN_LEN)
    else {
        return Err(AdminAuthError::Disabled);
    };

    let Some(got) = extract_admin_token(headers) else {
        return Err(AdminAuthError::Invalid);
    };

    if !constant_time_eq(&got, expected) {
        return Err(AdminAuthError::Invalid);
    }

    Ok(())
}

fn authorize(state: &AdminState, headers: &HeaderMap) -> Result<(), Response> {
    assert_admin(state, headers).map_err(|err| match err {
        AdminAuthError::Disabled => unauthorized("admin API disabled: set PHAZE_ADMIN_TOKEN"),
        AdminAuthError::Invalid => unauthorized("invalid admin token"),
    })
}

fn registry_error(err: RegistryError) -> Response {
    let status = match &err {
        RegistryError::DuplicateClient(_) => StatusCode::CONFLICT,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Revoked(_) => StatusCode::GONE,
        RegistryError::InvalidName(_) | RegistryError::EmptyPassword => StatusCode::BAD_REQUEST,
        RegistryError::Locked(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!("Registry operation failed: {}", err);
    }
    error(status, err.to_string())
}

/// Run a registry write off the async workers: it may hash a password or
/// wait for another process's lock on the registry file.
async fn registry_write<T, F>(state: &AdminState, write: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&ClientRegistry) -> Result<T, RegistryError> + Send + 'static,
{
    let registry = state.dispatcher.registry().clone();
    match tokio::task::spawn_blocking(move || write(&registry)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(registry_error(e)),
        Err(e) => Err(error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("registry task failed: {e}"),
        )),
    }
}

/// Disconnect a client's live sessions, returning how many were closed.
async fn disconnect(state: &AdminState, name: &str) -> usize {
    let replies = state.dispatcher.disconnect_client(name).await;
    let closed = replies.len();
    if let Some(outbound) = &state.outbound {
        for reply in replies {
            if outbound.send(reply).await.is_err() {
                break;
            }
        }
    }
    closed
}

fn client_info(state: &AdminState, name: &str) -> Response {
    match state.dispatcher.registry().lookup(name) {
        Some(identity) => (StatusCode::OK, Json(identity.info())).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("client not found: {}", name)),
    }
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let (established_sessions, half_open_sessions) = state.dispatcher.session_counts().await;
    (
        StatusCode::OK,
        Json(Health {
            status: "ok",
            established_sessions,
            half_open_sessions,
        }),
    )
}

async fn stats(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    (StatusCode::OK, Json(state.dispatcher.snapshot().await)).into_response()
}

async fn list_clients(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let clients: Vec<ClientInfo> = state.dispatcher.registry().list();
    (StatusCode::OK, Json(clients)).into_response()
}

async fn create_client(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(payload): Json<CreateClientRequest>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    let CreateClientRequest {
        name,
        password,
        mode,
        tunnel_address,
    } = payload;

    let result = registry_write(&state, move |registry| {
        let identity = registry.register(&name, password.as_bytes(), mode)?;
        if tunnel_address.is_some() {
            registry.set_tunnel_address(&identity.name, tunnel_address)?;
        }
        Ok(identity.name)
    })
    .await;

    match result {
        Ok(name) => {
            info!("Admin provisioned client {}", name);
            let mut response = client_info(&state, &name);
            *response.status_mut() = StatusCode::CREATED;
            response
        }
        Err(response) => response,
    }
}

async fn revoke_client(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    let client = name.clone();
    match registry_write(&state, move |registry| registry.revoke(&client)).await {
        Ok(revoked) => {
            let sessions_closed = disconnect(&state, &name).await;
            (
                StatusCode::OK,
                Json(RevokeResponse {
                    revoked,
                    sessions_closed,
                }),
            )
                .into_response()
        }
        Err(response) => response,
    }
}

async fn rotate_password(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(payload): Json<RotatePasswordRequest>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    let result = registry_write(&state, move |registry| {
        registry.rotate_password(&name, payload.password.as_bytes())
    })
    .await;

    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(response) => response,
    }
}

async fn set_mode(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(payload): Json<SetModeRequest>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    let client = name.clone();
    let mode = payload.mode;
    if let Err(response) =
        registry_write(&state, move |registry| registry.set_mode(&client, mode)).await
    {
        return response;
    }
    // Live sessions keep their transport; make them reconnect under the new one.
    disconnect(&state, &name).await;
    client_info(&state, &name)
}

async fn set_tunnel(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(payload): Json<SetTunnelRequest>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    let client = name.clone();
    let address = payload.address;
    if let Err(response) = registry_write(&state, move |registry| {
        registry.set_tunnel_address(&client, address)
    })
    .await
    {
        return response;
    }
    client_info(&state, &name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::registry::ClientRegistry;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use phaze_core::KdfParams;
    use tower::ServiceExt;

    const TOKEN: &str = "0123456789abcdef0123456789abcdef";
    const CHEAP: KdfParams = KdfParams {
        m_cost: 8,
        t_cost: 1,
        p_cost: 1,
    };

    fn state(token: Option<&str>) -> AdminState {
        let registry = Arc::new(ClientRegistry::new(CHEAP));
        let dispatcher = Dispatcher::new(ServerConfig::default(), registry).unwrap();
        AdminState {
            dispatcher: Arc::new(dispatcher),
            token: token.map(Arc::from),
            outbound: None,
        }
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-admin-token", TOKEN)
            .header(header::CONTENT_TYPE, "application/json");
        match body {
            Some(json) => builder.body(Body::from(json.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = router(state(None));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_short_token_disables_api() {
        let app = router(state(Some("short")));
        let response = app
            .oneshot(request("GET", "/v1/stats", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("disabled"));
    }

    #[tokio::test]
    async fn test_wrong_token_rejected() {
        let app = router(state(Some(TOKEN)));
        let response = app
            .oneshot(
                Request::get("/v1/clients")
                    .header(header::AUTHORIZATION, "Bearer not-the-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_client_lifecycle() {
        let app = router(state(Some(TOKEN)));

        let created = app
            .clone()
            .oneshot(request(
                "POST",
                "/v1/clients",
                Some(serde_json::json!({
                    "name": "alice",
                    "password": "hunter2",
                    "mode": "semi_ghost",
                    "tunnel_address": "10.8.0.2"
                })),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let body = json(created).await;
        assert_eq!(body["mode"], "semi_ghost");
        assert_eq!(body["tunnel_address"], "10.8.0.2");
        assert!(body.get("verifier").is_none());

        let duplicate = app
            .clone()
            .oneshot(request(
                "POST",
                "/v1/clients",
                Some(serde_json::json!({"name": "alice", "password": "x"})),
            ))
            .await
            .unwrap();
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let mode = app
            .clone()
            .oneshot(request(
                "PUT",
                "/v1/clients/alice/mode",
                Some(serde_json::json!({"mode": "full_ghost"})),
            ))
            .await
            .unwrap();
        assert_eq!(json(mode).await["mode"], "full_ghost");

        let rotated = app
            .clone()
            .oneshot(request(
                "POST",
                "/v1/clients/alice/password",
                Some(serde_json::json!({"password": "correct horse"})),
            ))
            .await
            .unwrap();
        assert_eq!(rotated.status(), StatusCode::NO_CONTENT);

        let revoked = app
            .clone()
            .oneshot(request("DELETE", "/v1/clients/alice", None))
            .await
            .unwrap();
        assert_eq!(json(revoked).await["revoked"], true);

        let again = app
            .clone()
            .oneshot(request("DELETE", "/v1/clients/alice", None))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::OK);
        assert_eq!(json(again).await["revoked"], false);

        let listed = app
            .clone()
            .oneshot(request("GET", "/v1/clients", None))
            .await
            .unwrap();
        let body = json(listed).await;
        assert_eq!(body[0]["name"], "alice");
        assert_eq!(body[0]["revoked"], true);

        let missing = app
            .oneshot(request("DELETE", "/v1/clients/nobody", None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let app = router(state(Some(TOKEN)));
        let response = app
            .oneshot(request(
                "POST",
                "/v1/clients",
                Some(serde_json::json!({"name": "bad name!", "password": "pw"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let app = router(state(Some(TOKEN)));
        let response = app
            .oneshot(request("GET", "/v1/stats", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["established_sessions"], 0);
        assert!(body["sessions"].as_array().unwrap().is_empty());
    }
}
