use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{FromRef, Path, State},
    http::{HeaderMap, Method, StatusCode},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tandem_shared::{CallId, CallRecord, MediaKind, UserId};
use tandem_store::User;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{AuthUser, TokenVerifier};
use crate::calls::CallService;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::registry::SessionRegistry;
use crate::ws::ws_upgrade;

#[derive(Clone)]
pub struct AppState {
    pub calls: CallService,
    pub registry: SessionRegistry,
    pub verifier: TokenVerifier,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl FromRef<AppState> for TokenVerifier {
    fn from_ref(state: &AppState) -> Self {
        state.verifier.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/api/calls/initiate", post(initiate_call))
        .route("/api/calls/active", get(active_call))
        .route("/api/calls/history", get(call_history))
        .route("/api/calls/:id", get(get_call))
        .route("/api/calls/:id/answer", post(answer_call))
        .route("/api/calls/:id/reject", post(reject_call))
        .route("/api/calls/:id/end", post(end_call))
        .route("/api/users/:id", get(get_user))
        .route("/admin/users", post(admin_register_user))
        .route("/admin/status", get(admin_status))
        .route("/ws", get(ws_upgrade))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    ring_timeout_secs: Option<u64>,
    history_limit: u32,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    name: String,
    online_sessions: usize,
    active_calls: u64,
    registered_users: u64,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct InitiateRequest {
    receiver_id: String,
    #[serde(default)]
    media_kind: Option<String>,
}

#[derive(Deserialize)]
struct RegisterUserRequest {
    id: UserId,
    #[serde(default)]
    display_name: Option<String>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        ring_timeout_secs: state.config.ring_timeout.map(|t| t.as_secs()),
        history_limit: state.config.history_limit,
    })
}

// ─── Call control ───

async fn initiate_call(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Json(req): Json<InitiateRequest>,
) -> Result<(StatusCode, Json<CallRecord>), ServerError> {
    let receiver = UserId::parse(req.receiver_id.trim())
        .map_err(|e| ServerError::BadRequest(format!("Invalid receiver_id: {e}")))?;
    let media_kind = match req.media_kind.as_deref() {
        None => MediaKind::default(),
        Some(raw) => MediaKind::parse(raw)
            .ok_or_else(|| ServerError::BadRequest(format!("Unknown media_kind: {raw}")))?,
    };

    let call = state.calls.initiate(caller, receiver, media_kind).await?;
    Ok((StatusCode::CREATED, Json(call)))
}

async fn answer_call(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<CallId>,
) -> Result<Json<CallRecord>, ServerError> {
    Ok(Json(state.calls.answer(id, user).await?))
}

async fn reject_call(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<CallId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.calls.reject(id, user).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn end_call(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<CallId>,
) -> Result<Json<CallRecord>, ServerError> {
    Ok(Json(state.calls.end(id, user).await?))
}

async fn active_call(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Option<CallRecord>>, ServerError> {
    Ok(Json(state.calls.active_for(user).await?))
}

async fn call_history(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<CallRecord>>, ServerError> {
    Ok(Json(state.calls.history_for(user).await?))
}

async fn get_call(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<CallId>,
) -> Result<Json<CallRecord>, ServerError> {
    Ok(Json(state.calls.get_for(id, user).await?))
}

// ─── Directory ───

async fn get_user(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(id): Path<UserId>,
) -> Result<Json<User>, ServerError> {
    Ok(Json(state.calls.user(id).await?))
}

// ─── Admin ───

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    use subtle::ConstantTimeEq;
    let matches = presented.len() == expected.len()
        && presented.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() == 1;
    if !matches {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }
    Ok(())
}

async fn admin_register_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<RegisterUserRequest>,
) -> Result<Json<User>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let user = state.calls.register_user(req.id, req.display_name).await?;
    info!(user = %user.id.short(), "directory user registered");
    Ok(Json(user))
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        online_sessions: state.registry.online_count(),
        active_calls: state.calls.active_call_count().await?,
        registered_users: state.calls.user_count().await?,
        uptime_secs: state.started_at.elapsed().as_secs(),
    }))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{Duration, Utc};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use tandem_shared::{CallStatus, SessionToken};
    use tandem_store::Database;
    use tower::ServiceExt;

    use crate::calls::CallSettings;
    use crate::clock::SystemClock;
    use crate::relay::SignalingRelay;

    const ADMIN: &str = "admin-secret";

    struct Harness {
        router: Router,
        issuer: SigningKey,
    }

    impl Harness {
        fn new() -> Self {
            let issuer = SigningKey::generate(&mut OsRng);
            let config = ServerConfig {
                auth_pubkey: issuer.verifying_key().to_bytes(),
                admin_token: Some(ADMIN.to_string()),
                ring_timeout: None,
                ..ServerConfig::default()
            };
            let registry = SessionRegistry::new();
            let calls = CallService::new(
                Database::open_in_memory().unwrap(),
                SignalingRelay::new(registry.clone()),
                Arc::new(SystemClock),
                CallSettings {
                    ring_timeout: None,
                    history_limit: config.history_limit,
                },
            );
            let state = AppState {
                calls,
                registry,
                verifier: TokenVerifier::new(config.auth_pubkey),
                rate_limiter: RateLimiter::per_minute(0),
                config: Arc::new(config),
                started_at: Instant::now(),
            };
            Self {
                router: build_router(state),
                issuer,
            }
        }

        fn token(&self, user: UserId) -> String {
            SessionToken::issue(user, Utc::now() + Duration::hours(1), &self.issuer).encode()
        }

        async fn user(&self) -> UserId {
            let id = UserId::new();
            let (status, _) = self
                .send(
                    Request::post("/admin/users")
                        .header("authorization", format!("Bearer {ADMIN}"))
                        .header("content-type", "application/json")
                        .body(Body::from(serde_json::json!({ "id": id }).to_string()))
                        .unwrap(),
                )
                .await;
            assert_eq!(status, StatusCode::OK);
            id
        }

        async fn send(&self, req: Request<Body>) -> (StatusCode, serde_json::Value) {
            let response = self.router.clone().oneshot(req).await.unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body = if bytes.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, body)
        }

        async fn post(
            &self,
            user: UserId,
            uri: &str,
            body: Option<serde_json::Value>,
        ) -> (StatusCode, serde_json::Value) {
            let builder = Request::post(uri).header("authorization", format!("Bearer {}", self.token(user)));
            let req = match body {
                Some(json) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(json.to_string())),
                None => builder.body(Body::empty()),
            };
            self.send(req.unwrap()).await
        }

        async fn get(&self, user: UserId, uri: &str) -> (StatusCode, serde_json::Value) {
            self.send(
                Request::get(uri)
                    .header("authorization", format!("Bearer {}", self.token(user)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
        }

        async fn initiate(&self, caller: UserId, receiver: UserId) -> (StatusCode, serde_json::Value) {
            self.post(
                caller,
                "/api/calls/initiate",
                Some(serde_json::json!({ "receiver_id": receiver, "media_kind": "video" })),
            )
            .await
        }
    }

    #[tokio::test]
    async fn test_health() {
        let h = Harness::new();
        let (status, body) = h
            .send(Request::get("/health").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_call_routes_require_a_token() {
        let h = Harness::new();
        let (status, body) = h
            .send(Request::get("/api/calls/active").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["kind"], "unauthenticated");
    }

    #[tokio::test]
    async fn test_initiate_answer_end() {
        let h = Harness::new();
        let (x, y) = (h.user().await, h.user().await);

        let (status, call) = h.initiate(x, y).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(call["status"], "ringing");
        assert_eq!(call["media_kind"], "video");
        assert_eq!(call["caller_id"], x.to_string());
        let id = call["id"].as_str().unwrap().to_string();

        let (status, active) = h.get(y, "/api/calls/active").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(active["id"], id);

        let (status, answered) = h.post(y, &format!("/api/calls/{id}/answer"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(answered["status"], "connected");

        let (status, ended) = h.post(x, &format!("/api/calls/{id}/end"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ended["status"], "ended");
        assert!(ended["end_time"].is_string());

        let (_, active) = h.get(x, "/api/calls/active").await;
        assert!(active.is_null());

        let (_, history) = h.get(y, "/api/calls/history").await;
        assert_eq!(history.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reject_returns_ok_and_second_reject_conflicts() {
        let h = Harness::new();
        let (x, y) = (h.user().await, h.user().await);
        let (_, call) = h.initiate(x, y).await;
        let id = call["id"].as_str().unwrap().to_string();

        let (status, body) = h.post(y, &format!("/api/calls/{id}/reject"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "ok": true }));

        let (status, body) = h.post(y, &format!("/api/calls/{id}/reject"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "invalid_state");

        let (_, call) = h.get(x, &format!("/api/calls/{id}")).await;
        assert_eq!(call["status"], CallStatus::Rejected.as_str());
    }

    #[tokio::test]
    async fn test_initiate_error_statuses() {
        let h = Harness::new();
        let (x, y) = (h.user().await, h.user().await);

        let (status, body) = h.initiate(x, x).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "self_call_not_allowed");

        let (status, body) = h.initiate(x, UserId::new()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "receiver_not_found");

        let (status, _) = h.initiate(x, y).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, body) = h.initiate(y, x).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "already_active");

        let (status, body) = h
            .post(
                x,
                "/api/calls/initiate",
                Some(serde_json::json!({ "receiver_id": y, "media_kind": "hologram" })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "bad_request");
    }

    #[tokio::test]
    async fn test_strangers_cannot_touch_a_call() {
        let h = Harness::new();
        let (x, y, z) = (h.user().await, h.user().await, h.user().await);
        let (_, call) = h.initiate(x, y).await;
        let id = call["id"].as_str().unwrap().to_string();

        let (status, _) = h.get(z, &format!("/api/calls/{id}")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, body) = h.post(x, &format!("/api/calls/{id}/answer"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["kind"], "unauthorized");
        let (status, _) = h.post(z, &format!("/api/calls/{id}/end"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = h
            .post(x, &format!("/api/calls/{}/end", CallId::new()), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "call_not_found");
    }

    #[tokio::test]
    async fn test_user_lookup_route() {
        let h = Harness::new();
        let viewer = h.user().await;
        let ada = UserId::new();
        let (status, _) = h
            .send(
                Request::post("/admin/users")
                    .header("authorization", format!("Bearer {ADMIN}"))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "id": ada, "display_name": "Ada" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = h.get(viewer, &format!("/api/users/{ada}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], ada.to_string());
        assert_eq!(body["display_name"], "Ada");

        let (status, body) = h.get(viewer, &format!("/api/users/{}", UserId::new())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");

        let (status, _) = h
            .send(
                Request::get(format!("/api/users/{ada}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_admin_requires_token() {
        let h = Harness::new();
        let (status, _) = h
            .send(
                Request::get("/admin/status")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        h.user().await;
        let (status, body) = h
            .send(
                Request::get("/admin/status")
                    .header("authorization", format!("Bearer {ADMIN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["registered_users"], 1);
        assert_eq!(body["active_calls"], 0);
        assert_eq!(body["online_sessions"], 0);
    }
}
