//! Axum route handlers.
//!
//! # Routes
//!
//! - `GET  /health`
//! - `POST /api/v1/auth/login`, `POST /api/v1/auth/logout`
//! - `POST /api/v1/claws/register`, `GET /api/v1/claws/me`, `POST /api/v1/claws/claim`
//! - `POST /api/v1/souls`, `GET /api/v1/souls/:handle`,
//!   `GET /api/v1/souls/:handle/condensations`, `POST /api/v1/souls/:handle/chat`,
//!   `POST /api/v1/souls/mint/confirm`
//! - `POST /api/v1/fragments` (gone), `POST /api/v1/fragments/batch`
//! - `POST /api/v1/admin/souls/:handle/condense`, `GET /api/v1/admin/fragments/stale`,
//!   `POST /api/v1/admin/curation/retry`

use std::sync::Arc;

use axum::{
    extract::{FromRequest, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::dto::{
    BatchReceipt, ChatResponse, ClaimRequest, CreateSoulRequest, FragmentReceipt, LoginRequest,
    MintConfirmRequest, RegisterRequest, RetryQuery, StaleQuery,
};
use crate::curation::CurationOutcome;
use crate::errors::EnsoulError;
use crate::identity::{token, IssuedSession, Registration};
use crate::service::Ensoul;
use crate::types::{CondensationEvent, Contributor, Fragment, Soul};
use crate::validator::BatchRequest;

type ApiResult<T> = Result<T, EnsoulError>;

/// JSON body extractor whose rejections use the API error format.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(EnsoulError))]
pub struct ApiJson<T>(pub T);

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Ensoul>,
    /// SHA-256 of the admin bearer token; admin routes refuse every request
    /// when unset.
    admin_token_hash: Option<Arc<str>>,
}

impl AppState {
    pub fn new(service: Arc<Ensoul>, admin_token: Option<String>) -> Self {
        Self {
            service,
            admin_token_hash: admin_token.map(|t| Arc::from(token::hash_secret(&t))),
        }
    }
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/auth/login", post(login_handler))
        .route("/api/v1/auth/logout", post(logout_handler))
        .route("/api/v1/claws/register", post(register_handler))
        .route("/api/v1/claws/me", get(me_handler))
        .route("/api/v1/claws/claim", post(claim_handler))
        .route("/api/v1/souls", post(create_soul_handler))
        .route("/api/v1/souls/mint/confirm", post(confirm_mint_handler))
        .route("/api/v1/souls/:handle", get(get_soul_handler))
        .route("/api/v1/souls/:handle/condensations", get(condensations_handler))
        .route("/api/v1/souls/:handle/chat", post(chat_handler))
        .route("/api/v1/fragments", post(single_fragment_handler))
        .route("/api/v1/fragments/batch", post(batch_handler))
        .route("/api/v1/admin/souls/:handle/condense", post(admin_condense_handler))
        .route("/api/v1/admin/fragments/stale", get(admin_stale_handler))
        .route("/api/v1/admin/curation/retry", post(admin_retry_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn bearer(headers: &HeaderMap) -> ApiResult<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| EnsoulError::Unauthenticated("missing bearer token".into()))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.admin_token_hash.as_deref() else {
        return Err(EnsoulError::Forbidden("admin api is disabled".into()));
    };
    if !token::matches_hash(bearer(headers)?, expected) {
        return Err(EnsoulError::Forbidden("invalid admin token".into()));
    }
    Ok(())
}

/// GET /health — liveness check.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "ensoul",
    }))
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

async fn login_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<LoginRequest>,
) -> ApiResult<Json<IssuedSession>> {
    let session = state
        .service
        .login(&body.address, &body.message, &body.signature, Utc::now())?;
    Ok(Json(session))
}

async fn logout_handler(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<StatusCode> {
    state.service.logout(bearer(&headers)?)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/claws/register — returns the API key and claim code once.
async fn register_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<Registration>)> {
    let registration = state.service.register_contributor(&body.name, Utc::now())?;
    Ok((StatusCode::CREATED, Json(registration)))
}

async fn me_handler(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Contributor>> {
    Ok(Json(state.service.contributor(bearer(&headers)?)?))
}

async fn claim_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<ClaimRequest>,
) -> ApiResult<Json<Contributor>> {
    let contributor = state
        .service
        .claim(bearer(&headers)?, &body.claim_code, Utc::now())?;
    Ok(Json(contributor))
}

// ---------------------------------------------------------------------------
// Souls
// ---------------------------------------------------------------------------

async fn create_soul_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<CreateSoulRequest>,
) -> ApiResult<(StatusCode, Json<Soul>)> {
    let soul = state.service.create_soul(
        bearer(&headers)?,
        &body.handle,
        &body.display_name,
        Utc::now(),
    )?;
    Ok((StatusCode::CREATED, Json(soul)))
}

async fn get_soul_handler(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> ApiResult<Json<Soul>> {
    Ok(Json(state.service.soul(&handle)?))
}

async fn condensations_handler(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> ApiResult<Json<Vec<CondensationEvent>>> {
    Ok(Json(state.service.condensations(&handle)?))
}

async fn chat_handler(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> ApiResult<Json<ChatResponse>> {
    let soul = state.service.record_chat(&handle, Utc::now())?;
    Ok(Json(soul.into()))
}

async fn confirm_mint_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<MintConfirmRequest>,
) -> ApiResult<Json<Soul>> {
    let soul = state.service.confirm_mint(
        bearer(&headers)?,
        &body.handle,
        &body.tx_hash,
        body.agent_id.as_deref(),
        Utc::now(),
    )?;
    Ok(Json(soul))
}

// ---------------------------------------------------------------------------
// Fragments
// ---------------------------------------------------------------------------

/// POST /api/v1/fragments — single submissions were withdrawn.
async fn single_fragment_handler(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.service.submit_single()?;
    Ok(StatusCode::GONE)
}

/// POST /api/v1/fragments/batch — persist as pending, answer `202`, curate
/// in the background.
async fn batch_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<BatchRequest>,
) -> ApiResult<(StatusCode, Json<BatchReceipt>)> {
    let batch = state
        .service
        .submit_batch(bearer(&headers)?, &body, Utc::now())?;

    let receipt = BatchReceipt {
        batch_id: batch.batch_id.clone(),
        count: batch.fragments.len(),
        fragments: batch
            .fragments
            .iter()
            .map(|f| FragmentReceipt {
                id: f.id.clone(),
                dimension: f.dimension,
                status: f.status,
            })
            .collect(),
    };

    let service = state.service.clone();
    tokio::spawn(async move {
        let outcomes = service.curate(&batch).await;
        tracing::debug!(batch = %batch.batch_id, outcomes = outcomes.len(), "curation finished");
    });

    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

async fn admin_condense_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(handle): Path<String>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let event = state.service.condense(&handle).await?;
    Ok(Json(serde_json::json!({
        "condensed": event.is_some(),
        "event": event,
    })))
}

async fn admin_stale_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StaleQuery>,
) -> ApiResult<Json<Vec<Fragment>>> {
    require_admin(&state, &headers)?;
    let fragments = state
        .service
        .stale_fragments(chrono::Duration::seconds(query.older_than_secs.max(0)), query.limit)?;
    Ok(Json(fragments))
}

async fn admin_retry_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RetryQuery>,
) -> ApiResult<Json<Vec<CurationOutcome>>> {
    require_admin(&state, &headers)?;
    Ok(Json(state.service.retry_pending(query.limit).await?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::service::testing::{claimed_claw, login, request, service};
    use crate::service::EnsoulConfig;
    use crate::types::Dimension;

    const ADMIN: &str = "admin-secret";

    fn state() -> AppState {
        AppState::new(Arc::new(service(EnsoulConfig::default())), Some(ADMIN.into()))
    }

    fn post(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json");
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json(response: axum::response::Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = app_router(state()).oneshot(get("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], crate::VERSION);
        assert_eq!(json["service"], "ensoul");
    }

    #[tokio::test]
    async fn test_single_fragment_endpoint_is_gone() {
        let response = app_router(state())
            .oneshot(post("/api/v1/fragments", None, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
        assert_eq!(json(response).await["code"], "retired");
    }

    #[tokio::test]
    async fn test_malformed_json_is_invalid_shape() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/fragments/batch")
            .header("Content-Type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app_router(state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["code"], "invalid_shape");
    }

    #[tokio::test]
    async fn test_batch_requires_api_key() {
        let body = serde_json::to_value(request("ada", &[Dimension::Style; 3], 0)).unwrap();
        let response = app_router(state())
            .oneshot(post("/api/v1/fragments/batch", None, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json(response).await["code"], "unauthenticated");
    }

    #[tokio::test]
    async fn test_batch_accepted_then_cooldown() {
        let state = state();
        let now = Utc::now();
        let session = login(&state.service, 11, now);
        let api_key = claimed_claw(&state.service, &session.token, "http-claw", now);
        state
            .service
            .create_soul(&session.token, "ada", "Ada", now)
            .unwrap();

        let dims = [Dimension::Personality, Dimension::Stance, Dimension::Timeline];
        let body = serde_json::to_value(request("@Ada", &dims, 0)).unwrap();
        let response = app_router(state.clone())
            .oneshot(post("/api/v1/fragments/batch", Some(&api_key), body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let receipt = json(response).await;
        assert_eq!(receipt["count"], 3);
        assert_eq!(receipt["fragments"][0]["status"], "pending");
        assert_eq!(receipt["fragments"][1]["dimension"], "stance");

        let response = app_router(state)
            .oneshot(post("/api/v1/fragments/batch", Some(&api_key), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        assert_eq!(json(response).await["code"], "cooldown");
    }

    #[tokio::test]
    async fn test_duplicate_dimension_is_bad_request() {
        let state = state();
        let now = Utc::now();
        let session = login(&state.service, 12, now);
        let api_key = claimed_claw(&state.service, &session.token, "dup-claw", now);
        state.service.create_soul(&session.token, "ada", "Ada", now).unwrap();

        let body = serde_json::to_value(request("ada", &[Dimension::Style; 3], 0)).unwrap();
        let response = app_router(state)
            .oneshot(post("/api/v1/fragments/batch", Some(&api_key), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["code"], "duplicate_dimension");
    }

    #[tokio::test]
    async fn test_soul_lifecycle_over_http() {
        let state = state();
        let now = Utc::now();
        let session = login(&state.service, 13, now);

        let response = app_router(state.clone())
            .oneshot(post(
                "/api/v1/souls",
                Some(&session.token),
                serde_json::json!({"handle": "@Grace", "display_name": "Grace Hopper"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json(response).await["stage"], "embryo");

        let response = app_router(state.clone())
            .oneshot(post(
                "/api/v1/souls",
                Some(&session.token),
                serde_json::json!({"handle": "grace", "display_name": "Again"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app_router(state.clone())
            .oneshot(post("/api/v1/souls/grace/chat", None, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["chat_count"], 1);

        let tx = format!("0x{}", "cd".repeat(32));
        let response = app_router(state.clone())
            .oneshot(post(
                "/api/v1/souls/mint/confirm",
                Some(&session.token),
                serde_json::json!({"handle": "grace", "tx_hash": tx, "agent_id": "3"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["agent_id"], "3");

        let response = app_router(state.clone())
            .oneshot(get("/api/v1/souls/grace/condensations", None))
            .await
            .unwrap();
        assert_eq!(json(response).await, serde_json::json!([]));

        let response = app_router(state)
            .oneshot(get("/api/v1/souls/nobody", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_register_then_me_hides_secrets() {
        let state = state();
        let response = app_router(state.clone())
            .oneshot(post(
                "/api/v1/claws/register",
                None,
                serde_json::json!({"name": "quiet-claw"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let registration = json(response).await;
        let api_key = registration["api_key"].as_str().unwrap().to_string();

        let response = app_router(state)
            .oneshot(get("/api/v1/claws/me", Some(&api_key)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let me = json(response).await;
        assert_eq!(me["name"], "quiet-claw");
        assert_eq!(me["status"], "pending_claim");
        assert!(me.get("api_key_hash").is_none());
        assert!(me.get("claim_code").is_none());
    }

    #[tokio::test]
    async fn test_admin_routes_require_token() {
        let state = state();
        let response = app_router(state.clone())
            .oneshot(get("/api/v1/admin/fragments/stale", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app_router(state.clone())
            .oneshot(get("/api/v1/admin/fragments/stale", Some("wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let near_miss = format!("{}x", ADMIN);
        let response = app_router(state.clone())
            .oneshot(get("/api/v1/admin/fragments/stale", Some(&near_miss)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app_router(state.clone())
            .oneshot(get("/api/v1/admin/fragments/stale?older_than_secs=0", Some(ADMIN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await, serde_json::json!([]));

        let disabled = AppState::new(state.service.clone(), None);
        let response = app_router(disabled)
            .oneshot(post("/api/v1/admin/curation/retry", Some(ADMIN), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_condense_without_fragments() {
        let state = state();
        let now = Utc::now();
        let session = login(&state.service, 14, now);
        state.service.create_soul(&session.token, "ada", "Ada", now).unwrap();

        let response = app_router(state)
            .oneshot(post("/api/v1/admin/souls/ada/condense", Some(ADMIN), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["condensed"], false);
        assert!(body["event"].is_null());
    }
}
