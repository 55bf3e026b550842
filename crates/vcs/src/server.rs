//! HTTP server for provider webhooks and repository management.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::VcsError;
use crate::models::{Release, RemoteAccount, Repository};
use crate::service::VcsService;
use crate::webhooks::{verify_token, WebhookEvent};

/// Header carrying the authenticated platform user.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Configuration.
    pub config: Config,
    /// Release and repository operations.
    pub service: VcsService,
}

/// Error returned by handlers.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str),
    BadRequest(String),
    Vcs(VcsError),
}

impl From<VcsError> for ApiError {
    fn from(err: VcsError) -> Self {
        Self::Vcs(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized(reason) => (StatusCode::UNAUTHORIZED, reason.to_string()),
            Self::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason),
            Self::Vcs(err) => (err.status_code(), err.to_string()),
        };
        (
            status,
            Json(json!({
                "status": "error",
                "error": message
            })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the HTTP router for the VCS service.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Webhook endpoint
        .route("/webhooks/{provider}", post(webhook_handler))
        // Accounts
        .route("/accounts/{provider}", post(link_account))
        .route("/accounts/{provider}/sync", post(sync_repositories))
        // Repositories
        .route("/repositories/{provider}/{provider_id}", get(get_repository))
        .route(
            "/repositories/{provider}/{provider_id}/enable",
            post(enable_repository),
        )
        .route(
            "/repositories/{provider}/{provider_id}/disable",
            post(disable_repository),
        )
        .route(
            "/repositories/{provider}/{provider_id}/community",
            put(set_community),
        )
        .route(
            "/repositories/{provider}/{provider_id}/releases",
            get(list_releases),
        )
        // Releases
        .route("/releases/{id}", get(get_release).delete(delete_release))
        .route("/releases/{id}/retry", post(retry_release))
        .route("/records/{record_id}/published", post(record_published))
        // Health check
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn user_id(headers: &HeaderMap) -> ApiResult<i64> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or(ApiError::Unauthorized("missing or invalid X-User-Id header"))
}

/// Health check endpoint.
async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// Readiness check endpoint.
async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.config.enabled || state.service.providers().is_empty() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "providers": state.service.providers().ids()
    })))
}

/// Handle incoming provider webhooks.
///
/// This handler:
/// 1. Verifies the delivery with the provider's secret
/// 2. Normalizes the payload into an event
/// 3. Records releases and schedules their processing
pub async fn webhook_handler(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if !state.config.enabled {
        debug!("VCS integration is disabled, ignoring webhook");
        return Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ignored",
                "reason": "vcs_disabled"
            })),
        ));
    }

    let provider = state.service.providers().get(&provider_id)?;
    let delivery_id = provider.delivery_id(&headers);

    info!(
        provider = %provider_id,
        delivery_id = delivery_id.as_deref().unwrap_or("unknown"),
        "Received webhook"
    );

    if !provider.verify_webhook(&headers, &body) {
        warn!(provider = %provider_id, "Invalid webhook signature");
        return Err(ApiError::Unauthorized("invalid webhook signature"));
    }

    let event = provider.parse_event(&headers, &body).map_err(|e| {
        error!(provider = %provider_id, error = %e, "Failed to parse webhook payload");
        ApiError::BadRequest(format!("invalid payload: {e}"))
    })?;

    match event {
        WebhookEvent::Ping => Ok((StatusCode::OK, Json(json!({ "status": "pong" })))),
        WebhookEvent::Ignored(reason) => {
            debug!(provider = %provider_id, reason = %reason, "Ignoring webhook event");
            Ok((
                StatusCode::OK,
                Json(json!({ "status": "ignored", "reason": reason })),
            ))
        }
        WebhookEvent::Push(push) => {
            debug!(
                repo = %push.repository_full_name,
                git_ref = %push.ref_name,
                "Ignoring push event"
            );
            Ok((
                StatusCode::OK,
                Json(json!({ "status": "ignored", "reason": "push_event" })),
            ))
        }
        WebhookEvent::Release(event) => {
            let event_id = delivery_id.as_deref().and_then(|d| Uuid::parse_str(d).ok());
            let release = match state.service.receive_release(&event, event_id).await {
                Ok(release) => release,
                // GitHub announces one release as both `published` and `released`
                Err(VcsError::ReleaseAlreadyReceived { .. }) => {
                    debug!(
                        repo = %event.repository_full_name,
                        tag = %event.tag,
                        "Release already received"
                    );
                    return Ok((
                        StatusCode::OK,
                        Json(json!({ "status": "ignored", "reason": "already_received" })),
                    ));
                }
                Err(e) => return Err(e.into()),
            };
            state.service.spawn_processing(release.id);

            Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "accepted",
                    "release_id": release.id,
                    "tag": release.tag
                })),
            ))
        }
    }
}

/// Request body for linking an account.
#[derive(Debug, Deserialize)]
struct LinkAccountRequest {
    access_token: String,
}

async fn link_account(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Json(request): Json<LinkAccountRequest>,
) -> ApiResult<Json<RemoteAccount>> {
    let user_id = user_id(&headers)?;
    let account = state
        .service
        .link_account(user_id, &provider, &request.access_token)
        .await?;
    Ok(Json(account))
}

async fn sync_repositories(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Repository>>> {
    let user_id = user_id(&headers)?;
    let repos = state.service.sync_repositories(user_id, &provider).await?;
    Ok(Json(repos))
}

async fn get_repository(
    State(state): State<AppState>,
    Path((provider, provider_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let user_id = user_id(&headers)?;
    let repo = state
        .service
        .get_repository(user_id, &provider, &provider_id)
        .await?;
    let latest = state
        .service
        .latest_release(&provider, &provider_id)
        .await?;
    let enabled = repo.enabled();
    Ok(Json(json!({
        "repository": repo,
        "enabled": enabled,
        "latest_release": latest
    })))
}

async fn enable_repository(
    State(state): State<AppState>,
    Path((provider, provider_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Repository>> {
    let user_id = user_id(&headers)?;
    let repo = state
        .service
        .enable_repository(user_id, &provider, &provider_id)
        .await?;
    Ok(Json(repo))
}

async fn disable_repository(
    State(state): State<AppState>,
    Path((provider, provider_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Repository>> {
    let user_id = user_id(&headers)?;
    let repo = state
        .service
        .disable_repository(user_id, &provider, &provider_id)
        .await?;
    Ok(Json(repo))
}

/// Request body for setting the submission community.
#[derive(Debug, Deserialize)]
struct CommunityRequest {
    #[serde(default)]
    community_id: Option<Uuid>,
}

async fn set_community(
    State(state): State<AppState>,
    Path((provider, provider_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<CommunityRequest>,
) -> ApiResult<Json<Repository>> {
    let user_id = user_id(&headers)?;
    let repo = state
        .service
        .set_community(user_id, &provider, &provider_id, request.community_id)
        .await?;
    Ok(Json(repo))
}

async fn list_releases(
    State(state): State<AppState>,
    Path((provider, provider_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Release>>> {
    let user_id = user_id(&headers)?;
    let releases = state
        .service
        .list_releases(user_id, &provider, &provider_id)
        .await?;
    Ok(Json(releases))
}

async fn get_release(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<Release>> {
    let user_id = user_id(&headers)?;
    Ok(Json(state.service.release_for_user(user_id, id).await?))
}

async fn retry_release(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<Release>> {
    let user_id = user_id(&headers)?;
    state.service.release_for_user(user_id, id).await?;
    Ok(Json(state.service.retry_release(id).await?))
}

async fn delete_release(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<Release>> {
    let user_id = user_id(&headers)?;
    state.service.release_for_user(user_id, id).await?;
    Ok(Json(state.service.delete_release(id).await?))
}

/// Callback from the records platform once a draft record is published.
///
/// Called by the platform rather than a user, so it is authenticated with
/// the records API bearer token. Without a configured token the callback is
/// accepted as is.
async fn record_published(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<Release>> {
    if let Some(token) = &state.config.records_api_token {
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or_default();
        if !verify_token(presented, token) {
            warn!(record_id = %record_id, "Invalid records callback token");
            return Err(ApiError::Unauthorized("invalid records API token"));
        }
    }
    Ok(Json(state.service.record_published(record_id).await?))
}
