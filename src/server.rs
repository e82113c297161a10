use actix_web::http::{header, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::conversation::{validate_conv_id, ConversationError};
use crate::conversation_manager::ConversationManager;
use crate::ingress::IngressRateLimiter;
use crate::request_router::{
    ChatRequest, ErrorType, OneShotRequest, RequestRouter, RouterError, RouterResult,
};
use crate::util::{error_response, typed_error_response};

/// Header carrying the caller identity used for ingress limiting.
pub const USER_ID_HEADER: &str = "x-user-id";
const ANONYMOUS_USER: &str = "anonymous";

/// Shared handler state, built once in `main`.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<RequestRouter>,
    pub ingress: Arc<IngressRateLimiter>,
}

impl AppState {
    pub fn new(router: Arc<RequestRouter>, ingress: Arc<IngressRateLimiter>) -> Self {
        Self { router, ingress }
    }

    fn conversations(&self) -> Option<&Arc<ConversationManager>> {
        self.router.conversations()
    }
}

pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/status", web::get().to(status))
            .route("/keys", web::get().to(list_keys))
            .route("/keys/reload", web::post().to(reload_keys))
            .route("/keys/{key_id}/unhealthy", web::post().to(mark_unhealthy))
            .route("/v1/one_shot", web::post().to(one_shot))
            .route("/v1/chat/{conv_id}", web::post().to(chat))
            .route("/conversations", web::get().to(list_conversations))
            .route("/conversations/{conv_id}", web::get().to(get_history))
            .route("/conversations/{conv_id}", web::delete().to(delete_conversation))
            .route("/conversations/{conv_id}/metadata", web::get().to(get_metadata))
            .route("/conversations/{conv_id}/truncate", web::post().to(truncate_history))
            .route("/ingress/global", web::get().to(ingress_global))
            .route("/ingress/users/{user_id}", web::get().to(ingress_user))
            .route("/ingress/users/{user_id}/reset", web::post().to(ingress_reset)),
    );
}

fn caller_id(req: &HttpRequest) -> String {
    req.headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}

/// `None` when the caller is admitted, otherwise the 429 to send back.
async fn admit(state: &AppState, user_id: &str) -> Option<HttpResponse> {
    match state.ingress.check_rate_limit(user_id, 1).await {
        Ok(()) => None,
        Err(limited) => Some(
            HttpResponse::TooManyRequests()
                .insert_header((header::RETRY_AFTER, limited.retry_after.to_string()))
                .json(serde_json::json!({
                    "error": {
                        "message": limited.to_string(),
                        "type": "ingress_rate_limited",
                        "scope": limited.scope,
                        "retry_after": limited.retry_after,
                    }
                })),
        ),
    }
}

fn result_status(result: &RouterResult) -> StatusCode {
    if result.success {
        return StatusCode::OK;
    }
    match result.error_type {
        Some(ErrorType::NoCapacity) | Some(ErrorType::RateLimited) | Some(ErrorType::Exhausted) => {
            StatusCode::TOO_MANY_REQUESTS
        }
        Some(ErrorType::SafetyBlocked) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(ErrorType::DeadlineExceeded) => StatusCode::GATEWAY_TIMEOUT,
        Some(ErrorType::StoreUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
        Some(ErrorType::Transient) | Some(ErrorType::Fatal) | None => StatusCode::BAD_GATEWAY,
    }
}

fn router_response(outcome: Result<RouterResult, RouterError>) -> HttpResponse {
    match outcome {
        Ok(result) => HttpResponse::build(result_status(&result)).json(result),
        Err(RouterError::UnknownModel(m)) => typed_error_response(
            StatusCode::BAD_REQUEST,
            "unknown_model",
            &format!("unknown model: {}", m),
        ),
        Err(e) => {
            warn!("request failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

fn conversation_error(e: ConversationError) -> HttpResponse {
    match e {
        ConversationError::InvalidInput(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
        ConversationError::NotFound(msg) => error_response(StatusCode::NOT_FOUND, &msg),
        other => error_response(StatusCode::SERVICE_UNAVAILABLE, &other.to_string()),
    }
}

fn conversations_unavailable() -> HttpResponse {
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "conversation store not configured",
    )
}

/// Health and registry overview.
async fn status(state: web::Data<AppState>) -> impl Responder {
    let routes = [
        "/status",
        "/keys",
        "/keys/reload",
        "/keys/{key_id}/unhealthy",
        "/v1/one_shot",
        "/v1/chat/{conv_id}",
        "/conversations",
        "/conversations/{conv_id}",
        "/conversations/{conv_id}/metadata",
        "/conversations/{conv_id}/truncate",
        "/ingress/global",
        "/ingress/users/{user_id}",
        "/ingress/users/{user_id}/reset",
    ];
    let health = state.router.health_check().await;
    let code = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    HttpResponse::build(code).json(serde_json::json!({
        "name": "keyrelay",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": routes,
        "health": health,
        "ingress_enabled": state.ingress.config().enabled,
        "conversations": state.conversations().map(|c| c.backend_name()),
    }))
}

async fn list_keys(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.router.get_all_key_statuses().await)
}

async fn reload_keys(state: web::Data<AppState>) -> impl Responder {
    match state.router.reload_keys() {
        Ok(count) => {
            info!(keys = count, "key registry reloaded via API");
            HttpResponse::Ok().json(serde_json::json!({ "reloaded": true, "keys": count }))
        }
        Err(e) => error_response(
            StatusCode::BAD_REQUEST,
            &format!("failed to reload keys: {}", e),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct UnhealthyRequest {
    #[serde(default = "default_unhealthy_secs")]
    cooldown_seconds: u64,
    #[serde(default = "default_unhealthy_reason")]
    reason: String,
}

fn default_unhealthy_secs() -> u64 {
    300
}

fn default_unhealthy_reason() -> String {
    "manual".to_string()
}

async fn mark_unhealthy(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: Option<web::Json<UnhealthyRequest>>,
) -> impl Responder {
    let key_id = path.into_inner();
    let payload = body.map(|b| b.into_inner()).unwrap_or(UnhealthyRequest {
        cooldown_seconds: default_unhealthy_secs(),
        reason: default_unhealthy_reason(),
    });
    match state
        .router
        .mark_key_unhealthy(&key_id, payload.cooldown_seconds, &payload.reason)
        .await
    {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "key_id": key_id,
            "cooldown_seconds": payload.cooldown_seconds,
            "reason": payload.reason,
        })),
        Err(RouterError::UnknownKey(id)) => {
            error_response(StatusCode::NOT_FOUND, &format!("unknown key: {}", id))
        }
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

async fn one_shot(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<OneShotRequest>,
) -> HttpResponse {
    if let Some(limited) = admit(&state, &caller_id(&req)).await {
        return limited;
    }
    router_response(state.router.send_one_shot(body.into_inner()).await)
}

async fn chat(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<ChatRequest>,
) -> HttpResponse {
    let conv_id = path.into_inner();
    if let Err(e) = validate_conv_id(&conv_id) {
        return conversation_error(e);
    }
    let caller = caller_id(&req);
    if let Some(limited) = admit(&state, &caller).await {
        return limited;
    }
    let mut chat = body.into_inner();
    chat.conv_id = conv_id;
    if chat.user_id.is_none() && caller != ANONYMOUS_USER {
        chat.user_id = Some(caller);
    }
    router_response(state.router.send_chat(chat).await)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    user_id: Option<String>,
    #[serde(default = "default_list_limit")]
    limit: usize,
}

fn default_list_limit() -> usize {
    100
}

async fn list_conversations(
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> HttpResponse {
    let Some(conversations) = state.conversations() else {
        return conversations_unavailable();
    };
    match conversations
        .list_conversations(query.user_id.as_deref(), query.limit)
        .await
    {
        Ok(items) => HttpResponse::Ok().json(items),
        Err(e) => conversation_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    #[serde(default)]
    include_metadata: bool,
}

async fn get_history(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> HttpResponse {
    let Some(conversations) = state.conversations() else {
        return conversations_unavailable();
    };
    let conv_id = path.into_inner();
    match conversations
        .get_history(&conv_id, query.limit, query.include_metadata)
        .await
    {
        Ok(messages) => HttpResponse::Ok().json(serde_json::json!({
            "conv_id": conv_id,
            "messages": messages,
        })),
        Err(e) => conversation_error(e),
    }
}

async fn delete_conversation(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let Some(conversations) = state.conversations() else {
        return conversations_unavailable();
    };
    let conv_id = path.into_inner();
    match conversations.delete_conversation(&conv_id).await {
        Ok(deleted) => HttpResponse::Ok().json(serde_json::json!({
            "conv_id": conv_id,
            "deleted": deleted,
        })),
        Err(e) => conversation_error(e),
    }
}

async fn get_metadata(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let Some(conversations) = state.conversations() else {
        return conversations_unavailable();
    };
    let conv_id = path.into_inner();
    match conversations.get_metadata(&conv_id).await {
        Ok(Some(meta)) => HttpResponse::Ok().json(meta),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            &format!("conversation not found: {}", conv_id),
        ),
        Err(e) => conversation_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct TruncateRequest {
    keep_last_n: usize,
}

async fn truncate_history(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<TruncateRequest>,
) -> HttpResponse {
    let Some(conversations) = state.conversations() else {
        return conversations_unavailable();
    };
    let conv_id = path.into_inner();
    match conversations
        .truncate_history(&conv_id, body.keep_last_n)
        .await
    {
        Ok(truncated) => HttpResponse::Ok().json(serde_json::json!({
            "conv_id": conv_id,
            "truncated": truncated,
            "keep_last_n": body.keep_last_n,
        })),
        Err(e) => conversation_error(e),
    }
}

async fn ingress_global(state: web::Data<AppState>) -> HttpResponse {
    match state.ingress.get_global_status().await {
        Ok(status) => HttpResponse::Ok().json(status),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

async fn ingress_user(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    match state.ingress.get_user_status(&path).await {
        Ok(status) => HttpResponse::Ok().json(status),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

async fn ingress_reset(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let user_id = path.into_inner();
    match state.ingress.reset_user_limit(&user_id).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "user_id": user_id, "reset": true })),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}
