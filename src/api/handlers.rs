//! HTTP request handlers

use super::types::{
    ApiMessage, AuthResponse, HealthResponse, LoginRequest, RegisterRequest, StartChatRequest,
};
use super::AppState;
use crate::db::{ChatSummary, DbError, MessagePayload, UserPreview, UserProfile};
use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

/// Create the API router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Liveness
        .route("/health", get(health))
        // Account creation and login
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        // Profiles
        .route("/api/users/me", get(me))
        .route("/api/users/search", get(search_users))
        .route("/api/users/:id", get(get_user))
        // Conversations
        .route("/api/chats", get(list_chats))
        .route("/api/chats/:id/messages", get(chat_messages))
        .route("/api/chats/start", post(start_chat))
        // Real-time socket
        .route("/ws/chat", get(crate::ws::ws_upgrade_handler))
        .with_state(state)
}

// ============================================================
// Liveness
// ============================================================

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.registry.connection_count(),
    })
}

// ============================================================
// Auth
// ============================================================

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), AppError> {
    let user = state.db.create_user(&req.name, &req.email, &req.password)?;
    let token = issue_token(&state, &user)?;
    Ok((StatusCode::CREATED, Json(AuthResponse { token, user })))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    let user = state
        .db
        .authenticate(&req.email, &req.password)?
        .ok_or_else(|| AppError::Unauthorized("Invalid credentials".to_string()))?;
    let token = issue_token(&state, &user)?;
    Ok(Json(AuthResponse { token, user }))
}

fn issue_token(state: &AppState, user: &UserProfile) -> Result<String, AppError> {
    state
        .auth
        .generate(user.id, &user.email)
        .map_err(|e| AppError::Internal(e.to_string()))
}

// ============================================================
// Profiles
// ============================================================

async fn me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<UserProfile>, AppError> {
    let profile = state
        .db
        .get_user(user_id)?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    Ok(Json(profile))
}

async fn get_user(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<UserProfile>, AppError> {
    let id = parse_id(&id, "Invalid user id")?;
    let profile = state
        .db
        .get_user(id)?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    Ok(Json(profile))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

async fn search_users(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<UserPreview>>, AppError> {
    let results = state.db.search_users(user_id, &query.q)?;
    Ok(Json(results))
}

// ============================================================
// Conversations
// ============================================================

async fn list_chats(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<ChatSummary>>, AppError> {
    let chats = state.db.list_chats(user_id)?;
    Ok(Json(chats))
}

async fn chat_messages(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<MessagePayload>>, AppError> {
    let chat_id = parse_id(&id, "Invalid chat id")?;
    let messages = state.db.get_messages(chat_id, user_id)?;
    Ok(Json(messages))
}

async fn start_chat(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(req): Json<StartChatRequest>,
) -> Result<(StatusCode, Json<ChatSummary>), AppError> {
    let participant_id = parse_id(&req.participant_id, "Invalid participant id")?;
    let chat = state.db.ensure_chat(user_id, participant_id)?;
    let summary = state.db.chat_summary(&chat, user_id)?;
    Ok((StatusCode::CREATED, Json(summary)))
}

fn parse_id(value: &str, message: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(value).map_err(|_| AppError::BadRequest(message.to_string()))
}

// ============================================================
// Bearer-token extractor
// ============================================================

/// Identity resolved from the `Authorization: Bearer` header
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

#[axum::async_trait]
impl axum::extract::FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .and_then(|token| state.auth.verify(token))
            .map(Self)
            .ok_or_else(|| AppError::Unauthorized("Invalid or expired token".to_string()))
    }
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        match &err {
            DbError::Sqlite(e) => Self::Internal(e.to_string()),
            DbError::NotAParticipant => Self::Forbidden(err.to_string()),
            DbError::UserNotFound | DbError::ChatNotFound => Self::NotFound(err.to_string()),
            _ => Self::BadRequest(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ApiMessage::new(message))).into_response()
    }
}
