use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use crate::{
    accounts::normalize_username,
    app::AppState,
    error::Result,
    handlers::session::CurrentSession,
    models::UserDto,
    session::SessionContext,
};

/// Registration form
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub username: String,
}

/// Handler for self-service registration
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse> {
    state
        .accounts
        .register(
            &request.username,
            &request.password,
            &request.email,
            &request.display_name,
        )
        .await?;

    let username = normalize_username(&request.username);
    Ok((StatusCode::CREATED, Json(RegisterResponse { username })))
}

/// Login form
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub current_user: String,
    pub user: UserDto,
}

/// Handler for login. On success the login is stamped and the session
/// marker is set to the account's display name and key.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse> {
    state
        .accounts
        .authenticate(&request.username, &request.password)
        .await?;

    let key = normalize_username(&request.username);
    let record = state.accounts.record_login(&key).await?;
    let current_user = record.label(&key).to_string();
    state.sessions.begin(&current_user, &key).await?;

    Ok((
        StatusCode::OK,
        Json(LoginResponse {
            current_user,
            user: UserDto::from_entry(&key, &record),
        }),
    ))
}

/// Handler for logout
pub async fn logout(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.sessions.end().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub current_user: Option<String>,
    pub session: Option<SessionContext>,
}

/// Who is logged in, for greeting and logout UI
pub async fn current_session(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> Result<impl IntoResponse> {
    let current_user = state.sessions.current().await.map(|marker| marker.display_name);
    Ok(Json(SessionResponse {
        current_user,
        session,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserCountResponse {
    pub count: usize,
}

/// Number of registered accounts
pub async fn user_count(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let count = state.accounts.user_count().await;
    Ok(Json(UserCountResponse { count }))
}
