use axum::{
    extract::{Json, Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use crate::{
    accounts::{NewUser, UserFilter, normalize_username},
    app::AppState,
    error::{AppError, Result},
    handlers::session::AdminSession,
    models::{Role, Status, UserDto},
};

/// Search and filter parameters of the admin user table. Empty strings mean
/// "no filter".
#[derive(Debug, Default, Deserialize)]
pub struct ListUsersQuery {
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub status: String,
}

fn parse_filter<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<Option<T>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    raw.parse().map(Some).map_err(AppError::BadRequest)
}

/// Get all users matching the filters, ordered by username
pub async fn list_users(
    AdminSession(_admin): AdminSession,
    State(state): State<AppState>,
    Query(query): Query<ListUsersQuery>,
) -> Result<impl IntoResponse> {
    let filter = UserFilter {
        query: query.q,
        role: parse_filter::<Role>(&query.role)?,
        status: parse_filter::<Status>(&query.status)?,
    };

    let users = state.accounts.list_filtered(&filter).await?;
    let user_dtos: Vec<UserDto> = users.into_iter().map(UserDto::from).collect();
    Ok((StatusCode::OK, Json(user_dtos)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub role: Role,
}

/// Create user handler
pub async fn create_user(
    AdminSession(admin): AdminSession,
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> Result<impl IntoResponse> {
    let username = normalize_username(&request.username);
    state
        .accounts
        .create_user(NewUser {
            username: request.username,
            password: request.password,
            email: request.email,
            display_name: request.display_name,
            role: request.role,
        })
        .await?;

    tracing::info!(admin = %admin.username, %username, "admin created user");
    let detail = state.accounts.view_user(&username).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

/// Get user by username handler
pub async fn get_user(
    AdminSession(_admin): AdminSession,
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<impl IntoResponse> {
    let detail = state.accounts.view_user(&username).await?;
    Ok((StatusCode::OK, Json(detail)))
}

/// Delete user handler
pub async fn delete_user(
    AdminSession(admin): AdminSession,
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<impl IntoResponse> {
    state.accounts.delete_user(&username).await?;
    tracing::info!(admin = %admin.username, %username, "admin deleted user");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SetRoleRequest {
    pub role: Role,
}

pub async fn set_role(
    AdminSession(_admin): AdminSession,
    State(state): State<AppState>,
    Path(username): Path<String>,
    Json(request): Json<SetRoleRequest>,
) -> Result<impl IntoResponse> {
    state.accounts.set_role(&username, request.role).await?;
    let detail = state.accounts.view_user(&username).await?;
    Ok((StatusCode::OK, Json(detail)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetStatusRequest {
    pub status: Status,
    #[serde(default)]
    pub suspension_minutes: Option<u32>,
}

pub async fn set_status(
    AdminSession(_admin): AdminSession,
    State(state): State<AppState>,
    Path(username): Path<String>,
    Json(request): Json<SetStatusRequest>,
) -> Result<impl IntoResponse> {
    state
        .accounts
        .set_status(&username, request.status, request.suspension_minutes)
        .await?;
    let detail = state.accounts.view_user(&username).await?;
    Ok((StatusCode::OK, Json(detail)))
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub password: String,
}

pub async fn reset_password(
    AdminSession(_admin): AdminSession,
    State(state): State<AppState>,
    Path(username): Path<String>,
    Json(request): Json<ResetPasswordRequest>,
) -> Result<impl IntoResponse> {
    state
        .accounts
        .reset_password(&username, &request.password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The whole directory as JSON, for backup or moving between browsers
pub async fn export_users(
    AdminSession(_admin): AdminSession,
    State(state): State<AppState>,
) -> Result<impl IntoResponse> {
    let body = state.accounts.export_json().await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImportResponse {
    pub count: usize,
}

/// Overwrite the directory with pasted JSON
pub async fn import_users(
    AdminSession(admin): AdminSession,
    State(state): State<AppState>,
    body: String,
) -> Result<impl IntoResponse> {
    let count = state.accounts.import_json(&body).await?;
    tracing::info!(admin = %admin.username, count, "admin imported users");
    Ok((StatusCode::OK, Json(ImportResponse { count })))
}
