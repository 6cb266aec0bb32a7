use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use crate::{
    announcements::Draft, app::AppState, error::Result, handlers::session::AdminSession,
};

#[derive(Debug, Deserialize)]
pub struct AnnouncementRequest {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub priority: Option<String>,
}

impl From<AnnouncementRequest> for Draft {
    fn from(request: AnnouncementRequest) -> Self {
        Draft {
            title: request.title,
            message: request.message,
            priority: request.priority,
        }
    }
}

/// All announcements, newest first
pub async fn list_announcements(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(state.announcements.list().await))
}

pub async fn publish_announcement(
    AdminSession(admin): AdminSession,
    State(state): State<AppState>,
    Json(request): Json<AnnouncementRequest>,
) -> Result<impl IntoResponse> {
    let announcement = state
        .announcements
        .publish(&request.into(), &admin.display_name)
        .await?;
    Ok((StatusCode::CREATED, Json(announcement)))
}

pub async fn edit_announcement(
    AdminSession(admin): AdminSession,
    State(state): State<AppState>,
    Path(timestamp): Path<i64>,
    Json(request): Json<AnnouncementRequest>,
) -> Result<impl IntoResponse> {
    let announcement = state
        .announcements
        .edit(timestamp, &request.into(), &admin.display_name)
        .await?;
    Ok((StatusCode::OK, Json(announcement)))
}

pub async fn delete_announcement(
    AdminSession(_admin): AdminSession,
    State(state): State<AppState>,
    Path(timestamp): Path<i64>,
) -> Result<impl IntoResponse> {
    state.announcements.delete(timestamp).await?;
    Ok(StatusCode::NO_CONTENT)
}
