use axum::{extract::FromRequestParts, http::request::Parts};

use crate::{app::AppState, error::AppError, session::SessionContext};

/// The caller's session, if the marker resolves to a known account.
pub struct CurrentSession(pub Option<SessionContext>);

impl FromRequestParts<AppState> for CurrentSession {
    type Rejection = AppError;

    async fn from_request_parts(
        _parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self(state.current_session().await))
    }
}

/// A session belonging to an active admin. Anything else is rejected before
/// the handler runs, so role or status changes take effect mid-session.
pub struct AdminSession(pub SessionContext);

impl FromRequestParts<AppState> for AdminSession {
    type Rejection = AppError;

    async fn from_request_parts(
        _parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        match state.current_session().await {
            None => Err(AppError::Unauthenticated),
            Some(ctx) if ctx.is_admin() => Ok(Self(ctx)),
            Some(ctx) => Err(AppError::Forbidden(format!(
                "{} is not an admin",
                ctx.display_name
            ))),
        }
    }
}
