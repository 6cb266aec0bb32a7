use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    http::{Method, header},
    middleware,
    routing::{get, post, put},
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    accounts::{AccountStore, DirectoryChanged},
    announcements::AnnouncementBoard,
    ask::{AskService, ChatClient, RateLimiter, rate_limit::limit_by_ip},
    config::Config,
    handlers::{announcements, ask, auth, user},
    session::{self, SessionContext, SessionStore},
    storage::KeyValueStore,
};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub accounts: Arc<AccountStore>,
    pub sessions: Arc<SessionStore>,
    pub announcements: Arc<AnnouncementBoard>,
    pub ask: Arc<AskService>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        accounts: AccountStore,
        ask: AskService,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            accounts: Arc::new(accounts),
            sessions: Arc::new(SessionStore::new(kv.clone())),
            announcements: Arc::new(AnnouncementBoard::new(kv)),
            ask: Arc::new(ask),
            limiter: Arc::new(limiter),
        }
    }

    pub fn from_config(kv: Arc<dyn KeyValueStore>, config: &Config) -> Self {
        Self::new(
            kv.clone(),
            AccountStore::new(kv),
            AskService::new(ChatClient::from_config(config)),
            RateLimiter::per_minute(config.rate_limit_per_minute),
        )
    }

    /// Resolve the session marker against the current directory.
    pub async fn current_session(&self) -> Option<SessionContext> {
        let marker = self.sessions.current().await?;
        let directory = self.accounts.load().await;
        session::resolve(&marker, &directory)
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(ask::health))
        .route("/ask", post(ask::ask))
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/session", get(auth::current_session))
        .route("/users/count", get(auth::user_count))
        .route("/admin/users", get(user::list_users).post(user::create_user))
        .route(
            "/admin/users/{username}",
            get(user::get_user).delete(user::delete_user),
        )
        .route("/admin/users/{username}/role", put(user::set_role))
        .route("/admin/users/{username}/status", put(user::set_status))
        .route("/admin/users/{username}/password", put(user::reset_password))
        .route("/admin/export", get(user::export_users))
        .route("/admin/import", post(user::import_users))
        .route(
            "/announcements",
            get(announcements::list_announcements).post(announcements::publish_announcement),
        )
        .route(
            "/announcements/{timestamp}",
            put(announcements::edit_announcement).delete(announcements::delete_announcement),
        )
        .layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            limit_by_ip,
        ));

    Router::new()
        .nest("/api", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer()),
        )
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_headers([header::CONTENT_TYPE])
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
}

/// Periodically expire elapsed suspensions so dashboards show fresh status.
/// Runs independently of authentication.
pub fn spawn_suspension_ticker(accounts: Arc<AccountStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = accounts.refresh_suspensions().await {
                tracing::warn!(error = %e, "suspension refresh failed");
            }
        }
    })
}

/// Log every directory write; stands in for the admin dashboard's user
/// counter.
pub fn spawn_directory_logger(mut events: broadcast::Receiver<DirectoryChanged>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(DirectoryChanged { user_count }) => {
                    tracing::debug!(user_count, "user directory saved");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "directory notifications lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
