//! Fixed-window request limiting keyed by client IP.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;

use crate::error::AppError;

pub const WINDOW: Duration = Duration::from_secs(60);

struct Window {
    started: Instant,
    hits: u32,
}

pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, WINDOW)
    }

    /// Count a hit for `key`; false once the window's budget is spent.
    pub async fn check(&self, key: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock().await;

        // Drop stale windows so the map does not grow with every address seen.
        windows.retain(|_, w| now.duration_since(w.started) < self.window);

        let window = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            hits: 0,
        });
        if window.hits >= self.limit {
            return false;
        }
        window.hits += 1;
        true
    }
}

/// Middleware applied to every `/api/` route.
pub async fn limit_by_ip(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if !limiter.check(&client, Instant::now()).await {
        tracing::warn!(%client, "rate limit exceeded");
        return AppError::RateLimited.into_response();
    }

    next.run(request).await
}
