use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use wonder_labs_server::{
    app::{self, AppState},
    config::Config,
    storage::{KeyValueStore, SqliteKeyValueStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    if config.openai_api_key.is_none() {
        tracing::warn!(
            "OPENAI_API_KEY is not set. The /api/ask endpoint will fail until you set it."
        );
    }

    let kv: Arc<dyn KeyValueStore> = Arc::new(
        SqliteKeyValueStore::connect(&config.database_url)
            .await
            .with_context(|| format!("failed to open {}", config.database_url))?,
    );
    let state = AppState::from_config(kv, &config);

    if let Some(admin) = &config.bootstrap_admin {
        state
            .accounts
            .ensure_admin(&admin.username, &admin.password)
            .await
            .context("failed to create bootstrap admin")?;
    }

    app::spawn_suspension_ticker(state.accounts.clone(), config.suspension_tick);
    app::spawn_directory_logger(state.accounts.subscribe());

    let addr = config.server_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Server running on http://{}", addr);

    axum::serve(
        listener,
        app::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
