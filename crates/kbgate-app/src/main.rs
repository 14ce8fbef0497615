use std::net::SocketAddr;

use anyhow::Context;
use kbgate_app::{AppState, build_router, config::AppConfig};
use kbgate_observability::{ObservabilityConfig, init_tracing};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let _tracing = init_tracing("kbgate-app", &ObservabilityConfig::from_env());

    let config = AppConfig::from_env().context("configuration must be valid")?;
    let state = AppState::from_config(&config).context("gateway must initialise")?;
    let app = build_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("socket address must be valid")?;

    let listener = tokio::net::TcpListener::bind(addr).await.context("listener must bind")?;
    info!(event = "server.listening", %addr, credential_cache = %config.credential_cache_path);
    axum::serve(listener, app).await.context("server must run")?;
    Ok(())
}
