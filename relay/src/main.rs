use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay::{config::Config, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        port = config.port,
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        "relay starting"
    );
    if config.broker_secret.is_none() {
        warn!("RELAY_BROKER_SECRET is not set; every local proxy channel will be refused");
    }

    let state = AppState::new(config.clone());

    // Spawn credential expiry sweeper
    tokio::spawn(Arc::clone(&state.hub).run_credential_expiry(
        config.credential_ttl,
        config.credential_sweep_interval,
    ));

    let app = relay::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
