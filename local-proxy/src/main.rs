use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use local_proxy::backend::OpenAiCompatBackend;
use local_proxy::{LocalProxy, WorkerConfig, WorkerIdentity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "local_proxy=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env()?;
    let identity = WorkerIdentity::load_or_create(&config.identity_path)?;
    let backend = OpenAiCompatBackend::new(
        config.backend_url.clone(),
        config.backend_model.clone(),
        config.backend_api_key.clone(),
        config.backend_timeout,
    )?;

    info!(
        worker_id = %identity.worker_id,
        relay_url = %config.relay_url,
        backend_url = %config.backend_url,
        model = ?config.backend_model,
        "local proxy starting"
    );

    let proxy = LocalProxy::new(config, identity, Arc::new(backend));

    tokio::select! {
        err = proxy.run() => {
            error!(error = %err, "local proxy stopped");
            Err(err.into())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
