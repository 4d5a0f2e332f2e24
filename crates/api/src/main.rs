use std::sync::Arc;

use anyhow::Context;

use mfgmon_queues::QueueConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mfgmon_observability::init();

    let config = QueueConfig::from_env();
    let port: u16 = match std::env::var("APP_PORT") {
        Ok(raw) => raw.parse().with_context(|| format!("invalid APP_PORT: {raw}"))?,
        Err(_) => 3000,
    };

    let services = Arc::new(mfgmon_api::app::services::build_services(config)?);
    let app = mfgmon_api::app::build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind 0.0.0.0:{port}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    services.runtime().shutdown().await;
    Ok(())
}
