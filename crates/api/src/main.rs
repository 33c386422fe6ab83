use std::sync::Arc;

use anyhow::Context;

use docflow_api::app::{self, AppServices};
use docflow_infra::ServiceConfig;

/// Runs left unfinished by a previous process are resumed at startup, at
/// most this many per start.
const RECOVERY_BATCH: usize = 1_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    docflow_observability::init();

    let config = ServiceConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(
        AppServices::from_config(&config)
            .await
            .context("failed to build services")?,
    );

    let _notifications = services.spawn_notification_logger();

    let resumed = services
        .processor
        .resume_incomplete(chrono::Utc::now(), RECOVERY_BATCH)
        .await
        .context("run recovery failed")?;
    if resumed > 0 {
        tracing::info!(resumed, "resumed unfinished runs");
    }

    let poller = services.retry_poller().spawn();

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app::build_app(services))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server error")?;

    poller.shutdown().await;
    Ok(())
}
