use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use pravah_common::Config;
use pravah_observer::{callback, HttpPushBus, Orchestrator, OrchestratorDeps};
use pravah_store::{PgCanonicalStore, PgCursorStore, PgJobStore, PgSourceStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
                .add_directive("pravah=info".parse()?),
        )
        .init();

    let config = Config::from_env().context("Failed to load config")?;
    config.log_redacted();

    let pool = pravah_store::postgres::connect(&config.database_url, 10)
        .await
        .context("Failed to connect to Postgres")?;

    let bus = HttpPushBus::new(
        config.stage1_topic_url.clone(),
        config.stage2_topic_url.clone(),
    )?;

    let deps = OrchestratorDeps::builder()
        .sources(Arc::new(PgSourceStore::new(pool.clone())))
        .canonical(Arc::new(PgCanonicalStore::new(pool.clone())))
        .cursors(Arc::new(PgCursorStore::new(pool.clone())))
        .jobs(Arc::new(PgJobStore::new(pool)))
        .bus(Arc::new(bus))
        .config(config.pipeline.clone())
        .build();
    let orchestrator = Arc::new(Orchestrator::new(deps));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = cancel_tx.send(true);
        }
    });

    let app = callback::build_router(orchestrator.clone());
    let addr = format!("{}:{}", config.observer_host, config.observer_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "pravah-observer listening");

    let mut server_cancel = cancel_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_cancel.wait_for(|stop| *stop).await;
            })
            .await
    });

    orchestrator.run_forever(cancel_rx).await;
    server.await??;

    Ok(())
}
