use anyhow::{Context, Result};
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use thumbnailer::{
    config::AppConfig,
    db,
    routes::routes::routes,
    services::{
        dispatcher::Dispatcher, metadata_store::SqliteMetadataStore, object_store::ObjectStore,
        pipeline::ThumbnailPipeline,
    },
    state::AppState,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting thumbnailer with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    tokio::fs::create_dir_all(&cfg.storage_dir)
        .await
        .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;

    // --- Initialize SQLite connection ---
    let pool = Arc::new(db::connect(&cfg.database_url).await?);
    let metadata = SqliteMetadataStore::new(pool.clone(), cfg.pipeline.metadata_table.clone())?;

    db::ensure_object_schema(&pool).await?;
    metadata
        .ensure_schema()
        .await
        .context("creating metadata table")?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize pipeline + dispatcher ---
    let objects = ObjectStore::new(pool.clone(), cfg.storage_dir.clone());
    let pipeline = Arc::new(ThumbnailPipeline::new(
        cfg.pipeline.clone(),
        Arc::new(objects.clone()),
        Arc::new(objects.clone()),
        Arc::new(metadata.clone()),
    ));
    let dispatcher = Dispatcher::spawn(pipeline, cfg.dispatcher.clone());

    let state = AppState {
        objects,
        metadata,
        dispatcher: dispatcher.handle(),
        source_bucket: cfg.pipeline.source_bucket.clone(),
    };

    // --- Build router ---
    let app: Router = routes().with_state(state.clone());

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Drain queued events, then stop workers ---
    let pending = state.dispatcher.in_flight();
    if pending > 0 {
        tracing::info!(pending, "waiting for queued events before exit");
        let drain = tokio::time::timeout(DRAIN_TIMEOUT, state.dispatcher.wait_idle());
        if drain.await.is_err() {
            tracing::warn!("drain timed out");
        }
    }
    dispatcher.shutdown().await;

    Ok(())
}

const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
