use anyhow::{Context, Result};
use axum::Router;
use job_orchestrator::{
    config, db,
    handlers::AppState,
    routes,
    services::{
        blob_store::DiskBlobStore, clock::SystemClock, reaper::Reaper,
        record_store::SqliteRecordStore,
    },
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting job-orchestrator with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db = Arc::new(
        db::connect(&cfg.database_url)
            .await
            .with_context(|| format!("opening database {}", cfg.database_url))?,
    );

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Stores ---
    let jobs = cfg.jobs();
    let clock = Arc::new(SystemClock);
    let records = Arc::new(SqliteRecordStore::new(db.clone(), clock.clone()));
    let blobs = Arc::new(DiskBlobStore::new(
        db.clone(),
        cfg.storage_dir.clone(),
        cfg.public_url.clone(),
        jobs.download_url_lease,
        &cfg.url_secret,
        clock,
    ));

    // --- Background reclamation of expired records ---
    let reaper = Reaper::new(
        records.clone(),
        Duration::from_secs(cfg.reaper_interval_secs),
    )
    .spawn();

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(AppState { records, blobs });

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

    reaper.abort();
    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Could not listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
