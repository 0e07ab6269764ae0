use anyhow::{Context, Result};
use gb_transfer::{
    build_app,
    config::AppConfig,
    db,
    services::{
        blob_store::{BlobStore, LocalBlobStore},
        credential_guard::CredentialGuard,
        events::TransferEvents,
        expiry::ExpiryReaper,
        record_store::RecordStore,
        transfer_service::TransferService,
    },
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting gb-transfer with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let pool = db::connect(&cfg.database_url, 5).await?;
    db::run_migrations(&pool).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }
    let pool = Arc::new(pool);

    // --- Initialize core services ---
    let records = RecordStore::new(pool, TransferEvents::default());
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(&cfg.storage_dir));
    let guard = CredentialGuard::new(cfg.hash_cost).context("configuring argon2")?;
    let service = TransferService::new(records.clone(), blobs.clone(), guard, cfg.transfer_policy());

    // --- Background expiry reclamation ---
    let shutdown = CancellationToken::new();
    let reaper = cfg.reap_interval().map(|interval| {
        tracing::info!("Expiry reaper sweeping every {:?}", interval);
        ExpiryReaper::new(
            records,
            blobs,
            service.clock().clone(),
            cfg.reap_batch_size,
            cfg.reap_grace(),
        )
        .spawn(interval, shutdown.clone())
    });

    // --- Build router ---
    let app = build_app(service);

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
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Some(handle) = reaper {
        if let Err(err) = handle.await {
            tracing::warn!("expiry reaper ended abnormally: {}", err);
        }
    }

    Ok(())
}

/// Resolves on Ctrl-C and tells background tasks to stop.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for Ctrl-C: {}", err);
        // Without a signal handler, run until killed.
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
    shutdown.cancel();
}
