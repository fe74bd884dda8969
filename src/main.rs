use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use taskbridge::app::{create_app, create_degraded_app, spawn_maintenance, Services};
use taskbridge::config::{load_config, TaskBridgeConfig};
use taskbridge::crypto::MasterKeySource;
use taskbridge::store::Database;
use taskbridge::upstream::HttpTaskApi;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskbridge=info".into()),
        )
        .init();

    info!("TaskBridge starting...");

    let mut config = match std::env::var("TASKBRIDGE_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => TaskBridgeConfig::default(),
    };
    config.apply_env();
    config.validate().context("Invalid configuration")?;

    info!(
        bind_addr = %config.server.bind_addr,
        base_url = %config.server.base_url,
        db_path = %config.database.path,
        upstream = %config.upstream.base_url,
        "Configuration loaded"
    );

    let key_source = Arc::new(MasterKeySource::from_env());
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;

    if !key_source.is_configured() {
        warn!("No master key configured (TASKBRIDGE_MASTER_KEY); serving status and discovery only");
        let app = create_degraded_app(&config, key_source);
        let server_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "HTTP server error");
            }
        });

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl_c signal")?;
        info!("Shutdown signal received");
        server_handle.abort();
        return Ok(());
    }

    let db = Database::open(&config.database.path).context("Failed to open database")?;
    info!(path = %config.database.path, "Database initialized");

    let api = Arc::new(
        HttpTaskApi::new(
            &config.upstream.base_url,
            Duration::from_secs(config.upstream.timeout_seconds),
        )
        .context("Failed to build upstream client")?,
    );

    let services =
        Services::new(&config, db, key_source, api).context("Failed to initialize services")?;
    let maintenance = spawn_maintenance(&config, &services);
    let sessions = Arc::clone(&services.sessions);

    let app = create_app(&config, &services);
    info!(addr = %config.server.bind_addr, "HTTP server listening");

    let server_handle = tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service).await {
            error!(error = %e, "HTTP server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    let closed = sessions.close_all().await;
    for handle in maintenance {
        handle.abort();
    }
    info!(sessions_closed = closed, "TaskBridge stopped");

    Ok(())
}
