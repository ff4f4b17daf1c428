use std::sync::Arc;

use scheduled_mailer::api::mail_routes;
use scheduled_mailer::config::MailerConfig;
use scheduled_mailer::dispatch::{Dispatcher, spawn_dispatch_loop};
use scheduled_mailer::store::{JobStore, LibSqlBackend};
use scheduled_mailer::transport::TransportRouter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = MailerConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("📮 Scheduled Mailer v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.store.path.display());
    eprintln!("   Domains: {}", config.domains.join(", "));
    eprintln!(
        "   Mode: {}",
        if config.smtp.is_some() { "smtp" } else { "sandbox" }
    );
    eprintln!("   API: http://0.0.0.0:{}", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    // Opening migrates the schema and recovers jobs left in progress.
    let store: Arc<dyn JobStore> =
        Arc::new(LibSqlBackend::new_local(&config.store).await.unwrap_or_else(|e| {
            eprintln!(
                "Error: Failed to open database at {}: {}",
                config.store.path.display(),
                e
            );
            std::process::exit(1);
        }));

    // ── Dispatch ─────────────────────────────────────────────────────────
    let router = Arc::new(TransportRouter::from_config(&config)?);
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        router,
        config.retry,
        config.dispatch.clone(),
    ));
    let dispatch_handle = spawn_dispatch_loop(dispatcher);
    tokio::spawn(async move {
        match dispatch_handle.await {
            Ok(Err(e)) => tracing::error!(error = %e, "Dispatch loop stopped on store error"),
            Ok(Ok(())) => tracing::error!("Dispatch loop exited"),
            Err(e) => tracing::error!(error = %e, "Dispatch loop panicked"),
        }
        std::process::exit(1);
    });

    // ── HTTP API ─────────────────────────────────────────────────────────
    let app = mail_routes(Arc::clone(&store), config.hmac_secret.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "Ingestion API started");
    axum::serve(listener, app).await?;

    Ok(())
}
