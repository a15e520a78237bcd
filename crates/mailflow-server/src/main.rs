//! Mailflow - mail server entry point

use anyhow::Result;
use mailflow_common::config::Config;
use mailflow_core::{LocalDelivery, SmtpServer, ToRepository};
use mailflow_pipeline::{PipelineRuntime, PluginRegistry};
use mailflow_storage::{FileStorage, LocalStorage, MessageStore};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Mailflow mail server...");

    // Load configuration
    let config = Config::load()?;

    // Initialize file storage
    let storage: Arc<dyn FileStorage> = Arc::new(LocalStorage::new(&config.storage)?);
    let store = Arc::new(MessageStore::new(storage));

    // Populate the plugin registry: built-ins plus the storage-backed
    // delivery mailets
    let mut registry = PluginRegistry::with_builtins();
    {
        let store = store.clone();
        registry.register_mailet("LocalDelivery", move || {
            Box::new(LocalDelivery::new(store.clone()))
        });
    }
    {
        let store = store.clone();
        registry.register_mailet("ToRepository", move || {
            Box::new(ToRepository::new(store.clone()))
        });
    }

    // Build the pipeline and start the spool workers; a configuration
    // error aborts startup here
    let runtime = PipelineRuntime::start(
        &config.pipeline,
        &config.spool,
        &config.server.hostname,
        registry,
    )
    .await?;

    for stage in runtime.describe() {
        let steps: Vec<String> = stage
            .steps
            .iter()
            .map(|s| format!("{} -> {}", s.matcher, s.mailet))
            .collect();
        info!(stage = %stage.name, steps = ?steps, "Pipeline stage ready");
    }
    info!(
        "Pipeline initialized with {} stage(s), {} spool worker(s)",
        runtime.stages().len(),
        config.spool.workers
    );

    // Start the SMTP front-end
    let smtp_server = Arc::new(SmtpServer::new(
        config.smtp.clone(),
        config.server.hostname.clone(),
        runtime.handle(),
    ));

    let smtp_handle = {
        let smtp_server = smtp_server.clone();
        tokio::spawn(async move {
            if let Err(e) = smtp_server.run().await {
                tracing::error!("SMTP server error: {}", e);
            }
        })
    };

    info!("Mailflow server started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    smtp_handle.abort();
    runtime.shutdown().await;

    info!("Mailflow server shutdown complete");

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mailflow=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
