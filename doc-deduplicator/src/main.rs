use anyhow::{Context, Result};
use tracing::info;

use doc_deduplicator::{config::Config, router, server, service::DedupService};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("starting doc deduplicator service");

    let config = Config::init_with_defaults()
        .context("failed to load configuration from environment variables")?;

    info!("configuration loaded: {:?}", config);

    let service = DedupService::new(config.clone())
        .context("failed to create deduplicator service, check the store path and configuration")?;

    let app = router::router(
        service.processor(),
        service.readiness().clone(),
        config.export_prometheus,
    );
    let bind = config.bind_address();
    let server_handle = tokio::spawn(async move {
        server::serve(app, &bind)
            .await
            .expect("failed to start server");
    });
    info!("started server on {}", config.bind_address());

    // Run the service (this blocks until shutdown)
    service.run().await?;

    server_handle.abort();

    Ok(())
}
