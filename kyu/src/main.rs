use anyhow::Context;
use tracing::{error, info};

use kyu::api::{ApiServer, ApiServerConfig, AppState};
use kyu::config::Settings;
use kyu::services::ServiceContainer;
use kyu::signal::shutdown_signal;
use kyu::{database, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let settings = Settings::from_env().context("Invalid configuration")?;
    let (logging_config, _guard) = logging::init_logging(&settings.log_dir)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        worker_mode = %settings.worker_mode,
        "Starting kyu gateway"
    );

    let pool = database::init_pool(&settings.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", settings.database_url))?;
    database::run_migrations(&pool).await?;

    let api_config = ApiServerConfig::from_settings(&settings);
    let container = ServiceContainer::new(pool, settings).with_logging_config(logging_config);
    if let Err(e) = container.initialize() {
        error!("Failed to start services: {}", e);
        container.shutdown().await?;
        return Err(e.into());
    }

    let server = ApiServer::new(api_config, AppState::from_container(&container));
    let cancel_token = server.cancel_token();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => cancel_token.cancel(),
            Err(e) => error!("Failed to listen for shutdown signals: {}", e),
        }
    });

    let served = server.run().await;
    if let Err(e) = &served {
        error!("API server failed: {}", e);
    }

    container.shutdown().await?;
    served?;

    info!("kyu gateway stopped");
    Ok(())
}
