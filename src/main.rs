mod config;
mod database;
mod models;
mod network;
mod sink;
mod utils;
mod wire;

use log::{error, info};
use std::sync::Arc;

use config::IntakeConfig;
use network::{IntakeError, IntakeService};
use sink::{DatabaseSink, LogSink, ReadingSink};

/// Bind the intake socket and serve until Ctrl+C
async fn serve<S: ReadingSink>(config: &IntakeConfig, sink: S) -> Result<(), IntakeError> {
    let service = match IntakeService::bind(config, Arc::new(sink)).await {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to start intake service: {}", e);
            return Err(e);
        }
    };

    service
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("Program terminated by user. Exiting gracefully.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging, RUST_LOG overrides the default level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match IntakeConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    info!("Starting LightPet intake service on UDP port {}", config.udp_port);

    match config.database_url.as_deref() {
        Some(database_url) => {
            let sink = match DatabaseSink::new(database_url) {
                Ok(sink) => sink,
                Err(e) => {
                    error!("Failed to set up database sink: {}", e);
                    return Err(e.into());
                }
            };
            info!("Persisting readings to PostgreSQL");
            serve(&config, sink).await?
        }
        None => serve(&config, LogSink).await?,
    }

    Ok(())
}
