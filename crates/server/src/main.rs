use parley_server::app::ProjectorApp;
use parley_server::config;
use std::env;
use std::path::Path;
use tokio::runtime::Builder;
use tracing::{error, info};

fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();

    let config_path = env::var("PARLEY_CONFIG").unwrap_or_else(|_| "parley.toml".to_string());
    let config = match config::load_configuration(Path::new(&config_path)) {
        Ok(config) => config,
        Err(err) => {
            error!(path = %config_path, error = %err, "configuration rejected");
            std::process::exit(2);
        }
    };

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async move {
        let mut app = match ProjectorApp::init(config).await {
            Ok(app) => app,
            Err(err) => {
                error!(error = %err, "projector startup failed");
                std::process::exit(1);
            }
        };
        if let Err(err) = app.start().await {
            error!(error = %err, "projection workers failed to start");
            app.shutdown().await;
            std::process::exit(1);
        }
        info!(config = %config_path, "parley projector running");
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "signal listener failed");
        }
        info!("shutdown requested");
        app.shutdown().await;
    });
}
