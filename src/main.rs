//! Binary bootstrap: config, logging, health endpoint, signal handling.

use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use car_seeder::{CarSeeder, SeederConfig, SeederMode};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SeederConfig::from_env();
    let port = config.port;

    let seeder = match CarSeeder::start(config).await {
        Ok(seeder) => seeder,
        Err(e) => {
            error!(error = %e, "Startup failed");
            std::process::exit(1);
        }
    };

    // Health surface only; everything else is log lines and the metrics file.
    {
        let state = seeder.state_handle();
        let app = Router::new().route(
            "/health",
            get(move || {
                let state = state.clone();
                async move {
                    let mode = match state.get() {
                        SeederMode::RedisMode => "redis",
                        SeederMode::SqliteMode => "sqlite",
                    };
                    Json(json!({ "status": "ok", "mode": mode }))
                }
            }),
        );
        match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                info!(port, "Health endpoint listening");
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app).await {
                        error!(error = %e, "Health server failed");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, port, "Could not bind health endpoint");
                std::process::exit(1);
            }
        }
    }

    tokio::select! {
        _ = seeder.run() => {}
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            seeder.request_shutdown();
        }
    }

    seeder.shutdown().await;
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
        let mut sigint =
            signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to register Ctrl+C handler");
        info!("Received Ctrl+C");
    }
}
