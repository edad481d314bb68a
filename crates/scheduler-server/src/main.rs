use std::process::ExitCode;
use std::sync::Arc;

use scheduler_core::clock::SystemClock;
use scheduler_core::notify::{Notifier, NullWebhookSink};
use scheduler_core::Engine;
use scheduler_server::{api, catalog, webhook, Config};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let catalog = match catalog::load_from_path(&config.catalog_path) {
        Ok(catalog) => catalog,
        Err(err) => {
            error!(error = %err, path = %config.catalog_path, "failed to load catalog");
            return ExitCode::FAILURE;
        }
    };

    let notifier = match &config.webhook_url {
        Some(url) => Notifier::new(Box::new(webhook::HttpWebhookSink::new(url.clone(), config.webhook_token.clone()))),
        None => Notifier::new(Box::new(NullWebhookSink)),
    };

    let engine = Engine::new(Arc::new(SystemClock), catalog, notifier);
    engine.start().await;

    let shutdown = CancellationToken::new();
    let loop_handle = engine.spawn_loop(config.tick_interval, shutdown.clone());

    let app = api::build_app(api::AppState { engine: Arc::clone(&engine) });
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, port = config.port, "failed to bind control API port");
            shutdown.cancel();
            return ExitCode::FAILURE;
        }
    };

    info!(port = config.port, catalog_path = %config.catalog_path, "taskschedd listening");

    let serve = axum::serve(listener, app.into_make_service());
    tokio::select! {
        result = serve => {
            if let Err(err) = result {
                error!(error = %err, "control API server exited unexpectedly");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    engine.stop().await;
    shutdown.cancel();
    let _ = loop_handle.await;

    ExitCode::SUCCESS
}
