use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use handwire::config::Config;
use handwire::routes;
use handwire::server::{Server, ServerHandle};
use handwire::storage::UploadStore;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "handwire=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    let server_config = config.server_config();
    if let Err(e) = UploadStore::new(server_config.uploads_dir.clone())
        .ensure_root()
        .await
    {
        error!(error = %e, dir = %server_config.uploads_dir.display(), "cannot create uploads directory");
        return ExitCode::FAILURE;
    }

    let router = routes::router(&server_config);
    let mut server = Server::new(router, server_config);
    let addr = match server.listen(config.port).await {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, requested = config.port, "failed to start server");
            return ExitCode::FAILURE;
        }
    };
    info!(address = %addr, version = routes::VERSION, "handwire started");

    tokio::spawn(close_on_signal(server.handle()));

    match server.serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}

/// Waits for SIGINT or SIGTERM, then drains the server.
async fn close_on_signal(handle: ServerHandle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!(signal = "SIGINT", "shutting down gracefully"),
        () = terminate => info!(signal = "SIGTERM", "shutting down gracefully"),
    }
    handle.close().await;
    info!("all connections drained");
}
