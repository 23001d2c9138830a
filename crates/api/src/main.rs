use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use purse_api::app::{self, BalanceService, services::SharedStore};
use purse_infra::config::{Config, StorageBackend};
use purse_infra::store::{InMemoryLedgerStore, PostgresLedgerStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    purse_observability::init(config.log_format);

    let store: SharedStore = match &config.storage {
        StorageBackend::Postgres { url, max_connections } => {
            let store = PostgresLedgerStore::connect(url, *max_connections)
                .await
                .context("failed to connect to postgres")?;
            store
                .init_schema()
                .await
                .context("failed to initialise schema")?;
            tracing::info!(max_connections, "using postgres store");
            Arc::new(store)
        }
        StorageBackend::InMemory => {
            tracing::warn!("DATABASE_URL not set; using in-memory store (data is lost on exit)");
            Arc::new(InMemoryLedgerStore::new())
        }
    };

    let service = Arc::new(BalanceService::new(store, config.request_timeout));
    let router = app::build_app(service);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
