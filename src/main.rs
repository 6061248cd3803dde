//! Governance Core API
//!
//! HTTP surface over the policy engine, content filter, audit trail and
//! lineage graph.

use governance_core::cache::{Cache, MemoryCache};
use governance_core::config::{Settings, StorageBackend};
use governance_core::routes::create_router;
use governance_core::state::AppState;
use governance_core::storage::{MemoryStore, PgStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting Governance Core...");

    let settings = Settings::load()?;
    info!("Configuration loaded ({:?} storage)", settings.storage);

    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());

    let state = match settings.storage {
        StorageBackend::Postgres => {
            let store = Arc::new(PgStore::connect(&settings.database).await?);
            AppState::new(settings.clone(), store, cache)?
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; data is lost on restart");
            AppState::new(settings.clone(), Arc::new(MemoryStore::new()), cache)?
        }
    };
    let state = Arc::new(state);

    let app = create_router(Arc::clone(&state), &settings);
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("Server listening on http://{}", addr);
    info!("   POST /api/policies/evaluate    - Evaluate a request against active policies");
    info!("   POST /api/filter/check         - Scan content");
    info!("   POST /api/audit/search         - Search the audit trail");
    info!("   GET  /api/lineage/nodes/{{id}}/graph - Traverse lineage");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Finish in-flight violation writes, then drain buffered audit events
    state.policy.drain().await;
    state.audit.stop().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,governance_core=debug,tower_http=debug"));

    let json = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
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
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
