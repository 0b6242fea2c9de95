//! ensoul HTTP server binary.
//!
//! Serves the API from [`ensoul::server`] and, when a chain RPC endpoint is
//! configured, runs the agent id reconciler next to it.
//!
//! Settings are read from the environment, see [`ensoul::config`]. `RUST_LOG`
//! sets the tracing filter (default: `info,ensoul=debug`).
//!
//! # Usage
//!
//! ```bash
//! ENSOUL_JUDGE_API_KEY=sk-... cargo run --bin server
//! ```

use std::sync::Arc;

use anyhow::Context;
use ensoul::chain::{
    ReconcilerConfig, Reconciler, RegistryEvent, RpcChainClient, DEFAULT_REGISTRY_EVENT,
};
use ensoul::condensation::CondensationConfig;
use ensoul::config::Settings;
use ensoul::curation::{CurationConfig, HttpJudge, HttpJudgeConfig};
use ensoul::server::{app_router, AppState};
use ensoul::store::{MemoryStore, SoulStore, SqliteStore};
use ensoul::{Ensoul, EnsoulConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ensoul=debug".into()),
        )
        .init();

    let settings = Settings::from_env();

    let store: Arc<dyn SoulStore> = if settings.uses_memory_store() {
        tracing::warn!("using the in-memory store, data is lost on exit");
        Arc::new(MemoryStore::new())
    } else {
        tracing::info!(path = %settings.db_path, "opening sqlite store");
        Arc::new(
            SqliteStore::open(&settings.db_path)
                .with_context(|| format!("failed to open {}", settings.db_path))?,
        )
    };

    if settings.judge_api_key.is_none() {
        tracing::warn!("ENSOUL_JUDGE_API_KEY is not set, judge calls will likely fail");
    }
    let judge = HttpJudge::new(HttpJudgeConfig {
        base_url: settings.judge_url.clone(),
        model: settings.judge_model.clone(),
        api_key: settings.judge_api_key.clone(),
        timeout: settings.judge_timeout,
    })
    .context("failed to build judge client")?;

    let service = Arc::new(Ensoul::new(
        store.clone(),
        Arc::new(judge),
        EnsoulConfig {
            curation: CurationConfig {
                judge_timeout: settings.judge_timeout,
                ..CurationConfig::default()
            },
            condensation: CondensationConfig {
                threshold: settings.condense_threshold,
                ..CondensationConfig::default()
            },
            ..EnsoulConfig::default()
        },
    ));

    let reconciler = match &settings.chain_rpc_url {
        Some(url) => {
            let config = ReconcilerConfig {
                interval: settings.reconcile_interval,
                ..ReconcilerConfig::default()
            };
            let chain = RpcChainClient::new(url.clone(), config.request_timeout)
                .context("failed to build chain client")?;
            let event =
                RegistryEvent::new(DEFAULT_REGISTRY_EVENT, settings.registry_address.as_deref());
            tracing::info!(rpc = %url, interval = ?config.interval, "starting reconciler");
            Some(Arc::new(Reconciler::new(store, Arc::new(chain), event, config)).spawn())
        }
        None => {
            tracing::info!("ENSOUL_CHAIN_RPC_URL not set, reconciler disabled");
            None
        }
    };

    if settings.admin_token.is_none() {
        tracing::info!("ENSOUL_ADMIN_TOKEN not set, admin routes disabled");
    }
    let app = app_router(AppState::new(service, settings.admin_token.clone()));

    let bind_addr = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    tracing::info!("ensoul server v{} listening on {}", ensoul::VERSION, bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down");
        })
        .await
        .context("server failed")?;

    if let Some(handle) = reconciler {
        handle.shutdown().await;
    }
    Ok(())
}
