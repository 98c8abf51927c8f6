//! MCP server initialization for stdio and streamable-HTTP transports.
//!
//! Provides [`serve_stdio`] and [`serve_http`] entry points that wire the
//! database, in-process index, providers, and the memory facade into a
//! running server, spawn the background evaluator, and handle graceful
//! shutdown (auto-reflecting live sessions before the pools drain).

use anyhow::Result;
use rmcp::ServiceExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::config::MnemonConfig;
use crate::db;
use crate::embedding;
use crate::llm::LlmClient;
use crate::memory::evaluator::Evaluator;
use crate::memory::index::KeywordIndex;
use crate::memory::manager::MemoryManager;
use crate::memory::session::SessionTracker;
use crate::memory::tokens::TokenCounter;
use crate::nli::NliClassifier;
use crate::tools::MnemonTools;

/// Shared setup: open DB, build providers, compose the facade, start the
/// evaluator. Returns the manager, evaluator handle, and shutdown sender.
fn setup_shared_state(
    config: MnemonConfig,
) -> Result<(
    Arc<MemoryManager>,
    Option<tokio::task::JoinHandle<()>>,
    watch::Sender<bool>,
)> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path)?;
    tracing::info!(db = %db_path.display(), "database ready");

    // Warn when the configured embedding model no longer matches the vectors
    if let Ok(Some(stored_model)) = db::migrations::get_embedding_model(&conn) {
        if stored_model != config.embedding.model {
            tracing::warn!(
                stored = %stored_model,
                configured = %config.embedding.model,
                "embedding model changed — existing vectors were produced by a different model"
            );
        }
    }

    let db = Arc::new(Mutex::new(conn));

    let index = Arc::new(KeywordIndex::new(
        config.working_memory.max_tokens,
        config.working_memory.eviction_importance,
    ));
    let sessions = Arc::new(SessionTracker::new());
    let embedder: Arc<dyn embedding::EmbeddingProvider> =
        Arc::from(embedding::create_provider(&config.embedding)?);
    let llm = Arc::new(LlmClient::from_config(&config.llm)?);
    let nli = Arc::new(NliClassifier::from_config(&config.nli)?);
    let tokens = Arc::new(TokenCounter::from_cache_dir(&crate::config::expand_tilde(
        &config.nli.cache_dir,
    )));
    tracing::info!(
        embedding = %config.embedding.provider,
        llm = %config.llm.provider,
        nli = %config.nli.mode,
        "providers ready"
    );

    let evaluator_config = config.evaluator.clone();
    let config = Arc::new(config);

    let manager = Arc::new(MemoryManager::new(
        Arc::clone(&db),
        Arc::clone(&index),
        Arc::clone(&sessions),
        Arc::clone(&embedder),
        Arc::clone(&llm),
        nli,
        tokens,
        config,
        Some(db_path),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let evaluator_handle = if evaluator_config.enabled {
        let evaluator = Evaluator::new(
            db,
            index,
            llm,
            Duration::from_secs(evaluator_config.poll_interval_secs),
        );
        Some(evaluator.spawn(shutdown_rx))
    } else {
        None
    };

    Ok((manager, evaluator_handle, shutdown_tx))
}

/// Reflect every live session, stop the evaluator, and wait for it to finish
/// its current job.
async fn shutdown(
    manager: &Arc<MemoryManager>,
    evaluator: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
) {
    let live = manager.sessions().live_session_ids();
    if !live.is_empty() {
        tracing::info!(sessions = live.len(), "auto-reflecting live sessions");
        let manager = Arc::clone(manager);
        let _ = tokio::task::spawn_blocking(move || {
            for session_id in live {
                manager.auto_reflect(&session_id);
            }
        })
        .await;
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = evaluator {
        let _ = handle.await;
    }
}

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: MnemonConfig) -> Result<()> {
    tracing::info!("starting mnemon MCP server on stdio");

    let (manager, evaluator, shutdown_tx) = setup_shared_state(config)?;

    let tools = MnemonTools::new(Arc::clone(&manager));
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running — waiting for client");

    server.waiting().await?;
    shutdown(&manager, evaluator, shutdown_tx).await;
    tracing::info!("MCP server shut down");

    Ok(())
}

/// Start the MCP server over streamable HTTP.
pub async fn serve_http(config: MnemonConfig) -> Result<()> {
    let host = config.server.host.clone();
    let port = config.server.port;
    let bind_addr = format!("{host}:{port}");

    tracing::info!(addr = %bind_addr, "starting mnemon MCP server on streamable HTTP");

    let (manager, evaluator, shutdown_tx) = setup_shared_state(config)?;

    let service_manager = Arc::clone(&manager);
    let service = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || Ok(MnemonTools::new(Arc::clone(&service_manager))),
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "MCP server listening at http://{bind_addr}/mcp");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl-c");
            tracing::info!("shutting down HTTP server");
        })
        .await?;

    shutdown(&manager, evaluator, shutdown_tx).await;
    Ok(())
}
