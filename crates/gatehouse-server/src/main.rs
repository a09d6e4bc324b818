//! Gatehouse server entry point
//!
//! Loads configuration, connects the downstream services, hydrates the
//! knowledge bases and serves the SSE chat endpoints. Any startup failure is
//! fatal: the process refuses to serve misconfigured.

use anyhow::Context;
use gatehouse_core::config::Settings;
use gatehouse_core::embed::HttpEmbedder;
use gatehouse_core::kb::{KbRegistry, KnowledgeBase};
use gatehouse_core::llm::LlmRegistry;
use gatehouse_core::node::kb_names;
use gatehouse_core::rerank::HttpRerankModel;
use gatehouse_core::store::{QdrantStore, VectorStore};
use gatehouse_server::auth::AuthClient;
use gatehouse_server::{routes, AppState};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var("GATEHOUSE_CONFIG").unwrap_or_else(|_| "gatehouse.yml".into());
    let settings = Settings::load(Path::new(&config_path)).context("loading configuration")?;

    let store: Arc<dyn VectorStore> =
        Arc::new(QdrantStore::connect(&settings.qdrant_url).context("connecting vector store")?);
    let embedder = Arc::new(
        HttpEmbedder::new(
            settings.embedding.url.clone(),
            settings.embedding.model.clone(),
            settings.embedding.api_key.clone(),
            settings.embedding.dimensions,
        )
        .context("building embedding client")?,
    );
    let rerank_model = Arc::new(
        HttpRerankModel::new(
            settings.reranker.url.clone(),
            settings.reranker.model.clone(),
        )
        .context("building rerank client")?,
    );
    let llm_registry =
        Arc::new(LlmRegistry::from_config(&settings.llm).context("building LLM registry")?);
    let auth = Arc::new(AuthClient::new(settings.auth_service_url.clone())?);

    let mut kbs = KbRegistry::new();
    kbs.insert(
        KnowledgeBase::load(kb_names::GENERAL, "knowledge_base", store.as_ref())
            .await
            .context("loading general knowledge base")?,
    );
    let optional = [
        (settings.features.visa_free, kb_names::VISA_FREE, "visa_free"),
        (settings.features.airline, kb_names::AIRLINE, "airline"),
        (settings.features.rules, kb_names::RULES, "rules"),
        (settings.features.hidden_kb, kb_names::HIDDEN, "hidden"),
    ];
    for (enabled, name, collection) in optional {
        if !enabled {
            continue;
        }
        match KnowledgeBase::load(name, collection, store.as_ref()).await {
            Ok(kb) => kbs.insert(kb),
            Err(e) => tracing::warn!(kb = name, "optional knowledge base not loaded: {e}"),
        }
    }

    let state = Arc::new(AppState::build(
        settings.clone(),
        store,
        embedder,
        rerank_model,
        llm_registry,
        &kbs,
        auth,
    )?);
    state
        .conversation
        .ensure_collection()
        .await
        .context("preparing conversations collection")?;

    // Periodic conversation GC.
    {
        let conversation = state.conversation.clone();
        let expire_days = state.settings.conversation.expire_days;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(6 * 3600));
            loop {
                interval.tick().await;
                match conversation.gc(expire_days).await {
                    Ok(deleted) if deleted > 0 => {
                        tracing::info!(deleted, "expired conversation turns removed")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("conversation GC failed: {e}"),
                }
            }
        });
    }

    let app = routes::router(state.clone());
    let bind = settings.server_bind.clone();
    tracing::info!(%bind, "gatehouse listening");
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .context("binding server address")?;
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}
