//! Shared application state
//!
//! Every service is constructor-injected; nothing hangs off globals. The
//! same builder wires production clients in `main` and in-memory fakes in
//! tests.

use crate::auth::AuthClient;
use gatehouse_core::config::Settings;
use gatehouse_core::conversation::ConversationManager;
use gatehouse_core::decompose::SubQuestionDecomposer;
use gatehouse_core::embed::Embedder;
use gatehouse_core::filter::InsertBlockFilter;
use gatehouse_core::intent::IntentRouter;
use gatehouse_core::kb::KbRegistry;
use gatehouse_core::llm::LlmRegistry;
use gatehouse_core::node::kb_names;
use gatehouse_core::rerank::RerankModel;
use gatehouse_core::retrieve::{HybridRetriever, MultiKbRetriever, Retriever};
use gatehouse_core::store::VectorStore;
use gatehouse_core::Result;
use std::sync::Arc;

/// Everything a request handler needs.
pub struct AppState {
    pub settings: Settings,
    pub llm_registry: Arc<LlmRegistry>,
    pub intent_router: Arc<IntentRouter>,
    pub multi_kb: Arc<MultiKbRetriever>,
    pub decomposer: Arc<SubQuestionDecomposer>,
    pub insert_filter: Arc<InsertBlockFilter>,
    pub rerank_model: Arc<dyn RerankModel>,
    pub conversation: Arc<ConversationManager>,
    pub auth: Arc<AuthClient>,
    pub rules_retriever: Option<Arc<dyn Retriever>>,
    pub hidden_retriever: Option<Arc<dyn Retriever>>,
}

impl AppState {
    /// Assemble the request pipeline from its injected services. The KB
    /// registry must already hold the `general` base; optional bases are
    /// picked up when their feature flag is on.
    pub fn build(
        settings: Settings,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        rerank_model: Arc<dyn RerankModel>,
        llm_registry: Arc<LlmRegistry>,
        kbs: &KbRegistry,
        auth: Arc<AuthClient>,
    ) -> Result<Self> {
        let hybrid = |name: &str| -> Option<Arc<dyn Retriever>> {
            kbs.get(name).map(|kb| {
                Arc::new(HybridRetriever::new(
                    kb,
                    store.clone(),
                    embedder.clone(),
                    settings.retrieval.clone(),
                )) as Arc<dyn Retriever>
            })
        };

        let general = kbs.require(kb_names::GENERAL)?;
        let general_retriever: Arc<dyn Retriever> = Arc::new(HybridRetriever::new(
            general,
            store.clone(),
            embedder.clone(),
            settings.retrieval.clone(),
        ));

        let visa_free = settings
            .features
            .visa_free
            .then(|| hybrid(kb_names::VISA_FREE))
            .flatten();
        let airline = settings
            .features
            .airline
            .then(|| hybrid(kb_names::AIRLINE))
            .flatten();
        let rules_retriever = settings
            .features
            .rules
            .then(|| hybrid(kb_names::RULES))
            .flatten();
        let hidden_retriever = settings
            .features
            .hidden_kb
            .then(|| hybrid(kb_names::HIDDEN))
            .flatten();

        let multi_kb = Arc::new(MultiKbRetriever::new(
            general_retriever,
            visa_free,
            airline,
            settings.retrieval.clone(),
        ));

        let intent_router = Arc::new(IntentRouter::new(&llm_registry, settings.intent.clone()));
        let decomposer = Arc::new(SubQuestionDecomposer::new(
            llm_registry.default_client()?,
            settings.subquestion.clone(),
        ));
        let insert_filter = Arc::new(InsertBlockFilter::new(settings.insert_block.clone()));
        let conversation = Arc::new(ConversationManager::new(
            store,
            embedder,
            settings.conversation.clone(),
        ));

        Ok(Self {
            settings,
            llm_registry,
            intent_router,
            multi_kb,
            decomposer,
            insert_filter,
            rerank_model,
            conversation,
            auth,
            rules_retriever,
            hidden_retriever,
        })
    }
}
