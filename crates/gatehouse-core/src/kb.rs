//! Knowledge bases
//!
//! A knowledge base is a named node set with a dense collection in the vector
//! store and a precomputed BM25 index. Nodes are hydrated once at load and
//! read-only afterwards.
//!
//! Hydration restores every payload key that does not carry the internal
//! sentinel prefix, plus both excluded-keys lists. Losing those keys was a
//! documented failure mode upstream (rerank scores collapsed when file names
//! vanished from metadata).

use crate::bm25::Bm25Index;
use crate::embed::Embedder;
use crate::error::{GatehouseError, Result};
use crate::node::{Node, INTERNAL_KEY_PREFIX, TEXT_KEY};
use crate::store::{PointRecord, VectorStore};
use md5::{Digest, Md5};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Payload key for the excluded-embed metadata key list.
pub const EXCLUDED_EMBED_KEY: &str = "_gh_excluded_embed_keys";
/// Payload key for the excluded-LLM metadata key list.
pub const EXCLUDED_LLM_KEY: &str = "_gh_excluded_llm_keys";

/// Max points pulled when hydrating a collection.
const HYDRATE_LIMIT: usize = 100_000;

/// One loaded knowledge base.
pub struct KnowledgeBase {
    name: String,
    collection: String,
    nodes: Vec<Node>,
    by_id: HashMap<String, usize>,
    bm25: Bm25Index,
}

impl KnowledgeBase {
    /// Build a KB from already-hydrated nodes.
    pub fn from_nodes(
        name: impl Into<String>,
        collection: impl Into<String>,
        nodes: Vec<Node>,
    ) -> Self {
        let name = name.into();
        let bm25 = Bm25Index::build(&nodes);
        let by_id = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        tracing::info!(
            kb = %name,
            nodes = nodes.len(),
            bm25_docs = bm25.len(),
            "knowledge base loaded"
        );
        Self {
            name,
            collection: collection.into(),
            nodes,
            by_id,
            bm25,
        }
    }

    /// Hydrate all points of a collection into a KB.
    pub async fn load(
        name: impl Into<String>,
        collection: impl Into<String>,
        store: &dyn VectorStore,
    ) -> Result<Self> {
        let collection = collection.into();
        let points = store.scroll(&collection, None, HYDRATE_LIMIT).await?;
        let nodes = points.into_iter().filter_map(node_from_point).collect();
        Ok(Self::from_nodes(name, collection, nodes))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn bm25(&self) -> &Bm25Index {
        &self.bm25
    }

    pub fn get(&self, node_id: &str) -> Option<&Node> {
        self.by_id.get(node_id).map(|i| &self.nodes[*i])
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Rebuild a point's node, restoring payload hygiene rules.
fn node_from_point(point: PointRecord) -> Option<Node> {
    let text = point
        .payload
        .get(TEXT_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)?;
    if text.is_empty() {
        return None;
    }

    let string_list = |value: Option<&Value>| -> Vec<String> {
        value
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let excluded_embed_metadata_keys = string_list(point.payload.get(EXCLUDED_EMBED_KEY));
    let excluded_llm_metadata_keys = string_list(point.payload.get(EXCLUDED_LLM_KEY));

    let metadata: Map<String, Value> = point
        .payload
        .into_iter()
        .filter(|(k, _)| !k.starts_with(INTERNAL_KEY_PREFIX))
        .collect();

    Some(Node {
        id: point.id,
        text,
        metadata,
        excluded_embed_metadata_keys,
        excluded_llm_metadata_keys,
    })
}

/// Serialize a node into a point payload (inverse of hydration).
pub fn point_from_node(node: &Node, vector: Vec<f32>) -> PointRecord {
    let mut payload = node.metadata.clone();
    payload.insert(TEXT_KEY.to_string(), json!(node.text));
    payload.insert(
        EXCLUDED_EMBED_KEY.to_string(),
        json!(node.excluded_embed_metadata_keys),
    );
    payload.insert(
        EXCLUDED_LLM_KEY.to_string(),
        json!(node.excluded_llm_metadata_keys),
    );
    PointRecord {
        id: node.id.clone(),
        vector,
        payload,
    }
}

/// Embed and upsert nodes into a KB collection (used by reindexing).
pub async fn index_nodes(
    store: &dyn VectorStore,
    embedder: &dyn Embedder,
    collection: &str,
    nodes: &[Node],
) -> Result<()> {
    store
        .ensure_collection(collection, embedder.dimensions())
        .await?;
    if nodes.is_empty() {
        return Ok(());
    }
    let texts: Vec<String> = nodes.iter().map(|n| n.text.clone()).collect();
    let vectors = embedder.embed_batch(&texts).await?;
    let points = nodes
        .iter()
        .zip(vectors)
        .map(|(node, vector)| point_from_node(node, vector))
        .collect();
    store.upsert(collection, points).await
}

/// All loaded knowledge bases, by canonical name.
#[derive(Default)]
pub struct KbRegistry {
    bases: HashMap<String, Arc<KnowledgeBase>>,
}

impl KbRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kb: KnowledgeBase) {
        self.bases.insert(kb.name().to_string(), Arc::new(kb));
    }

    pub fn get(&self, name: &str) -> Option<Arc<KnowledgeBase>> {
        self.bases.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<KnowledgeBase>> {
        self.get(name)
            .ok_or_else(|| GatehouseError::CollectionNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.bases.keys().map(String::as_str).collect()
    }
}

/// On-disk registry of per-KB source-file MD5 hashes (`kb_hashes.json`).
///
/// A mismatch or a missing entry marks the KB stale: the collection is
/// dropped and rebuilt by the ingest step before serving.
pub struct KbHashRegistry {
    path: PathBuf,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl KbHashRegistry {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let hashes = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            HashMap::new()
        };
        Ok(Self { path, hashes })
    }

    pub fn file_hash(content: &[u8]) -> String {
        format!("{:x}", Md5::digest(content))
    }

    /// Whether the recorded hashes differ from the given source files.
    pub fn is_stale(&self, kb_name: &str, files: &[(String, String)]) -> bool {
        let Some(recorded) = self.hashes.get(kb_name) else {
            return true;
        };
        if recorded.len() != files.len() {
            return true;
        }
        files.iter().any(|(name, hash)| {
            recorded.get(name).map(String::as_str) != Some(hash.as_str())
        })
    }

    /// Record the current hashes for a KB and persist the registry.
    pub fn record(&mut self, kb_name: &str, files: Vec<(String, String)>) -> Result<()> {
        self.hashes
            .insert(kb_name.to_string(), files.into_iter().collect());
        let content = serde_json::to_string_pretty(&self.hashes)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}
