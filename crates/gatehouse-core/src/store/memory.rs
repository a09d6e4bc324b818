//! In-memory vector store for tests and embedded runs

use super::{PayloadFilter, PointRecord, SearchHit, VectorStore};
use crate::error::{GatehouseError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Collection {
    dim: usize,
    points: HashMap<String, PointRecord>,
    insertion_order: Vec<String>,
}

/// Process-local [`VectorStore`] with exact cosine search.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of points currently stored in a collection.
    pub fn point_count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .map(|c| c.get(collection).map(|col| col.points.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn ensure_collection(&self, collection: &str, dim: usize) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        collections.entry(collection.to_string()).or_insert(Collection {
            dim,
            points: HashMap::new(),
            insertion_order: Vec::new(),
        });
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        collections.remove(collection);
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<PointRecord>) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        let col = collections
            .get_mut(collection)
            .ok_or_else(|| GatehouseError::CollectionNotFound(collection.to_string()))?;
        for point in points {
            if col.dim > 0 && point.vector.len() != col.dim {
                return Err(GatehouseError::Store(format!(
                    "dimension mismatch in {collection}: expected {}, got {}",
                    col.dim,
                    point.vector.len()
                )));
            }
            if !col.points.contains_key(&point.id) {
                col.insertion_order.push(point.id.clone());
            }
            col.points.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<SearchHit>> {
        let collections = self.collections.lock().unwrap();
        let col = collections
            .get(collection)
            .ok_or_else(|| GatehouseError::CollectionNotFound(collection.to_string()))?;

        let mut hits: Vec<SearchHit> = col
            .points
            .values()
            .filter(|p| filter.map(|f| f.matches(&p.payload)).unwrap_or(true))
            .map(|p| SearchHit {
                id: p.id.clone(),
                score: cosine(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&PayloadFilter>,
        limit: usize,
    ) -> Result<Vec<PointRecord>> {
        let collections = self.collections.lock().unwrap();
        let col = collections
            .get(collection)
            .ok_or_else(|| GatehouseError::CollectionNotFound(collection.to_string()))?;

        Ok(col
            .insertion_order
            .iter()
            .filter_map(|id| col.points.get(id))
            .filter(|p| filter.map(|f| f.matches(&p.payload)).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_points(&self, collection: &str, ids: &[String]) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        let col = collections
            .get_mut(collection)
            .ok_or_else(|| GatehouseError::CollectionNotFound(collection.to_string()))?;
        for id in ids {
            col.points.remove(id);
        }
        col.insertion_order.retain(|id| col.points.contains_key(id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(id: &str, vector: Vec<f32>, session: &str) -> PointRecord {
        let mut payload = serde_json::Map::new();
        payload.insert("session_id".to_string(), json!(session));
        PointRecord {
            id: id.to_string(),
            vector,
            payload,
        }
    }

    #[tokio::test]
    async fn search_orders_by_cosine() {
        let store = MemoryStore::new();
        store.ensure_collection("kb", 2).await.unwrap();
        store
            .upsert(
                "kb",
                vec![
                    point("a", vec![1.0, 0.0], "s1"),
                    point("b", vec![0.0, 1.0], "s1"),
                    point("c", vec![0.7, 0.7], "s1"),
                ],
            )
            .await
            .unwrap();

        let hits = store.search("kb", &[1.0, 0.0], 2, None).await.unwrap();
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "c");
    }

    #[tokio::test]
    async fn filter_restricts_search_and_scroll() {
        let store = MemoryStore::new();
        store.ensure_collection("conv", 2).await.unwrap();
        store
            .upsert(
                "conv",
                vec![
                    point("a", vec![1.0, 0.0], "s1"),
                    point("b", vec![1.0, 0.0], "s2"),
                ],
            )
            .await
            .unwrap();

        let filter = PayloadFilter::matching("session_id", "s1");
        let hits = store
            .search("conv", &[1.0, 0.0], 10, Some(&filter))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");

        let scrolled = store.scroll("conv", Some(&filter), 10).await.unwrap();
        assert_eq!(scrolled.len(), 1);
    }

    #[tokio::test]
    async fn upsert_same_id_is_idempotent() {
        let store = MemoryStore::new();
        store.ensure_collection("kb", 2).await.unwrap();
        store
            .upsert("kb", vec![point("a", vec![1.0, 0.0], "s1")])
            .await
            .unwrap();
        store
            .upsert("kb", vec![point("a", vec![1.0, 0.0], "s1")])
            .await
            .unwrap();
        assert_eq!(store.point_count("kb"), 1);
    }

    #[tokio::test]
    async fn numeric_lt_filter() {
        let store = MemoryStore::new();
        store.ensure_collection("conv", 1).await.unwrap();
        let mut old = point("old", vec![1.0], "s1");
        old.payload.insert("_gh_ts".to_string(), json!(100.0));
        let mut fresh = point("new", vec![1.0], "s1");
        fresh.payload.insert("_gh_ts".to_string(), json!(900.0));
        store.upsert("conv", vec![old, fresh]).await.unwrap();

        let filter = PayloadFilter::matching("session_id", "s1").and_lt("_gh_ts", 500.0);
        let expired = store.scroll("conv", Some(&filter), 100).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "old");
    }
}
