//! Qdrant-backed vector store

use super::{PayloadFilter, PointRecord, SearchHit, VectorStore};
use crate::error::{GatehouseError, Result};
use async_trait::async_trait;
use qdrant_client::client::{Payload, QdrantClient};
use qdrant_client::qdrant::{
    condition::ConditionOneOf, point_id::PointIdOptions, points_selector::PointsSelectorOneOf,
    r#match::MatchValue, value::Kind, vectors_config, with_payload_selector::SelectorOptions,
    Condition, CreateCollection, Distance, FieldCondition, Filter, ListValue, Match, PointId,
    PointStruct, PointsIdsList, PointsSelector, Range, ScrollPoints, SearchPoints, Struct,
    Value as QdrantValue, VectorParams, VectorsConfig, WithPayloadSelector,
};
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::HashMap;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Vector store client talking to a remote Qdrant instance.
pub struct QdrantStore {
    client: QdrantClient,
}

impl QdrantStore {
    pub fn connect(url: &str) -> Result<Self> {
        let client = QdrantClient::from_url(url)
            .build()
            .map_err(|e| GatehouseError::Store(format!("qdrant connect: {e}")))?;
        Ok(Self { client })
    }

    async fn retrying<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, anyhow::Error>>,
    {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(BACKOFF_BASE * attempt).await;
            }
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    tracing::warn!(op = op_name, attempt, "vector store call failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(GatehouseError::Store(format!(
            "{op_name} failed after {MAX_ATTEMPTS} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, collection: &str, dim: usize) -> Result<()> {
        let existing = self
            .retrying("list_collections", || async {
                self.client.list_collections().await
            })
            .await?;
        if existing.collections.iter().any(|c| c.name == collection) {
            return Ok(());
        }

        self.retrying("create_collection", || async {
            self.client
                .create_collection(&CreateCollection {
                    collection_name: collection.to_string(),
                    vectors_config: Some(VectorsConfig {
                        config: Some(vectors_config::Config::Params(VectorParams {
                            size: dim as u64,
                            distance: Distance::Cosine.into(),
                            ..Default::default()
                        })),
                    }),
                    ..Default::default()
                })
                .await
        })
        .await?;
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.retrying("delete_collection", || async {
            self.client.delete_collection(collection).await
        })
        .await?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<PointRecord>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let qdrant_points: Vec<PointStruct> = points
            .iter()
            .map(|p| {
                let payload: HashMap<String, QdrantValue> = p
                    .payload
                    .iter()
                    .map(|(k, v)| (k.clone(), json_to_qdrant(v)))
                    .collect();
                PointStruct::new(
                    p.id.clone(),
                    p.vector.clone(),
                    Payload::new_from_hashmap(payload),
                )
            })
            .collect();

        self.retrying("upsert", || {
            let points = qdrant_points.clone();
            async move {
                self.client
                    .upsert_points_blocking(collection, None, points, None)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<SearchHit>> {
        let request = SearchPoints {
            collection_name: collection.to_string(),
            vector: vector.to_vec(),
            limit: limit as u64,
            with_payload: Some(WithPayloadSelector {
                selector_options: Some(SelectorOptions::Enable(true)),
            }),
            filter: filter.map(build_filter),
            ..Default::default()
        };

        let response = self
            .retrying("search", || {
                let request = request.clone();
                async move { self.client.search_points(&request).await }
            })
            .await?;

        Ok(response
            .result
            .into_iter()
            .map(|point| SearchHit {
                id: point_id_string(&point.id),
                score: point.score,
                payload: payload_to_json(point.payload),
            })
            .collect())
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&PayloadFilter>,
        limit: usize,
    ) -> Result<Vec<PointRecord>> {
        let request = ScrollPoints {
            collection_name: collection.to_string(),
            filter: filter.map(build_filter),
            limit: Some(limit as u32),
            with_payload: Some(WithPayloadSelector {
                selector_options: Some(SelectorOptions::Enable(true)),
            }),
            ..Default::default()
        };

        let response = self
            .retrying("scroll", || {
                let request = request.clone();
                async move { self.client.scroll(&request).await }
            })
            .await?;

        Ok(response
            .result
            .into_iter()
            .map(|point| PointRecord {
                id: point_id_string(&point.id),
                vector: Vec::new(),
                payload: payload_to_json(point.payload),
            })
            .collect())
    }

    async fn delete_points(&self, collection: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let selector = PointsSelector {
            points_selector_one_of: Some(PointsSelectorOneOf::Points(PointsIdsList {
                ids: ids.iter().map(|id| PointId::from(id.clone())).collect(),
            })),
        };
        self.retrying("delete_points", || {
            let selector = selector.clone();
            async move {
                self.client
                    .delete_points(collection, None, &selector, None)
                    .await
            }
        })
        .await?;
        Ok(())
    }
}

fn build_filter(filter: &PayloadFilter) -> Filter {
    let mut must = Vec::new();
    for (key, value) in &filter.must_match {
        let match_value = match value {
            JsonValue::String(s) => MatchValue::Keyword(s.clone()),
            JsonValue::Bool(b) => MatchValue::Boolean(*b),
            JsonValue::Number(n) => MatchValue::Integer(n.as_i64().unwrap_or_default()),
            other => MatchValue::Keyword(other.to_string()),
        };
        must.push(Condition {
            condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
                key: key.clone(),
                r#match: Some(Match {
                    match_value: Some(match_value),
                }),
                ..Default::default()
            })),
        });
    }
    if let Some((key, bound)) = &filter.numeric_lt {
        must.push(Condition {
            condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
                key: key.clone(),
                range: Some(Range {
                    lt: Some(*bound),
                    ..Default::default()
                }),
                ..Default::default()
            })),
        });
    }
    Filter {
        must,
        ..Default::default()
    }
}

fn json_to_qdrant(json: &JsonValue) -> QdrantValue {
    match json {
        JsonValue::Null => QdrantValue { kind: None },
        JsonValue::Bool(b) => QdrantValue::from(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                QdrantValue::from(i)
            } else {
                QdrantValue::from(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => QdrantValue::from(s.clone()),
        JsonValue::Array(items) => QdrantValue {
            kind: Some(Kind::ListValue(ListValue {
                values: items.iter().map(json_to_qdrant).collect(),
            })),
        },
        JsonValue::Object(fields) => QdrantValue {
            kind: Some(Kind::StructValue(Struct {
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.clone(), json_to_qdrant(v)))
                    .collect(),
            })),
        },
    }
}

fn qdrant_to_json(value: &QdrantValue) -> JsonValue {
    match value.kind.as_ref() {
        None | Some(Kind::NullValue(_)) => JsonValue::Null,
        Some(Kind::BoolValue(b)) => JsonValue::Bool(*b),
        Some(Kind::IntegerValue(i)) => JsonValue::Number((*i).into()),
        Some(Kind::DoubleValue(f)) => Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Some(Kind::StringValue(s)) => JsonValue::String(s.clone()),
        Some(Kind::ListValue(list)) => {
            JsonValue::Array(list.values.iter().map(qdrant_to_json).collect())
        }
        Some(Kind::StructValue(fields)) => JsonValue::Object(
            fields
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), qdrant_to_json(v)))
                .collect(),
        ),
    }
}

fn payload_to_json(payload: HashMap<String, QdrantValue>) -> Map<String, JsonValue> {
    payload
        .into_iter()
        .map(|(k, v)| {
            let json = qdrant_to_json(&v);
            (k, json)
        })
        .collect()
}

fn point_id_string(point_id: &Option<PointId>) -> String {
    point_id
        .as_ref()
        .map(|id| match &id.point_id_options {
            Some(PointIdOptions::Num(n)) => n.to_string(),
            Some(PointIdOptions::Uuid(u)) => u.clone(),
            None => String::new(),
        })
        .unwrap_or_default()
}
