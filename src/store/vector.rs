//! Vector Store
//!
//! Semantic recall over six logical collections, backed by fastembed
//! embeddings with JSON file persistence and an in-memory cache. When the
//! embedding model cannot be initialised the store degrades to token-overlap
//! scoring so recall stays deterministic instead of disappearing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The logical collections. Ids are stable per collection: hostname for
/// systems, UUID for issues/decisions/knowledge, relative path for config
/// files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Systems,
    Relationships,
    Issues,
    Decisions,
    ConfigFiles,
    Knowledge,
}

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::Systems,
        Collection::Relationships,
        Collection::Issues,
        Collection::Decisions,
        Collection::ConfigFiles,
        Collection::Knowledge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Systems => "systems",
            Collection::Relationships => "relationships",
            Collection::Issues => "issues",
            Collection::Decisions => "decisions",
            Collection::ConfigFiles => "config_files",
            Collection::Knowledge => "knowledge",
        }
    }
}

/// One stored document with its metadata and (optional) embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub document: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A query result with its relevance in `[0, 1]` (1 − cosine distance).
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: VectorRecord,
    pub relevance: f32,
}

/// Confidence attached to a knowledge item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Operational knowledge distilled from successful actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: String,
    pub topic: String,
    pub body: String,
    pub category: String,
    pub source: String,
    pub confidence: Confidence,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: String,
    pub last_verified_at: String,
    #[serde(default)]
    pub reference_count: u64,
}

pub struct VectorStore {
    dir: PathBuf,
    embedder: Option<Arc<Mutex<TextEmbedding>>>,
    cache: RwLock<HashMap<Collection, Vec<VectorRecord>>>,
}

impl VectorStore {
    /// Open (and on first use create) the store directory. Embedding model
    /// initialisation is best-effort.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let embedder = match TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(false),
        ) {
            Ok(model) => Some(Arc::new(Mutex::new(model))),
            Err(e) => {
                warn!("embedding model unavailable ({}); vector store degrades to token overlap", e);
                None
            }
        };
        Self::open_with_embedder(dir, embedder)
    }

    pub fn open_with_embedder(
        dir: impl AsRef<Path>,
        embedder: Option<Arc<Mutex<TextEmbedding>>>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create vector store directory {:?}", dir))?;

        let mut cache = HashMap::new();
        for collection in Collection::ALL {
            let path = dir.join(format!("{}.json", collection.as_str()));
            let records = if path.exists() {
                let content = std::fs::read_to_string(&path)?;
                serde_json::from_str(&content).unwrap_or_else(|e| {
                    warn!("corrupt collection file {:?} ({}), starting empty", path, e);
                    Vec::new()
                })
            } else {
                Vec::new()
            };
            cache.insert(collection, records);
        }
        info!("vector store opened at {:?} (embedder: {})", dir, embedder.is_some());

        Ok(Self {
            dir,
            embedder,
            cache: RwLock::new(cache),
        })
    }

    fn collection_path(&self, collection: Collection) -> PathBuf {
        self.dir.join(format!("{}.json", collection.as_str()))
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.clone()?;
        let text = text.to_string();
        let result = tokio::task::spawn_blocking(move || {
            embedder
                .lock()
                .unwrap()
                .embed(vec![text], None)
                .map(|mut v| v.remove(0))
        })
        .await
        .ok()?;

        match result {
            Ok(mut embedding) => {
                normalize(&mut embedding);
                Some(embedding)
            }
            Err(e) => {
                debug!("embedding failed: {}", e);
                None
            }
        }
    }

    async fn persist(&self, collection: Collection) -> Result<()> {
        let cache = self.cache.read().await;
        let records = cache.get(&collection).cloned().unwrap_or_default();
        drop(cache);
        let content = serde_json::to_string_pretty(&records)?;
        tokio::fs::write(self.collection_path(collection), content).await?;
        Ok(())
    }

    /// Insert or replace a record by id.
    pub async fn upsert(&self, collection: Collection, mut record: VectorRecord) -> Result<()> {
        if record.embedding.is_none() {
            record.embedding = self.embed(&record.document).await;
        }

        {
            let mut cache = self.cache.write().await;
            let records = cache.entry(collection).or_default();
            records.retain(|r| r.id != record.id);
            records.push(record);
        }
        self.persist(collection).await
    }

    pub async fn get(&self, collection: Collection, id: &str) -> Option<VectorRecord> {
        let cache = self.cache.read().await;
        cache
            .get(&collection)?
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        let removed = {
            let mut cache = self.cache.write().await;
            let records = cache.entry(collection).or_default();
            let before = records.len();
            records.retain(|r| r.id != id);
            records.len() != before
        };
        if removed {
            self.persist(collection).await?;
        }
        Ok(removed)
    }

    pub async fn all(&self, collection: Collection) -> Vec<VectorRecord> {
        let cache = self.cache.read().await;
        cache.get(&collection).cloned().unwrap_or_default()
    }

    /// Semantic query with optional metadata equality filters.
    pub async fn query(
        &self,
        collection: Collection,
        text: &str,
        k: usize,
        filters: &[(&str, &str)],
    ) -> Result<Vec<SearchHit>> {
        let query_embedding = self.embed(text).await;
        let cache = self.cache.read().await;
        let records = cache.get(&collection).cloned().unwrap_or_default();
        drop(cache);

        let mut hits: Vec<SearchHit> = records
            .into_iter()
            .filter(|r| {
                filters.iter().all(|(key, value)| {
                    r.metadata.get(*key).and_then(Value::as_str) == Some(*value)
                })
            })
            .map(|record| {
                let relevance = match (&query_embedding, &record.embedding) {
                    (Some(query), Some(doc)) => dot_product(query, doc).clamp(0.0, 1.0),
                    _ => token_overlap(text, &record.document),
                };
                SearchHit { record, relevance }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    // ---- knowledge helpers ----

    pub async fn store_knowledge(
        &self,
        topic: &str,
        body: &str,
        category: &str,
        source: &str,
        confidence: Confidence,
        tags: Vec<String>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let item = KnowledgeItem {
            id: id.clone(),
            topic: topic.to_string(),
            body: body.to_string(),
            category: category.to_string(),
            source: source.to_string(),
            confidence,
            tags,
            created_at: now.clone(),
            last_verified_at: now,
            reference_count: 0,
        };

        self.upsert(
            Collection::Knowledge,
            VectorRecord {
                id: id.clone(),
                document: body.to_string(),
                metadata: serde_json::to_value(&item)?,
                embedding: None,
            },
        )
        .await?;
        info!("stored knowledge item: {}", topic);
        Ok(id)
    }

    /// Semantic knowledge lookup; each returned item's reference count is
    /// incremented and persisted.
    pub async fn query_knowledge(&self, query: &str, k: usize) -> Result<Vec<KnowledgeItem>> {
        let hits = self.query(Collection::Knowledge, query, k, &[]).await?;
        let mut items = Vec::new();

        for hit in &hits {
            let Ok(mut item) =
                serde_json::from_value::<KnowledgeItem>(hit.record.metadata.clone())
            else {
                continue;
            };
            item.reference_count += 1;

            let mut record = hit.record.clone();
            record.metadata = serde_json::to_value(&item)?;
            {
                let mut cache = self.cache.write().await;
                let records = cache.entry(Collection::Knowledge).or_default();
                if let Some(existing) = records.iter_mut().find(|r| r.id == record.id) {
                    *existing = record;
                }
            }
            items.push(item);
        }

        if !items.is_empty() {
            self.persist(Collection::Knowledge).await?;
        }
        Ok(items)
    }

    /// Advance a knowledge item's verification timestamp.
    pub async fn verify_knowledge(&self, id: &str) -> Result<bool> {
        let Some(mut record) = self.get(Collection::Knowledge, id).await else {
            return Ok(false);
        };
        let Ok(mut item) = serde_json::from_value::<KnowledgeItem>(record.metadata.clone()) else {
            return Ok(false);
        };
        item.last_verified_at = Utc::now().to_rfc3339();
        record.metadata = serde_json::to_value(&item)?;
        self.upsert(Collection::Knowledge, record).await?;
        Ok(true)
    }

    /// Render the top knowledge matches for prompt injection.
    pub async fn knowledge_context(&self, query: &str, k: usize) -> String {
        let Ok(items) = self.query_knowledge(query, k).await else {
            return String::new();
        };
        if items.is_empty() {
            return String::new();
        }

        let mut text = String::from("\n\nRELEVANT KNOWLEDGE FROM EXPERIENCE:\n");
        for item in items {
            text.push_str(&format!("\n- {} ({}):\n", item.topic, item.category));
            text.push_str(&format!("  {}\n", item.body));
            text.push_str(&format!(
                "  [Confidence: {:?}, Referenced: {} times]\n",
                item.confidence, item.reference_count
            ));
        }
        text
    }

    /// Record an analysis/decision for later recall.
    pub async fn record_decision(&self, summary: &str, detail: Value) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.upsert(
            Collection::Decisions,
            VectorRecord {
                id: id.clone(),
                document: summary.to_string(),
                metadata: json!({
                    "detail": detail,
                    "recorded_at": Utc::now().to_rfc3339(),
                }),
                embedding: None,
            },
        )
        .await?;
        Ok(id)
    }
}

fn normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vec {
            *x /= norm;
        }
    }
}

fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Deterministic fallback scoring when no embedder is available: fraction
/// of query tokens present in the document.
fn token_overlap(query: &str, document: &str) -> f32 {
    let query_tokens: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();
    if query_tokens.is_empty() {
        return 0.0;
    }
    let document = document.to_lowercase();
    let doc_tokens: std::collections::HashSet<&str> = document.split_whitespace().collect();
    let matched = query_tokens
        .iter()
        .filter(|t| doc_tokens.contains(t.as_str()))
        .count();
    matched as f32 / query_tokens.len() as f32
}
