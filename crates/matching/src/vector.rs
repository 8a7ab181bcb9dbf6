use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::RwLock;

use crate::MatchError;

/// Text-embedding backend with a fixed output dimension.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MatchError>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// A nearest-neighbour hit from the index.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternHit {
    pub pattern_id: String,
    pub boost: Decimal,
    pub similarity: f32,
}

struct IndexEntry {
    pattern_id: String,
    boost: Decimal,
    vector: Vec<f32>,
}

/// In-process cosine index over the active patterns' embeddings.
///
/// Writers serialize on the lock; reads take a shared guard and scan.
/// The persistent copy lives in storage; this index is rebuilt from it at
/// startup.
pub struct PatternIndex {
    min_similarity: f32,
    entries: RwLock<Vec<IndexEntry>>,
}

impl PatternIndex {
    pub fn new(min_similarity: f32) -> Self {
        Self {
            min_similarity,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts or replaces the vector for a pattern.
    pub fn insert(&self, pattern_id: &str, boost: Decimal, vector: Vec<f32>) {
        let mut entries = self.entries.write().unwrap();
        match entries.iter_mut().find(|e| e.pattern_id == pattern_id) {
            Some(entry) => {
                entry.boost = boost;
                entry.vector = vector;
            }
            None => entries.push(IndexEntry {
                pattern_id: pattern_id.to_string(),
                boost,
                vector,
            }),
        }
    }

    /// Removes a deactivated pattern from the search set.
    pub fn remove(&self, pattern_id: &str) {
        self.entries
            .write()
            .unwrap()
            .retain(|e| e.pattern_id != pattern_id);
    }

    pub fn set_boost(&self, pattern_id: &str, boost: Decimal) {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.iter_mut().find(|e| e.pattern_id == pattern_id) {
            entry.boost = boost;
        }
    }

    /// The `k` most similar patterns, best first. No similarity floor is
    /// applied here; callers decide what qualifies.
    pub fn nearest(&self, query: &[f32], k: usize) -> Vec<PatternHit> {
        let entries = self.entries.read().unwrap();
        let mut hits: Vec<PatternHit> = entries
            .iter()
            .map(|e| PatternHit {
                pattern_id: e.pattern_id.clone(),
                boost: e.boost,
                similarity: cosine_similarity(query, &e.vector),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        });
        hits.truncate(k);
        hits
    }

    /// The qualifying hit carrying the largest boost, if any hit clears the
    /// similarity floor.
    pub fn boost_for(&self, query: &[f32]) -> Option<PatternHit> {
        self.nearest(query, usize::MAX)
            .into_iter()
            .filter(|hit| hit.similarity >= self.min_similarity)
            .max_by(|a, b| {
                a.boost.cmp(&b.boost).then_with(|| {
                    a.similarity
                        .partial_cmp(&b.similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
            })
    }
}

// ── HTTP embedder ─────────────────────────────────────────────────────────────

/// Embedder backed by an OpenAI-style embeddings endpoint.
pub struct HttpEmbedder {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(api_base: &str, api_key: &str, model: &str, dimension: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dimension,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MatchError> {
        let response = self
            .http
            .post(format!("{}/v1/embeddings", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({"model": self.model, "input": text}))
            .send()
            .await
            .map_err(|e| MatchError::Embedding(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MatchError::Embedding(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| MatchError::Embedding(e.to_string()))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| MatchError::Embedding("empty embedding response".into()))
    }
}

// ── Mock embedder ─────────────────────────────────────────────────────────────

/// Deterministic hashed bag-of-words embedding. Identical texts embed
/// identically, overlapping texts land close, and no network is involved.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MatchError> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.split_whitespace() {
            let hash = fnv1a(token);
            let idx = (hash % self.dimension as u64) as usize;
            let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
            vector[idx] += sign;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::normalize;

    #[tokio::test]
    async fn mock_embedder_is_deterministic() {
        let embedder = MockEmbedder::new(64);
        let a = embedder.embed("acme holdings invoice 7788").await.unwrap();
        let b = embedder.embed("acme holdings invoice 7788").await.unwrap();
        assert_eq!(a, b);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn embedding_normalized_text_is_stable_under_renormalization() {
        let embedder = MockEmbedder::new(64);
        let raw = "  ACME, Holdings! invoice #7788 ";
        let once = embedder.embed(&normalize(raw)).await.unwrap();
        let twice = embedder.embed(&normalize(&normalize(raw))).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn unrelated_texts_are_distant() {
        let embedder = MockEmbedder::new(256);
        let a = embedder.embed("acme holdings invoice").await.unwrap();
        let b = embedder.embed("salary payroll march").await.unwrap();
        assert!(cosine_similarity(&a, &b) < 0.5);
    }

    #[test]
    fn index_returns_max_boost_among_qualifying_hits() {
        let index = PatternIndex::new(0.85);
        index.insert("p-low", Decimal::new(10, 2), vec![1.0, 0.0, 0.0]);
        index.insert("p-high", Decimal::new(20, 2), vec![0.99, 0.1, 0.0]);
        index.insert("p-far", Decimal::new(25, 2), vec![0.0, 0.0, 1.0]);

        let hit = index.boost_for(&[1.0, 0.0, 0.0]).unwrap();
        assert_eq!(hit.pattern_id, "p-high");
        assert_eq!(hit.boost, Decimal::new(20, 2));
    }

    #[test]
    fn below_floor_yields_no_boost() {
        let index = PatternIndex::new(0.85);
        index.insert("p1", Decimal::new(10, 2), vec![0.0, 1.0]);
        assert!(index.boost_for(&[1.0, 0.0]).is_none());
    }

    #[test]
    fn remove_drops_pattern_from_search() {
        let index = PatternIndex::new(0.85);
        index.insert("p1", Decimal::new(10, 2), vec![1.0, 0.0]);
        assert!(index.boost_for(&[1.0, 0.0]).is_some());
        index.remove("p1");
        assert!(index.boost_for(&[1.0, 0.0]).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn insert_replaces_existing_vector() {
        let index = PatternIndex::new(0.5);
        index.insert("p1", Decimal::new(10, 2), vec![1.0, 0.0]);
        index.insert("p1", Decimal::new(15, 2), vec![0.0, 1.0]);
        assert_eq!(index.len(), 1);
        let hit = index.boost_for(&[0.0, 1.0]).unwrap();
        assert_eq!(hit.boost, Decimal::new(15, 2));
    }

    #[test]
    fn nearest_orders_by_similarity() {
        let index = PatternIndex::new(0.0);
        index.insert("a", Decimal::new(10, 2), vec![1.0, 0.0]);
        index.insert("b", Decimal::new(10, 2), vec![0.7, 0.7]);
        index.insert("c", Decimal::new(10, 2), vec![0.0, 1.0]);

        let hits = index.nearest(&[1.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].pattern_id, "a");
        assert_eq!(hits[1].pattern_id, "b");
    }
}
