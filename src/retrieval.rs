//! Style exemplar retrieval for few-shot prompting

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::exemplar::{cosine_similarity, Exemplar};
use crate::message::{Provenance, ProvenanceEntry};
use crate::storage::SqliteStorage;

/// An exemplar that was retrieved with its similarity to the query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedExemplar {
    pub id: i64,
    pub owner_id: String,
    pub trigger_text: String,
    pub reply_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_text: Option<String>,
    pub similarity: f32,
    pub relevance_weight: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<DateTime<Utc>>,
}

/// Record which exemplars fed a reply
pub fn provenance_of(exemplars: &[RetrievedExemplar]) -> Provenance {
    Provenance {
        exemplars: exemplars
            .iter()
            .map(|e| ProvenanceEntry {
                exemplar_id: e.id,
                similarity: e.similarity,
            })
            .collect(),
    }
}

/// Retrieval engine over the exemplar collection.
///
/// Candidates are the contact's own exemplars plus every `global` one whose
/// `relevance_weight` is strictly above the threshold. Scoring is exact cosine
/// similarity over all candidates.
pub struct RetrievalEngine {
    store: Arc<SqliteStorage>,
    min_relevance_weight: f32,
}

impl RetrievalEngine {
    /// Create a new retrieval engine
    pub fn new(store: Arc<SqliteStorage>, config: &Config) -> Self {
        Self {
            store,
            min_relevance_weight: config.min_relevance_weight,
        }
    }

    /// The top `k` exemplars for a contact, best first. Fewer than `k` candidates
    /// means all of them; none means an empty result.
    ///
    /// The candidate scan and scoring run on the blocking pool.
    pub async fn retrieve(
        &self,
        contact_id: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<RetrievedExemplar>> {
        if query_embedding.len() != self.store.dimensions() {
            return Err(Error::data_integrity(format!(
                "Query embedding dimension mismatch: expected {}, got {}",
                self.store.dimensions(),
                query_embedding.len()
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let contact_id = contact_id.to_string();
        let query = query_embedding.to_vec();
        let min_weight = self.min_relevance_weight;

        self.store
            .run_blocking(move |store| {
                let candidates = store.exemplar_candidates(&contact_id, min_weight)?;
                tracing::debug!(
                    contact_id = %contact_id,
                    candidates = candidates.len(),
                    "scoring exemplar candidates"
                );
                Ok(rank(candidates, &query, k))
            })
            .await
    }
}

/// Score and order candidates: similarity desc, then weight desc, then newer source first
pub fn rank(candidates: Vec<Exemplar>, query_embedding: &[f32], k: usize) -> Vec<RetrievedExemplar> {
    let mut scored: Vec<RetrievedExemplar> = candidates
        .into_iter()
        .filter(|e| e.embedding.len() == query_embedding.len())
        .map(|e| {
            let similarity = cosine_similarity(&e.embedding, query_embedding);
            RetrievedExemplar {
                id: e.id,
                owner_id: e.owner_id,
                trigger_text: e.trigger_text,
                reply_text: e.reply_text,
                context_text: e.context_text,
                similarity: if similarity.is_finite() { similarity } else { 0.0 },
                relevance_weight: e.relevance_weight,
                source_timestamp: e.source_timestamp,
            }
        })
        .collect();

    scored.sort_by(compare_ranked);
    scored.truncate(k);
    scored
}

fn compare_ranked(a: &RetrievedExemplar, b: &RetrievedExemplar) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| b.relevance_weight.total_cmp(&a.relevance_weight))
        // Some(newer) > Some(older) > None
        .then_with(|| b.source_timestamp.cmp(&a.source_timestamp))
        .then_with(|| a.id.cmp(&b.id))
}
