//! Offline ingestion of (trigger, reply) pairs into the exemplar collection.
//!
//! Input files are JSON arrays of `{"trigger", "reply", "context"?, "timestamp"?}`
//! objects. The *trigger* is what gets embedded: retrieval searches by what the
//! contact said to find how the owner answered.

use std::path::Path;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::exemplar::NewExemplar;
use crate::storage::SqliteStorage;

/// Most pairs sampled into the `global` collection
pub const GLOBAL_SAMPLE_SIZE: usize = 200;

const EMBED_BATCH_SIZE: usize = 64;

/// One historical exchange from a chat export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPair {
    pub trigger: String,
    pub reply: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Read pairs from a JSON file, dropping ones with a blank side
pub fn load_pairs(path: impl AsRef<Path>) -> Result<Vec<ChatPair>> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let pairs: Vec<ChatPair> = serde_json::from_str(&raw)?;
    Ok(pairs
        .into_iter()
        .filter(|p| !p.trigger.trim().is_empty() && !p.reply.trim().is_empty())
        .collect())
}

/// Owner id for a chat file: its stem (`chats/alice.json` → `alice`)
pub fn owner_from_path(path: impl AsRef<Path>) -> Result<String> {
    path.as_ref()
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::validation(format!("cannot derive owner from {:?}", path.as_ref())))
}

/// Embed and store pairs for one owner. All pairs land or none do.
pub async fn ingest_pairs(
    store: &SqliteStorage,
    embedder: &dyn Embedder,
    owner_id: &str,
    pairs: &[ChatPair],
) -> Result<usize> {
    if owner_id.trim().is_empty() {
        return Err(Error::validation("owner_id is empty"));
    }
    if pairs.is_empty() {
        return Ok(0);
    }

    let mut exemplars = Vec::with_capacity(pairs.len());
    for chunk in pairs.chunks(EMBED_BATCH_SIZE) {
        let triggers: Vec<String> = chunk.iter().map(|p| p.trigger.clone()).collect();
        let embeddings = embedder.embed_batch(&triggers).await?;
        if embeddings.len() != chunk.len() {
            return Err(Error::embedding(format!(
                "expected {} embeddings, got {}",
                chunk.len(),
                embeddings.len()
            )));
        }

        for (pair, embedding) in chunk.iter().zip(embeddings) {
            let mut exemplar = NewExemplar::new(owner_id, &pair.trigger, &pair.reply, embedding);
            if let Some(context) = pair.context.as_deref().filter(|c| !c.trim().is_empty()) {
                exemplar = exemplar.with_context(context);
            }
            if let Some(at) = pair.timestamp {
                exemplar = exemplar.with_source_timestamp(at);
            }
            exemplars.push(exemplar);
        }
        tracing::debug!(owner_id, embedded = exemplars.len(), total = pairs.len(), "embedded batch");
    }

    let inserted = store
        .run_blocking(move |store| store.insert_exemplars(&exemplars))
        .await?;
    tracing::info!(owner_id, inserted, "exemplars ingested");
    Ok(inserted)
}

/// Random sample of at most `max` pairs for the `global` collection
pub fn sample_global<R: Rng + ?Sized>(mut pairs: Vec<ChatPair>, max: usize, rng: &mut R) -> Vec<ChatPair> {
    pairs.shuffle(rng);
    pairs.truncate(max);
    pairs
}
