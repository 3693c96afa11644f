//! Style exemplars: historical (trigger, reply) pairs used for retrieval

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved owner id for exemplars eligible for every contact.
///
/// This is a wildcard matched in application logic, not a foreign key:
/// there is no contact row called "global".
pub const GLOBAL_OWNER: &str = "global";

/// A stored style exemplar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    pub id: i64,

    /// A contact id, or [`GLOBAL_OWNER`]
    pub owner_id: String,

    /// What the other person said
    pub trigger_text: String,

    /// How the owner replied
    pub reply_text: String,

    #[serde(skip)]
    pub embedding: Vec<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_text: Option<String>,

    /// When the original exchange happened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<DateTime<Utc>>,

    pub relevance_weight: f32,

    pub created_at: DateTime<Utc>,
}

/// An exemplar about to be ingested
#[derive(Debug, Clone, PartialEq)]
pub struct NewExemplar {
    pub owner_id: String,
    pub trigger_text: String,
    pub reply_text: String,
    pub embedding: Vec<f32>,
    pub context_text: Option<String>,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub relevance_weight: f32,
}

impl NewExemplar {
    /// Create an exemplar with default weight and no context
    pub fn new(
        owner_id: impl Into<String>,
        trigger_text: impl Into<String>,
        reply_text: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            trigger_text: trigger_text.into(),
            reply_text: reply_text.into(),
            embedding,
            context_text: None,
            source_timestamp: None,
            relevance_weight: 1.0,
        }
    }

    /// Create an exemplar shared by all contacts
    pub fn global(
        trigger_text: impl Into<String>,
        reply_text: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self::new(GLOBAL_OWNER, trigger_text, reply_text, embedding)
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.relevance_weight = weight;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context_text = Some(context.into());
        self
    }

    pub fn with_source_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.source_timestamp = Some(at);
        self
    }
}

/// Convert an f32 vector to bytes for SQLite BLOB storage
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Convert a SQLite BLOB back to an f32 vector. `None` if the length is not a multiple of 4.
pub fn blob_to_vec(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

/// Cosine similarity, i.e. `1 - cosine_distance`. Zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
