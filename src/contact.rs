//! Contact records: one per conversation partner

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A conversation partner, keyed by the stable id the messaging app supplies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// Stable external identifier, immutable once created
    pub contact_id: String,

    /// Last display name seen for this contact
    pub display_name: String,

    /// Free-form relationship tag ("friend", "work", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship_type: Option<String>,

    /// Free-form style tag ("chill", "formal", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_style: Option<String>,

    /// Whether replies are synthesized for this contact
    pub bot_enabled: bool,

    /// Highest-priority prompt instruction for this contact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,

    pub first_seen_at: DateTime<Utc>,

    pub last_seen_at: DateTime<Utc>,

    /// Number of history turns recorded for this contact
    pub total_messages: u64,
}

/// Administrative edit of a contact's profile. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactUpdate {
    #[serde(default)]
    pub relationship_type: Option<String>,
    #[serde(default)]
    pub conversation_style: Option<String>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub bot_enabled: Option<bool>,
}

impl ContactUpdate {
    pub fn is_empty(&self) -> bool {
        self.relationship_type.is_none()
            && self.conversation_style.is_none()
            && self.custom_instructions.is_none()
            && self.bot_enabled.is_none()
    }
}

/// Aggregate diagnostics for one contact
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactStats {
    pub contact_id: String,
    pub total_turns: u64,
    pub inbound_turns: u64,
    pub outbound_turns: u64,
    /// Exemplars owned by this contact (global ones excluded)
    pub exemplar_count: u64,
    /// Mean confidence over synthesized turns, if any
    pub mean_confidence: Option<f64>,
    pub last_interaction_at: Option<DateTime<Utc>>,
}
