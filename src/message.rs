//! Message types for conversation history

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Direction of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sent by the contact
    Inbound,
    /// Sent to the contact
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            _ => Err(Error::storage(format!("Unknown direction: {}", s))),
        }
    }
}

/// Kind of payload a turn carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Media,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Text => write!(f, "text"),
            MessageKind::Media => write!(f, "media"),
        }
    }
}

impl FromStr for MessageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "media" => Ok(MessageKind::Media),
            _ => Err(Error::storage(format!("Unknown message kind: {}", s))),
        }
    }
}

/// Role of a prompt message sent to the language model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

impl From<Direction> for Role {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Inbound => Role::User,
            Direction::Outbound => Role::Assistant,
        }
    }
}

/// Which exemplars influenced a synthesized reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub exemplars: Vec<ProvenanceEntry>,
}

/// One exemplar that was placed in the prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub exemplar_id: i64,
    pub similarity: f32,
}

/// A single persisted message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Store-assigned sequence number; breaks `created_at` ties
    pub id: i64,

    /// Contact this turn belongs to
    pub contact_id: String,

    /// Display name at the time of the turn
    pub display_name: String,

    pub direction: Direction,

    pub text: String,

    pub message_kind: MessageKind,

    /// True only for outbound turns produced by the pipeline
    pub is_synthesized: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,

    pub created_at: DateTime<Utc>,
}

/// A turn about to be appended; the store assigns id and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct NewTurn {
    pub contact_id: String,
    pub display_name: String,
    pub direction: Direction,
    pub text: String,
    pub message_kind: MessageKind,
    pub is_synthesized: bool,
    pub confidence: Option<f32>,
    pub provenance: Option<Provenance>,
}

impl NewTurn {
    /// A message received from the contact
    pub fn inbound(
        contact_id: impl Into<String>,
        display_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            contact_id: contact_id.into(),
            display_name: display_name.into(),
            direction: Direction::Inbound,
            text: text.into(),
            message_kind: MessageKind::Text,
            is_synthesized: false,
            confidence: None,
            provenance: None,
        }
    }

    /// A reply produced by the pipeline
    pub fn synthesized(
        contact_id: impl Into<String>,
        display_name: impl Into<String>,
        text: impl Into<String>,
        confidence: f32,
        provenance: Provenance,
    ) -> Self {
        Self {
            contact_id: contact_id.into(),
            display_name: display_name.into(),
            direction: Direction::Outbound,
            text: text.into(),
            message_kind: MessageKind::Text,
            is_synthesized: true,
            confidence: Some(confidence),
            provenance: Some(provenance),
        }
    }

    /// Set the message kind
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.message_kind = kind;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_round_trips_through_its_column_text() {
        for direction in [Direction::Inbound, Direction::Outbound] {
            assert_eq!(direction.to_string().parse::<Direction>().unwrap(), direction);
        }
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn synthesized_turn_carries_confidence() {
        let turn = NewTurn::synthesized("c1", "Alice", "yo", 0.8, Provenance::default());
        assert_eq!(turn.direction, Direction::Outbound);
        assert!(turn.is_synthesized);
        assert_eq!(turn.confidence, Some(0.8));
    }

    #[test]
    fn inbound_turn_is_never_synthesized() {
        let turn = NewTurn::inbound("c1", "Alice", "hey").with_kind(MessageKind::Media);
        assert!(!turn.is_synthesized);
        assert_eq!(turn.confidence, None);
        assert_eq!(turn.message_kind, MessageKind::Media);
    }

    #[test]
    fn directions_map_to_prompt_roles() {
        assert_eq!(Role::from(Direction::Inbound), Role::User);
        assert_eq!(Role::from(Direction::Outbound), Role::Assistant);
    }
}
