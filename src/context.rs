//! Prompt assembly from persona, contact profile, exemplars and recent history

use serde::Serialize;

use crate::config::Config;
use crate::contact::Contact;
use crate::embedding::TokenCounter;
use crate::error::Result;
use crate::message::{Role, Turn};
use crate::retrieval::RetrievedExemplar;

/// One message of a chat-style prompt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A fully assembled prompt, ready for the language model
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub messages: Vec<PromptMessage>,

    /// The exemplars shown in the prompt, in rank order
    pub exemplars: Vec<RetrievedExemplar>,

    /// Number of history turns that fit the budget
    pub history_turns: usize,
}

impl Prompt {
    /// The inbound message being answered
    pub fn current_message(&self) -> Option<&str> {
        self.messages.last().map(|m| m.content.as_str())
    }
}

/// Token budget for the history section
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub limit: u32,
    pub used: u32,
}

impl ContextBudget {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Reserve tokens if they fit; leaves the budget untouched otherwise
    pub fn try_add(&mut self, tokens: u32) -> bool {
        match self.used.checked_add(tokens) {
            Some(total) if total <= self.limit => {
                self.used = total;
                true
            }
            _ => false,
        }
    }
}

/// Builds prompts for the reply pipeline
pub struct ContextAssembler {
    persona: String,
    counter: TokenCounter,
    history_token_budget: u32,
}

impl ContextAssembler {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            persona: config.persona.clone(),
            counter: TokenCounter::for_chat()?,
            history_token_budget: config.history_token_budget,
        })
    }

    /// Override the history budget
    pub fn with_history_budget(mut self, tokens: u32) -> Self {
        self.history_token_budget = tokens;
        self
    }

    /// Tokens a turn costs against the history budget
    pub fn turn_cost(&self, turn: &Turn) -> u32 {
        self.counter.count(&turn.text)
    }

    /// Compose the prompt.
    ///
    /// `recent_turns` is newest first, as the store returns it, and must not
    /// contain the message being answered. `message` is never truncated.
    pub fn assemble(
        &self,
        contact: &Contact,
        recent_turns: &[Turn],
        exemplars: &[RetrievedExemplar],
        message: &str,
    ) -> Prompt {
        let mut messages = Vec::new();

        messages.push(PromptMessage::new(Role::System, self.persona_block(contact)));

        if let Some(instructions) = contact
            .custom_instructions
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            messages.push(PromptMessage::new(
                Role::System,
                format!(
                    "HIGHEST PRIORITY for {}: {}\nThis overrides any rule above.",
                    contact.display_name, instructions
                ),
            ));
        }

        if !exemplars.is_empty() {
            messages.push(PromptMessage::new(Role::System, examples_block(exemplars)));
        }

        // Keep the newest turns that fit, then put them back in chronological order
        let mut budget = ContextBudget::new(self.history_token_budget);
        let mut kept: Vec<&Turn> = Vec::new();
        for turn in recent_turns {
            if !budget.try_add(self.turn_cost(turn)) {
                break;
            }
            kept.push(turn);
        }
        kept.reverse();

        let history_turns = kept.len();
        messages.extend(
            kept.into_iter()
                .map(|turn| PromptMessage::new(Role::from(turn.direction), turn.text.clone())),
        );

        messages.push(PromptMessage::new(Role::User, message));

        Prompt {
            messages,
            exemplars: exemplars.to_vec(),
            history_turns,
        }
    }

    fn persona_block(&self, contact: &Contact) -> String {
        let mut block = self.persona.trim().to_string();

        let mut profile = vec![format!("You are talking to {}.", contact.display_name)];
        if let Some(relationship) = contact.relationship_type.as_deref() {
            profile.push(format!("Relationship: {}.", relationship));
            if let Some(hint) = relationship_hint(relationship) {
                profile.push(hint.to_string());
            }
        }
        if let Some(style) = contact.conversation_style.as_deref() {
            profile.push(format!("Usual conversation style with them: {}.", style));
        }

        block.push_str("\n\n");
        block.push_str(&profile.join(" "));
        block
    }
}

fn relationship_hint(relationship: &str) -> Option<&'static str> {
    match relationship.to_lowercase().as_str() {
        "romantic" | "partner" => Some("Be warm and affectionate."),
        "work" | "colleague" => Some("Be professional but friendly."),
        "friend" => Some("Be casual; banter is fine."),
        "family" => Some("Be warm and respectful."),
        _ => None,
    }
}

fn examples_block(exemplars: &[RetrievedExemplar]) -> String {
    let mut text = String::from(
        "Here are examples of how you've replied to similar messages before. \
         Match this EXACT style:\n",
    );
    for (i, exemplar) in exemplars.iter().enumerate() {
        text.push_str(&format!("\nExample {}:\n", i + 1));
        if let Some(context) = exemplar.context_text.as_deref() {
            text.push_str(&format!("  Context: {}\n", context));
        }
        text.push_str(&format!("  They said: {}\n", exemplar.trigger_text));
        text.push_str(&format!("  You replied: {}\n", exemplar.reply_text));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Direction, MessageKind};
    use chrono::{TimeZone, Utc};

    fn contact() -> Contact {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Contact {
            contact_id: "c1".into(),
            display_name: "Alice".into(),
            relationship_type: None,
            conversation_style: None,
            bot_enabled: true,
            custom_instructions: None,
            first_seen_at: at,
            last_seen_at: at,
            total_messages: 0,
        }
    }

    fn turn(id: i64, direction: Direction, text: &str) -> Turn {
        Turn {
            id,
            contact_id: "c1".into(),
            display_name: "Alice".into(),
            direction,
            text: text.into(),
            message_kind: MessageKind::Text,
            is_synthesized: false,
            confidence: None,
            provenance: None,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, id as u32).unwrap(),
        }
    }

    fn exemplar(id: i64, trigger: &str, reply: &str, similarity: f32) -> RetrievedExemplar {
        RetrievedExemplar {
            id,
            owner_id: "global".into(),
            trigger_text: trigger.into(),
            reply_text: reply.into(),
            context_text: None,
            similarity,
            relevance_weight: 1.0,
            source_timestamp: None,
        }
    }

    fn assembler() -> ContextAssembler {
        ContextAssembler::new(&Config::default()).unwrap()
    }

    #[test]
    fn history_is_oldest_first_and_message_is_last() {
        // newest first, as the store returns it
        let turns = vec![
            turn(3, Direction::Inbound, "third"),
            turn(2, Direction::Outbound, "second"),
            turn(1, Direction::Inbound, "first"),
        ];
        let prompt = assembler().assemble(&contact(), &turns, &[], "now");

        let tail: Vec<_> = prompt.messages[1..]
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            tail,
            vec![
                (Role::User, "first"),
                (Role::Assistant, "second"),
                (Role::User, "third"),
                (Role::User, "now"),
            ]
        );
        assert_eq!(prompt.history_turns, 3);
        assert_eq!(prompt.current_message(), Some("now"));
    }

    #[test]
    fn over_budget_drops_oldest_turns_first() {
        let turns = vec![
            turn(3, Direction::Inbound, "newest message here"),
            turn(2, Direction::Outbound, "middle message here"),
            turn(1, Direction::Inbound, "oldest message here"),
        ];
        let base = assembler();
        let budget = base.turn_cost(&turns[0]) + base.turn_cost(&turns[1]);
        let prompt = base
            .with_history_budget(budget)
            .assemble(&contact(), &turns, &[], "now");

        assert_eq!(prompt.history_turns, 2);
        let contents: Vec<_> = prompt.messages.iter().map(|m| m.content.as_str()).collect();
        assert!(!contents.contains(&"oldest message here"));
        assert!(contents.contains(&"middle message here"));
    }

    #[test]
    fn zero_budget_never_truncates_the_message() {
        let long = "word ".repeat(500);
        let prompt = assembler()
            .with_history_budget(0)
            .assemble(&contact(), &[turn(1, Direction::Inbound, "old")], &[], &long);
        assert_eq!(prompt.history_turns, 0);
        assert_eq!(prompt.current_message(), Some(long.as_str()));
    }

    #[test]
    fn custom_instructions_sit_between_persona_and_examples() {
        let mut c = contact();
        c.custom_instructions = Some("never mention work".into());
        let exemplars = vec![exemplar(1, "hey", "yo", 0.9)];
        let prompt = assembler().assemble(&c, &[], &exemplars, "hey");

        assert!(prompt.messages[0].content.contains("Alice"));
        assert!(prompt.messages[1].content.contains("never mention work"));
        assert!(prompt.messages[2].content.contains("You replied: yo"));
        assert_eq!(prompt.messages.len(), 4);
    }

    #[test]
    fn blank_custom_instructions_are_skipped() {
        let mut c = contact();
        c.custom_instructions = Some("   ".into());
        let prompt = assembler().assemble(&c, &[], &[], "hey");
        assert_eq!(prompt.messages.len(), 2);
    }

    #[test]
    fn exemplars_keep_rank_order() {
        let exemplars = vec![
            exemplar(1, "best", "a", 0.95),
            exemplar(2, "second", "b", 0.80),
        ];
        let prompt = assembler().assemble(&contact(), &[], &exemplars, "hey");
        let block = &prompt.messages[1].content;
        let best = block.find("They said: best").unwrap();
        let second = block.find("They said: second").unwrap();
        assert!(best < second);
        assert_eq!(prompt.exemplars, exemplars);
    }

    #[test]
    fn relationship_adds_tone_hint() {
        let mut c = contact();
        c.relationship_type = Some("work".into());
        c.conversation_style = Some("brief".into());
        let prompt = assembler().assemble(&c, &[], &[], "hey");
        let persona = &prompt.messages[0].content;
        assert!(persona.contains("Relationship: work."));
        assert!(persona.contains("Be professional but friendly."));
        assert!(persona.contains("brief"));
    }

    #[test]
    fn budget_refuses_overflow() {
        let mut budget = ContextBudget::new(10);
        assert!(budget.try_add(6));
        assert!(!budget.try_add(5));
        assert_eq!(budget.used, 6);
    }
}
