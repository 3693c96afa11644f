//! # Replica
//!
//! Auto-replies to chat messages in the phone owner's own style.
//!
//! ## Architecture
//!
//! One inbound `(contact, message)` pair flows through:
//! - **Persistent Store** - contacts, conversation history and style exemplars in SQLite
//! - **Retrieval Engine** - top-K exemplars by cosine similarity, with `global` fallback
//! - **Context Assembler** - persona, contact profile, exemplars and recent history
//! - **Reply Orchestrator** - the per-message state machine and per-contact ordering
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use replica::{ChatCompletionsClient, Config, ReplyOrchestrator, ReplyRequest, SqliteStorage};
//!
//! let config = Config::from_env()?;
//! let store = Arc::new(SqliteStorage::new(&config)?);
//! let llm = Arc::new(ChatCompletionsClient::new(&config)?);
//! let orchestrator = ReplyOrchestrator::new(config, store, None, llm)?;
//!
//! let outcome = orchestrator.reply(ReplyRequest::new("c1", "Alice", "hey")).await?;
//! println!("{}", outcome.reply);
//! ```

pub mod api;
pub mod clock;
pub mod config;
pub mod contact;
pub mod context;
pub mod embedding;
pub mod error;
pub mod exemplar;
pub mod ingest;
pub mod llm;
pub mod message;
pub mod pipeline;
pub mod retrieval;
pub mod storage;

pub use config::Config;
pub use contact::{Contact, ContactStats, ContactUpdate};
pub use embedding::{Embedder, FastEmbedder};
pub use error::{Error, ErrorKind, Result};
pub use exemplar::{Exemplar, NewExemplar, GLOBAL_OWNER};
pub use llm::{ChatCompletionsClient, LanguageModel};
pub use message::{Direction, NewTurn, Turn};
pub use pipeline::{FailureReason, PipelineState, ReplyOrchestrator, ReplyOutcome, ReplyRequest};
pub use storage::SqliteStorage;
