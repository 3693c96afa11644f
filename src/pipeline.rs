//! Reply orchestration.
//!
//! [`ReplyOrchestrator`] turns one inbound `(contact, message)` pair into one
//! reply. Each message walks the states
//! `RECEIVED → CONTACT_RESOLVED → RETRIEVED → SYNTHESIZED → PERSISTED → DONE`,
//! or ends in `FAILED`. The inbound turn is written before any synthesis is
//! attempted and is never rolled back.
//!
//! Messages from one contact are serialized through a FIFO per-contact lock;
//! different contacts run in parallel, bounded by a worker semaphore.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::contact::Contact;
use crate::context::{ContextAssembler, Prompt};
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::llm::{clean_reply, LanguageModel};
use crate::message::{NewTurn, Turn};
use crate::retrieval::{provenance_of, RetrievalEngine, RetrievedExemplar};
use crate::storage::SqliteStorage;

/// Number of top exemplars averaged into the confidence score
const CONFIDENCE_TOP_N: usize = 3;

/// Characters of a message body that may appear in logs
const LOG_PREVIEW_CHARS: usize = 50;

/// An inbound message to answer
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyRequest {
    pub contact_id: String,
    pub contact_name: String,
    pub message: String,
}

impl ReplyRequest {
    pub fn new(
        contact_id: impl Into<String>,
        contact_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            contact_id: contact_id.into(),
            contact_name: contact_name.into(),
            message: message.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.contact_id.trim().is_empty() {
            return Err(Error::validation("contact_id is empty"));
        }
        if self.contact_name.trim().is_empty() {
            return Err(Error::validation("contact_name is empty"));
        }
        if self.message.trim().is_empty() {
            return Err(Error::validation("message is empty"));
        }
        Ok(())
    }
}

/// Pipeline states for one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Received,
    ContactResolved,
    Retrieved,
    Synthesized,
    Persisted,
    Done,
    Failed,
}

/// Why a reply came back empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The contact has the bot switched off; the inbound turn was still recorded
    BotDisabled,
    /// The contact or inbound turn could not be written
    StoreUnavailable,
    /// The language model failed after retries
    GenerationFailed,
    /// The language model answered with nothing usable
    EmptyGeneration,
    /// The reply was generated but could not be persisted
    PersistFailed,
    /// The whole pipeline exceeded its wall-clock bound
    Timeout,
    /// The orchestrator no longer accepts work
    ShuttingDown,
}

/// Result of one pipeline run. An empty `reply` always comes with a `reason`.
#[derive(Debug, Clone, Serialize)]
pub struct ReplyOutcome {
    pub reply: String,
    pub confidence: f32,
    pub exemplars_used: usize,
    pub latency_ms: u64,
    pub reason: Option<FailureReason>,

    #[serde(skip)]
    pub state: PipelineState,

    #[serde(skip)]
    pub inbound_turn_id: Option<i64>,

    #[serde(skip)]
    pub outbound_turn_id: Option<i64>,
}

impl ReplyOutcome {
    fn empty(state: PipelineState, reason: FailureReason, inbound_turn_id: Option<i64>) -> Self {
        Self {
            reply: String::new(),
            confidence: 0.0,
            exemplars_used: 0,
            latency_ms: 0,
            reason: Some(reason),
            state,
            inbound_turn_id,
            outbound_turn_id: None,
        }
    }

    fn failed(reason: FailureReason, inbound_turn_id: Option<i64>) -> Self {
        Self::empty(PipelineState::Failed, reason, inbound_turn_id)
    }

    /// True if a non-empty reply was produced and persisted
    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Done && self.reason.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

/// Service health as seen by the orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub rag_enabled: bool,
}

/// FIFO locks keyed by contact id. Entries are removed once nobody holds or
/// waits on them.
#[derive(Default)]
struct ContactLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl ContactLocks {
    async fn acquire(&self, contact_id: &str) -> ContactGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(contact_id.to_string()).or_default().clone()
        };

        let guard = lock.lock_owned().await;
        ContactGuard {
            contact_id: contact_id.to_string(),
            guard: Some(guard),
            locks: self.inner.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

struct ContactGuard {
    contact_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl Drop for ContactGuard {
    fn drop(&mut self) {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        let idle = map
            .get(&self.contact_id)
            .map(|lock| Arc::strong_count(lock) == 1)
            .unwrap_or(false);
        if idle {
            map.remove(&self.contact_id);
        }
    }
}

/// The reply pipeline
pub struct ReplyOrchestrator {
    config: Config,
    store: Arc<SqliteStorage>,
    retrieval: RetrievalEngine,
    assembler: ContextAssembler,
    embedder: Option<Arc<dyn Embedder>>,
    llm: Arc<dyn LanguageModel>,
    workers: Semaphore,
    locks: ContactLocks,
}

impl ReplyOrchestrator {
    /// Build the pipeline. `embedder` may be `None` to run without retrieval.
    pub fn new(
        config: Config,
        store: Arc<SqliteStorage>,
        embedder: Option<Arc<dyn Embedder>>,
        llm: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        config.validate()?;

        if let Some(embedder) = &embedder {
            if embedder.dimensions() != store.dimensions() {
                return Err(Error::config(format!(
                    "embedder produces {} dimensions but the store expects {}",
                    embedder.dimensions(),
                    store.dimensions()
                )));
            }
        }

        Ok(Self {
            retrieval: RetrievalEngine::new(store.clone(), &config),
            assembler: ContextAssembler::new(&config)?,
            workers: Semaphore::new(config.max_concurrent_replies),
            locks: ContactLocks::default(),
            config,
            store,
            embedder,
            llm,
        })
    }

    pub fn store(&self) -> &Arc<SqliteStorage> {
        &self.store
    }

    /// Whether exemplar retrieval runs for each message
    pub fn rag_active(&self) -> bool {
        self.config.rag_enabled && self.embedder.is_some()
    }

    /// Stop accepting new work. Requests already holding a worker finish.
    pub fn shutdown(&self) {
        self.workers.close();
    }

    /// Reachability of the store
    pub async fn health(&self) -> HealthReport {
        let status = match self.store.run_blocking(|store| store.ping()).await {
            Ok(()) => HealthStatus::Ok,
            Err(e) => {
                warn!(error = %e, "store health check failed");
                HealthStatus::Degraded
            }
        };
        HealthReport {
            status,
            rag_enabled: self.rag_active(),
        }
    }

    /// Answer one inbound message.
    ///
    /// Only input validation surfaces as `Err`, and it happens before any
    /// write. Every other failure comes back as an empty reply with a reason.
    pub async fn reply(&self, request: ReplyRequest) -> Result<ReplyOutcome> {
        let started = Instant::now();
        request.validate()?;

        let request_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "reply",
            %request_id,
            contact_id = %request.contact_id
        );

        // Set once the inbound turn is written, so a timeout can still report it
        let inbound_turn_id = OnceLock::new();

        let mut outcome = async {
            match tokio::time::timeout(
                self.config.pipeline_timeout,
                self.run(&request, &inbound_turn_id),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(
                        timeout_ms = self.config.pipeline_timeout.as_millis() as u64,
                        "pipeline timed out"
                    );
                    ReplyOutcome::failed(FailureReason::Timeout, inbound_turn_id.get().copied())
                }
            }
        }
        .instrument(span)
        .await;

        outcome.latency_ms = started.elapsed().as_millis() as u64;
        Ok(outcome)
    }

    async fn run(&self, request: &ReplyRequest, inbound_turn_id: &OnceLock<i64>) -> ReplyOutcome {
        // Contact lock first, then a worker, so queued messages for a busy
        // contact do not hold workers other contacts could use
        let _contact_guard = self.locks.acquire(&request.contact_id).await;
        let _permit = match self.workers.acquire().await {
            Ok(permit) => permit,
            Err(_) => return ReplyOutcome::failed(FailureReason::ShuttingDown, None),
        };

        transition(PipelineState::Received);
        info!(preview = %preview(&request.message), "message received");

        let inbound = NewTurn::inbound(&request.contact_id, &request.contact_name, &request.message);
        let (contact, inbound_turn) = match self.record(inbound).await {
            Ok(recorded) => recorded,
            Err(e) => {
                error!(error = %e, state = ?PipelineState::Failed, "could not record inbound turn");
                return ReplyOutcome::failed(FailureReason::StoreUnavailable, None);
            }
        };
        let _ = inbound_turn_id.set(inbound_turn.id);
        transition(PipelineState::ContactResolved);

        if !contact.bot_enabled {
            info!("bot disabled for contact, not replying");
            return ReplyOutcome::empty(
                PipelineState::Done,
                FailureReason::BotDisabled,
                Some(inbound_turn.id),
            );
        }

        let exemplars = self.retrieve(request).await;
        transition(PipelineState::Retrieved);

        let history = self.history(&contact, inbound_turn.id).await;
        let prompt = self
            .assembler
            .assemble(&contact, &history, &exemplars, &request.message);
        debug!(
            exemplars = exemplars.len(),
            history_turns = prompt.history_turns,
            "prompt assembled"
        );

        let raw = match self.generate(&prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, state = ?PipelineState::Failed, "generation failed");
                return ReplyOutcome::failed(FailureReason::GenerationFailed, Some(inbound_turn.id));
            }
        };

        let reply = clean_reply(&raw);
        if reply.is_empty() {
            warn!("language model returned an empty reply");
            return ReplyOutcome::failed(FailureReason::EmptyGeneration, Some(inbound_turn.id));
        }
        transition(PipelineState::Synthesized);

        let confidence = self.confidence(&exemplars);
        let outbound = NewTurn::synthesized(
            &request.contact_id,
            &request.contact_name,
            &reply,
            confidence,
            provenance_of(&exemplars),
        );
        let outbound_turn = match self.record(outbound).await {
            Ok((_, turn)) => turn,
            Err(e) => {
                error!(error = %e, state = ?PipelineState::Failed, "could not persist reply");
                return ReplyOutcome::failed(FailureReason::PersistFailed, Some(inbound_turn.id));
            }
        };
        transition(PipelineState::Persisted);

        info!(
            preview = %preview(&reply),
            confidence,
            exemplars_used = exemplars.len(),
            "reply generated"
        );
        transition(PipelineState::Done);

        ReplyOutcome {
            reply,
            confidence,
            exemplars_used: exemplars.len(),
            latency_ms: 0,
            reason: None,
            state: PipelineState::Done,
            inbound_turn_id: Some(inbound_turn.id),
            outbound_turn_id: Some(outbound_turn.id),
        }
    }

    /// Embed the message and fetch exemplars. Any failure degrades to none.
    async fn retrieve(&self, request: &ReplyRequest) -> Vec<RetrievedExemplar> {
        if !self.config.rag_enabled {
            return Vec::new();
        }
        let Some(embedder) = &self.embedder else {
            return Vec::new();
        };

        let embedding =
            match tokio::time::timeout(self.config.embed_timeout, embedder.embed(&request.message))
                .await
            {
                Ok(Ok(embedding)) => embedding,
                Ok(Err(e)) => {
                    warn!(error = %e, "embedding failed, continuing without exemplars");
                    return Vec::new();
                }
                Err(_) => {
                    warn!("embedding timed out, continuing without exemplars");
                    return Vec::new();
                }
            };

        match self
            .retrieval
            .retrieve(&request.contact_id, &embedding, self.config.retrieval_top_k)
            .await
        {
            Ok(exemplars) => exemplars,
            Err(e) => {
                warn!(error = %e, "retrieval failed, continuing without exemplars");
                Vec::new()
            }
        }
    }

    async fn record(&self, turn: NewTurn) -> Result<(Contact, Turn)> {
        self.store
            .run_blocking(move |store| store.record_turn(&turn))
            .await
    }

    /// Recent turns, newest first, without the message being answered
    async fn history(&self, contact: &Contact, inbound_turn_id: i64) -> Vec<Turn> {
        let limit = self.config.history_limit;
        let contact_id = contact.contact_id.clone();
        let recent = self
            .store
            .run_blocking(move |store| store.recent_turns(&contact_id, limit + 1))
            .await;
        match recent {
            Ok(turns) => turns
                .into_iter()
                .filter(|turn| turn.id != inbound_turn_id)
                .take(limit)
                .collect(),
            Err(e) => {
                warn!(error = %e, "history unavailable, continuing without it");
                Vec::new()
            }
        }
    }

    /// Call the language model with a per-call timeout and bounded retries on
    /// transient failures
    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.config.llm_timeout, self.llm.complete(prompt))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(format!(
                    "language model did not answer within {}ms",
                    self.config.llm_timeout.as_millis()
                ))),
            };

            match result {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt < self.config.llm_max_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "transient language model failure, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `base + (1 - base) * mean(top similarities)`, or `base` without exemplars
    fn confidence(&self, exemplars: &[RetrievedExemplar]) -> f32 {
        let base = self.config.base_confidence;
        let top: Vec<f32> = exemplars
            .iter()
            .take(CONFIDENCE_TOP_N)
            .map(|e| e.similarity.clamp(0.0, 1.0))
            .collect();
        if top.is_empty() {
            return base;
        }
        let mean = top.iter().sum::<f32>() / top.len() as f32;
        (base + (1.0 - base) * mean).clamp(0.0, 1.0)
    }
}

fn transition(state: PipelineState) {
    debug!(state = ?state, "pipeline state");
}

fn preview(text: &str) -> String {
    let mut preview: String = text.chars().take(LOG_PREVIEW_CHARS).collect();
    if text.chars().count() > LOG_PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview
}
