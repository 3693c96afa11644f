//! SQLite storage for contacts, conversation history and style exemplars

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::contact::{Contact, ContactStats, ContactUpdate};
use crate::error::{Error, Result};
use crate::exemplar::{blob_to_vec, vec_to_blob, Exemplar, NewExemplar, GLOBAL_OWNER};
use crate::message::{Direction, NewTurn, Provenance, Turn};

const CONTACT_COLUMNS: &str = "contact_id, display_name, relationship_type, conversation_style, \
     bot_enabled, custom_instructions, first_seen_at, last_seen_at, total_messages";

const TURN_COLUMNS: &str = "id, contact_id, display_name, role, text, message_kind, \
     is_synthesized, confidence, retrieval_provenance, created_at";

const EXEMPLAR_COLUMNS: &str = "id, owner_id, trigger_text, reply_text, embedding, \
     context_text, source_timestamp, relevance_weight, created_at";

/// SQLite storage backend. The only shared mutable resource of the service.
///
/// Methods are synchronous. Async callers go through [`SqliteStorage::run_blocking`]
/// so waiting on the connection never parks a runtime thread.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    dimensions: usize,
}

impl SqliteStorage {
    /// Open the database under the configured data directory
    pub fn new(config: &Config) -> Result<Self> {
        config.ensure_dirs()?;
        Self::open(config.sqlite_path(), config.embedding_dimensions)
    }

    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>, dimensions: usize) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, dimensions)
    }

    /// A private in-memory database
    pub fn in_memory(dimensions: usize) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, dimensions)
    }

    fn from_connection(conn: Connection, dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(Error::config("embedding dimensions must be positive"));
        }

        conn.pragma_update(None, "foreign_keys", true)?;

        // Initialize schema
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
            dimensions,
        })
    }

    /// Replace the time source used for new rows
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Embedding dimension every exemplar must have
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::storage(e.to_string()))
    }

    /// Run `f` against this store on the blocking thread pool
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SqliteStorage) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| Error::storage(format!("storage task failed: {}", e)))?
    }

    /// Raw access to the connection, for tests that need to break the schema
    #[cfg(test)]
    pub(crate) fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.lock()?;
        Ok(f(&conn)?)
    }

    /// Cheap reachability check
    pub fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    // --- Contacts ---

    /// Create a contact or bump an existing one: `total_messages + 1`, newer `last_seen_at`
    pub fn upsert_contact(&self, contact_id: &str, display_name: &str) -> Result<Contact> {
        let now = self.clock.now();
        let conn = self.lock()?;
        upsert_contact_in(&conn, contact_id, display_name, &now)
    }

    /// Get a contact by ID
    pub fn get_contact(&self, contact_id: &str) -> Result<Option<Contact>> {
        let conn = self.lock()?;
        get_contact_in(&conn, contact_id)
    }

    /// List all contacts, most recently seen first
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM contacts ORDER BY last_seen_at DESC, contact_id",
            CONTACT_COLUMNS
        ))?;
        let rows = stmt.query_map([], ContactRow::read)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?.into_contact()?);
        }
        Ok(contacts)
    }

    /// Apply an administrative profile edit. Empty strings clear a field.
    pub fn update_contact(&self, contact_id: &str, update: &ContactUpdate) -> Result<Contact> {
        let conn = self.lock()?;

        let changed = conn.execute(
            r#"
            UPDATE contacts SET
                relationship_type = CASE WHEN ?2 IS NULL THEN relationship_type ELSE NULLIF(?2, '') END,
                conversation_style = CASE WHEN ?3 IS NULL THEN conversation_style ELSE NULLIF(?3, '') END,
                custom_instructions = CASE WHEN ?4 IS NULL THEN custom_instructions ELSE NULLIF(?4, '') END,
                bot_enabled = COALESCE(?5, bot_enabled)
            WHERE contact_id = ?1
            "#,
            params![
                contact_id,
                update.relationship_type,
                update.conversation_style,
                update.custom_instructions,
                update.bot_enabled,
            ],
        )?;

        if changed == 0 {
            return Err(Error::not_found(format!("contact {}", contact_id)));
        }

        get_contact_in(&conn, contact_id)?
            .ok_or_else(|| Error::not_found(format!("contact {}", contact_id)))
    }

    /// Delete a contact and, by cascade, its whole history
    pub fn delete_contact(&self, contact_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM contacts WHERE contact_id = ?1",
            params![contact_id],
        )?;
        Ok(deleted > 0)
    }

    // --- Conversation history ---

    /// Append a turn for an existing contact. Does not touch contact counters.
    pub fn append_turn(&self, turn: &NewTurn) -> Result<i64> {
        validate_turn(turn)?;
        let now = self.clock.now();
        let conn = self.lock()?;
        insert_turn_in(&conn, turn, &now)
    }

    /// Upsert the turn's contact and append the turn in one transaction
    pub fn record_turn(&self, turn: &NewTurn) -> Result<(Contact, Turn)> {
        validate_turn(turn)?;
        let now = self.clock.now();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let contact = upsert_contact_in(&tx, &turn.contact_id, &turn.display_name, &now)?;
        let id = insert_turn_in(&tx, turn, &now)?;
        tx.commit()?;

        let stored = Turn {
            id,
            contact_id: turn.contact_id.clone(),
            display_name: turn.display_name.clone(),
            direction: turn.direction,
            text: turn.text.clone(),
            message_kind: turn.message_kind,
            is_synthesized: turn.is_synthesized,
            confidence: turn.confidence,
            provenance: turn.provenance.clone(),
            created_at: now,
        };
        Ok((contact, stored))
    }

    /// The most recent `limit` turns for a contact, newest first
    pub fn recent_turns(&self, contact_id: &str, limit: usize) -> Result<Vec<Turn>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM conversation_turns
            WHERE contact_id = ?1
            ORDER BY created_at DESC, id DESC
            LIMIT ?2
            "#,
            TURN_COLUMNS
        ))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![contact_id, limit], TurnRow::read)?;

        let mut turns = Vec::new();
        for row in rows {
            turns.push(row?.into_turn()?);
        }
        Ok(turns)
    }

    /// Delete a contact's history and reset its counter. Returns the number of turns removed.
    pub fn clear_history(&self, contact_id: &str) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let reset = tx.execute(
            "UPDATE contacts SET total_messages = 0 WHERE contact_id = ?1",
            params![contact_id],
        )?;
        if reset == 0 {
            return Err(Error::not_found(format!("contact {}", contact_id)));
        }

        let deleted = tx.execute(
            "DELETE FROM conversation_turns WHERE contact_id = ?1",
            params![contact_id],
        )?;
        tx.commit()?;

        Ok(deleted)
    }

    /// Aggregate counts for diagnostics
    pub fn stats_for(&self, contact_id: &str) -> Result<ContactStats> {
        let conn = self.lock()?;

        if get_contact_in(&conn, contact_id)?.is_none() {
            return Err(Error::not_found(format!("contact {}", contact_id)));
        }

        let (total, inbound, outbound, mean_confidence, last): (
            i64,
            Option<i64>,
            Option<i64>,
            Option<f64>,
            Option<String>,
        ) = conn.query_row(
            r#"
            SELECT COUNT(*),
                   SUM(CASE WHEN role = 'inbound' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN role = 'outbound' THEN 1 ELSE 0 END),
                   AVG(CASE WHEN is_synthesized = 1 THEN confidence END),
                   MAX(created_at)
            FROM conversation_turns WHERE contact_id = ?1
            "#,
            params![contact_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

        let exemplar_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM style_exemplars WHERE owner_id = ?1",
            params![contact_id],
            |row| row.get(0),
        )?;

        Ok(ContactStats {
            contact_id: contact_id.to_string(),
            total_turns: total.max(0) as u64,
            inbound_turns: inbound.unwrap_or(0).max(0) as u64,
            outbound_turns: outbound.unwrap_or(0).max(0) as u64,
            exemplar_count: exemplar_count.max(0) as u64,
            mean_confidence,
            last_interaction_at: last.as_deref().map(parse_ts).transpose()?,
        })
    }

    // --- Style exemplars ---

    /// Insert one exemplar (ingestion path)
    pub fn insert_exemplar(&self, exemplar: &NewExemplar) -> Result<i64> {
        self.validate_exemplar(exemplar)?;
        let now = self.clock.now();
        let conn = self.lock()?;
        insert_exemplar_in(&conn, exemplar, &now)
    }

    /// Insert a batch of exemplars atomically; one bad row rejects the batch
    pub fn insert_exemplars(&self, exemplars: &[NewExemplar]) -> Result<usize> {
        for exemplar in exemplars {
            self.validate_exemplar(exemplar)?;
        }
        let now = self.clock.now();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for exemplar in exemplars {
            insert_exemplar_in(&tx, exemplar, &now)?;
        }
        tx.commit()?;

        Ok(exemplars.len())
    }

    /// Exemplars a contact may retrieve: its own plus global ones, above the weight threshold
    pub fn exemplar_candidates(&self, contact_id: &str, min_weight: f32) -> Result<Vec<Exemplar>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM style_exemplars
            WHERE (owner_id = ?1 OR owner_id = ?2) AND relevance_weight > ?3
            "#,
            EXEMPLAR_COLUMNS
        ))?;

        let rows = stmt.query_map(
            params![contact_id, GLOBAL_OWNER, min_weight as f64],
            ExemplarRow::read,
        )?;

        let mut exemplars = Vec::new();
        for row in rows {
            let exemplar = row?.into_exemplar()?;
            if exemplar.embedding.len() != self.dimensions {
                tracing::warn!(
                    exemplar_id = exemplar.id,
                    dimensions = exemplar.embedding.len(),
                    "skipping exemplar with wrong embedding dimension"
                );
                continue;
            }
            exemplars.push(exemplar);
        }
        Ok(exemplars)
    }

    /// Number of exemplars per owner
    pub fn exemplar_counts(&self) -> Result<BTreeMap<String, u64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT owner_id, COUNT(*) FROM style_exemplars GROUP BY owner_id ORDER BY owner_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (owner, count) = row?;
            counts.insert(owner, count.max(0) as u64);
        }
        Ok(counts)
    }

    /// Delete every exemplar of an owner
    pub fn clear_exemplars(&self, owner_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM style_exemplars WHERE owner_id = ?1",
            params![owner_id],
        )?;
        Ok(deleted)
    }

    fn validate_exemplar(&self, exemplar: &NewExemplar) -> Result<()> {
        if exemplar.owner_id.trim().is_empty() {
            return Err(Error::validation("exemplar owner_id is empty"));
        }
        if exemplar.embedding.len() != self.dimensions {
            return Err(Error::data_integrity(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                exemplar.embedding.len()
            )));
        }
        if !exemplar.relevance_weight.is_finite() || exemplar.relevance_weight < 0.0 {
            return Err(Error::data_integrity(format!(
                "relevance_weight must be a non-negative number, got {}",
                exemplar.relevance_weight
            )));
        }
        Ok(())
    }
}

fn fmt_ts(at: &DateTime<Utc>) -> String {
    // Fixed width so text ordering matches time ordering
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::storage(format!("Bad timestamp {:?}: {}", s, e)))
}

fn validate_turn(turn: &NewTurn) -> Result<()> {
    if turn.contact_id.trim().is_empty() {
        return Err(Error::validation("contact_id is empty"));
    }
    if turn.is_synthesized && turn.direction != Direction::Outbound {
        return Err(Error::data_integrity("only outbound turns can be synthesized"));
    }
    if turn.is_synthesized && turn.confidence.is_none() {
        return Err(Error::data_integrity("synthesized turns must carry a confidence"));
    }
    if let Some(confidence) = turn.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(Error::data_integrity(format!(
                "confidence must be within [0, 1], got {}",
                confidence
            )));
        }
    }
    Ok(())
}

fn upsert_contact_in(
    conn: &Connection,
    contact_id: &str,
    display_name: &str,
    now: &DateTime<Utc>,
) -> Result<Contact> {
    if contact_id.trim().is_empty() {
        return Err(Error::validation("contact_id is empty"));
    }

    let row = conn.query_row(
        &format!(
            r#"
            INSERT INTO contacts (
                contact_id, display_name, bot_enabled, first_seen_at, last_seen_at, total_messages
            ) VALUES (?1, ?2, 1, ?3, ?3, 1)
            ON CONFLICT(contact_id) DO UPDATE SET
                display_name = excluded.display_name,
                last_seen_at = MAX(contacts.last_seen_at, excluded.last_seen_at),
                total_messages = contacts.total_messages + 1
            RETURNING {}
            "#,
            CONTACT_COLUMNS
        ),
        params![contact_id, display_name, fmt_ts(now)],
        ContactRow::read,
    )?;

    row.into_contact()
}

fn get_contact_in(conn: &Connection, contact_id: &str) -> Result<Option<Contact>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM contacts WHERE contact_id = ?1", CONTACT_COLUMNS),
            params![contact_id],
            ContactRow::read,
        )
        .optional()?;

    row.map(ContactRow::into_contact).transpose()
}

fn insert_turn_in(conn: &Connection, turn: &NewTurn, now: &DateTime<Utc>) -> Result<i64> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM contacts WHERE contact_id = ?1)",
        params![turn.contact_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(Error::foreign_key(format!(
            "contact {} does not exist",
            turn.contact_id
        )));
    }

    let provenance = turn
        .provenance
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        r#"
        INSERT INTO conversation_turns (
            contact_id, display_name, role, text, message_kind,
            is_synthesized, confidence, retrieval_provenance, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            turn.contact_id,
            turn.display_name,
            turn.direction.to_string(),
            turn.text,
            turn.message_kind.to_string(),
            turn.is_synthesized,
            turn.confidence.map(f64::from),
            provenance,
            fmt_ts(now),
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

fn insert_exemplar_in(conn: &Connection, exemplar: &NewExemplar, now: &DateTime<Utc>) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO style_exemplars (
            owner_id, trigger_text, reply_text, embedding, context_text,
            source_timestamp, relevance_weight, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            exemplar.owner_id,
            exemplar.trigger_text,
            exemplar.reply_text,
            vec_to_blob(&exemplar.embedding),
            exemplar.context_text,
            exemplar.source_timestamp.as_ref().map(fmt_ts),
            exemplar.relevance_weight as f64,
            fmt_ts(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Intermediate struct for reading contacts from SQLite
struct ContactRow {
    contact_id: String,
    display_name: String,
    relationship_type: Option<String>,
    conversation_style: Option<String>,
    bot_enabled: bool,
    custom_instructions: Option<String>,
    first_seen_at: String,
    last_seen_at: String,
    total_messages: i64,
}

impl ContactRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            contact_id: row.get(0)?,
            display_name: row.get(1)?,
            relationship_type: row.get(2)?,
            conversation_style: row.get(3)?,
            bot_enabled: row.get(4)?,
            custom_instructions: row.get(5)?,
            first_seen_at: row.get(6)?,
            last_seen_at: row.get(7)?,
            total_messages: row.get(8)?,
        })
    }

    fn into_contact(self) -> Result<Contact> {
        Ok(Contact {
            contact_id: self.contact_id,
            display_name: self.display_name,
            relationship_type: self.relationship_type,
            conversation_style: self.conversation_style,
            bot_enabled: self.bot_enabled,
            custom_instructions: self.custom_instructions,
            first_seen_at: parse_ts(&self.first_seen_at)?,
            last_seen_at: parse_ts(&self.last_seen_at)?,
            total_messages: self.total_messages.max(0) as u64,
        })
    }
}

/// Intermediate struct for reading turns from SQLite
struct TurnRow {
    id: i64,
    contact_id: String,
    display_name: String,
    role: String,
    text: String,
    message_kind: String,
    is_synthesized: bool,
    confidence: Option<f64>,
    provenance: Option<String>,
    created_at: String,
}

impl TurnRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            contact_id: row.get(1)?,
            display_name: row.get(2)?,
            role: row.get(3)?,
            text: row.get(4)?,
            message_kind: row.get(5)?,
            is_synthesized: row.get(6)?,
            confidence: row.get(7)?,
            provenance: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_turn(self) -> Result<Turn> {
        let provenance: Option<Provenance> = self
            .provenance
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Turn {
            id: self.id,
            contact_id: self.contact_id,
            display_name: self.display_name,
            direction: self.role.parse()?,
            text: self.text,
            message_kind: self.message_kind.parse()?,
            is_synthesized: self.is_synthesized,
            confidence: self.confidence.map(|c| c as f32),
            provenance,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

/// Intermediate struct for reading exemplars from SQLite
struct ExemplarRow {
    id: i64,
    owner_id: String,
    trigger_text: String,
    reply_text: String,
    embedding: Vec<u8>,
    context_text: Option<String>,
    source_timestamp: Option<String>,
    relevance_weight: f64,
    created_at: String,
}

impl ExemplarRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            trigger_text: row.get(2)?,
            reply_text: row.get(3)?,
            embedding: row.get(4)?,
            context_text: row.get(5)?,
            source_timestamp: row.get(6)?,
            relevance_weight: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_exemplar(self) -> Result<Exemplar> {
        let embedding = blob_to_vec(&self.embedding).ok_or_else(|| {
            Error::data_integrity(format!("exemplar {} has a truncated embedding", self.id))
        })?;

        Ok(Exemplar {
            id: self.id,
            owner_id: self.owner_id,
            trigger_text: self.trigger_text,
            reply_text: self.reply_text,
            embedding,
            context_text: self.context_text,
            source_timestamp: self.source_timestamp.as_deref().map(parse_ts).transpose()?,
            relevance_weight: self.relevance_weight as f32,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::message::ProvenanceEntry;
    use chrono::{Duration, TimeZone};

    const DIM: usize = 3;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn setup() -> (SqliteStorage, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let storage = SqliteStorage::in_memory(DIM).unwrap().with_clock(clock.clone());
        (storage, clock)
    }

    fn reply_turn(contact_id: &str, text: &str) -> NewTurn {
        NewTurn::synthesized(
            contact_id,
            "Alice",
            text,
            0.7,
            Provenance {
                exemplars: vec![ProvenanceEntry {
                    exemplar_id: 1,
                    similarity: 0.9,
                }],
            },
        )
    }

    #[test]
    fn upsert_creates_then_increments() {
        let (storage, clock) = setup();

        let first = storage.upsert_contact("c1", "Alice").unwrap();
        assert_eq!(first.total_messages, 1);
        assert!(first.bot_enabled);
        assert_eq!(first.first_seen_at, start());

        clock.advance(Duration::minutes(3));
        let second = storage.upsert_contact("c1", "Alice B").unwrap();
        assert_eq!(second.total_messages, 2);
        assert_eq!(second.display_name, "Alice B");
        assert_eq!(second.first_seen_at, start());
        assert_eq!(second.last_seen_at, start() + Duration::minutes(3));
    }

    #[test]
    fn last_seen_never_moves_backwards() {
        let (storage, clock) = setup();
        storage.upsert_contact("c1", "Alice").unwrap();

        clock.set(start() - Duration::hours(1));
        let contact = storage.upsert_contact("c1", "Alice").unwrap();
        assert!(contact.last_seen_at >= contact.first_seen_at);
        assert_eq!(contact.last_seen_at, start());
    }

    #[test]
    fn append_requires_existing_contact() {
        let (storage, _) = setup();
        let err = storage
            .append_turn(&NewTurn::inbound("ghost", "Nobody", "hi"))
            .unwrap_err();
        assert!(matches!(err, Error::ForeignKeyViolation(_)));
        assert!(storage.get_contact("ghost").unwrap().is_none());
    }

    #[test]
    fn synthesized_turn_without_confidence_is_rejected() {
        let (storage, _) = setup();
        let mut turn = reply_turn("c1", "yo");
        turn.confidence = None;
        let err = storage.record_turn(&turn).unwrap_err();
        assert!(matches!(err, Error::DataIntegrity(_)));
        assert!(storage.get_contact("c1").unwrap().is_none());
    }

    #[test]
    fn record_turn_keeps_counter_equal_to_history() {
        let (storage, clock) = setup();
        storage
            .record_turn(&NewTurn::inbound("c1", "Alice", "hey"))
            .unwrap();
        clock.advance(Duration::seconds(1));
        let (contact, turn) = storage.record_turn(&reply_turn("c1", "yo")).unwrap();

        assert_eq!(contact.total_messages, 2);
        assert_eq!(turn.direction, Direction::Outbound);
        assert_eq!(storage.recent_turns("c1", 50).unwrap().len(), 2);
    }

    #[test]
    fn recent_turns_are_newest_first_and_limited() {
        let (storage, clock) = setup();
        for text in ["one", "two", "three"] {
            storage
                .record_turn(&NewTurn::inbound("c1", "Alice", text))
                .unwrap();
            clock.advance(Duration::seconds(1));
        }

        let turns = storage.recent_turns("c1", 2).unwrap();
        let texts: Vec<_> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["three", "two"]);
        assert!(storage.recent_turns("c1", 0).unwrap().is_empty());
    }

    #[test]
    fn equal_timestamps_fall_back_to_insertion_order() {
        let (storage, _) = setup();
        for text in ["a", "b", "c"] {
            storage
                .record_turn(&NewTurn::inbound("c1", "Alice", text))
                .unwrap();
        }

        let turns = storage.recent_turns("c1", 10).unwrap();
        let texts: Vec<_> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["c", "b", "a"]);
    }

    #[test]
    fn provenance_survives_the_round_trip() {
        let (storage, _) = setup();
        storage.record_turn(&reply_turn("c1", "yo")).unwrap();

        let turn = &storage.recent_turns("c1", 1).unwrap()[0];
        assert!(turn.is_synthesized);
        assert_eq!(turn.confidence, Some(0.7));
        let provenance = turn.provenance.as_ref().unwrap();
        assert_eq!(provenance.exemplars[0].exemplar_id, 1);
    }

    #[test]
    fn deleting_contact_cascades_to_history() {
        let (storage, _) = setup();
        storage
            .record_turn(&NewTurn::inbound("c1", "Alice", "hey"))
            .unwrap();

        assert!(storage.delete_contact("c1").unwrap());
        assert!(storage.recent_turns("c1", 10).unwrap().is_empty());
        assert!(!storage.delete_contact("c1").unwrap());
    }

    #[test]
    fn clear_history_resets_counter() {
        let (storage, _) = setup();
        storage
            .record_turn(&NewTurn::inbound("c1", "Alice", "hey"))
            .unwrap();
        storage.record_turn(&reply_turn("c1", "yo")).unwrap();

        assert_eq!(storage.clear_history("c1").unwrap(), 2);
        let contact = storage.get_contact("c1").unwrap().unwrap();
        assert_eq!(contact.total_messages, 0);
        assert!(matches!(
            storage.clear_history("ghost").unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn update_contact_sets_and_clears_fields() {
        let (storage, _) = setup();
        storage.upsert_contact("c1", "Alice").unwrap();

        let updated = storage
            .update_contact(
                "c1",
                &ContactUpdate {
                    relationship_type: Some("friend".into()),
                    custom_instructions: Some("never mention work".into()),
                    bot_enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.relationship_type.as_deref(), Some("friend"));
        assert!(!updated.bot_enabled);

        let cleared = storage
            .update_contact(
                "c1",
                &ContactUpdate {
                    custom_instructions: Some(String::new()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(cleared.custom_instructions, None);
        assert_eq!(cleared.relationship_type.as_deref(), Some("friend"));

        assert!(matches!(
            storage
                .update_contact("ghost", &ContactUpdate::default())
                .unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn stats_aggregate_history_and_exemplars() {
        let (storage, clock) = setup();
        storage
            .record_turn(&NewTurn::inbound("c1", "Alice", "hey"))
            .unwrap();
        clock.advance(Duration::seconds(2));
        storage.record_turn(&reply_turn("c1", "yo")).unwrap();
        storage
            .insert_exemplar(&NewExemplar::new("c1", "hey", "yo", vec![1.0, 0.0, 0.0]))
            .unwrap();
        storage
            .insert_exemplar(&NewExemplar::global("sup", "nm", vec![0.0, 1.0, 0.0]))
            .unwrap();

        let stats = storage.stats_for("c1").unwrap();
        assert_eq!(stats.total_turns, 2);
        assert_eq!(stats.inbound_turns, 1);
        assert_eq!(stats.outbound_turns, 1);
        assert_eq!(stats.exemplar_count, 1);
        let mean = stats.mean_confidence.unwrap();
        assert!((mean - 0.7).abs() < 1e-6);
        assert_eq!(stats.last_interaction_at, Some(start() + Duration::seconds(2)));
    }

    #[test]
    fn stats_for_unknown_contact_is_not_found() {
        let (storage, _) = setup();
        assert!(matches!(
            storage.stats_for("ghost").unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn exemplar_dimension_mismatch_is_rejected() {
        let (storage, _) = setup();
        let err = storage
            .insert_exemplar(&NewExemplar::global("hey", "yo", vec![1.0, 0.0]))
            .unwrap_err();
        assert!(matches!(err, Error::DataIntegrity(_)));
        assert!(storage.exemplar_counts().unwrap().is_empty());
    }

    #[test]
    fn batch_insert_is_all_or_nothing() {
        let (storage, _) = setup();
        let batch = vec![
            NewExemplar::global("a", "b", vec![1.0, 0.0, 0.0]),
            NewExemplar::global("c", "d", vec![1.0]),
        ];
        assert!(storage.insert_exemplars(&batch).is_err());
        assert!(storage.exemplar_counts().unwrap().is_empty());
    }

    #[test]
    fn candidates_include_own_and_global_above_threshold() {
        let (storage, _) = setup();
        let v = vec![1.0, 0.0, 0.0];
        storage
            .insert_exemplars(&[
                NewExemplar::new("c1", "own", "mine", v.clone()),
                NewExemplar::new("c2", "other", "theirs", v.clone()),
                NewExemplar::global("shared", "ours", v.clone()),
                NewExemplar::global("weak", "meh", v.clone()).with_weight(0.3),
            ])
            .unwrap();

        let mut triggers: Vec<_> = storage
            .exemplar_candidates("c1", 0.3)
            .unwrap()
            .into_iter()
            .map(|e| e.trigger_text)
            .collect();
        triggers.sort();
        assert_eq!(triggers, vec!["own", "shared"]);

        let counts = storage.exemplar_counts().unwrap();
        assert_eq!(counts.get("global"), Some(&2));
        assert_eq!(counts.get("c2"), Some(&1));
    }

    #[test]
    fn clear_exemplars_only_touches_one_owner() {
        let (storage, _) = setup();
        let v = vec![0.0, 0.0, 1.0];
        storage
            .insert_exemplars(&[
                NewExemplar::new("c1", "a", "b", v.clone()),
                NewExemplar::global("c", "d", v),
            ])
            .unwrap();

        assert_eq!(storage.clear_exemplars("c1").unwrap(), 1);
        assert_eq!(storage.exemplar_counts().unwrap().get("global"), Some(&1));
    }

    #[tokio::test]
    async fn waiting_on_the_connection_does_not_stall_the_runtime() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (storage, _) = setup();
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        // Another thread holds the connection for a while
        let (held_tx, held_rx) = tokio::sync::oneshot::channel();
        let holder = {
            let storage = storage.clone();
            std::thread::spawn(move || {
                storage
                    .with_connection(|_| {
                        let _ = held_tx.send(());
                        std::thread::sleep(std::time::Duration::from_millis(300));
                        Ok(())
                    })
                    .unwrap();
            })
        };
        held_rx.await.unwrap();

        let before = ticks.load(Ordering::SeqCst);
        let (contact, _) = storage
            .run_blocking(|s| s.record_turn(&NewTurn::inbound("c1", "Alice", "hey")))
            .await
            .unwrap();
        let during = ticks.load(Ordering::SeqCst) - before;

        ticker.abort();
        holder.join().unwrap();

        assert_eq!(contact.total_messages, 1);
        assert!(during >= 5, "runtime only ticked {} times while waiting", during);
    }

    #[test]
    fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");

        {
            let storage = SqliteStorage::open(&path, DIM).unwrap();
            storage
                .record_turn(&NewTurn::inbound("c1", "Alice", "hey"))
                .unwrap();
        }

        let storage = SqliteStorage::open(&path, DIM).unwrap();
        assert_eq!(storage.get_contact("c1").unwrap().unwrap().total_messages, 1);
        assert!(storage.ping().is_ok());
    }
}
