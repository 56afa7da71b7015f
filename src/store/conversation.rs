//! SQLite-backed conversation store.
//!
//! Sessions, messages, stage-transition history, escalation tasks and
//! reviewer notes live here. The store is the single source of truth: the
//! orchestrator reads session state back at the start of every turn and
//! never caches it.
//!
//! DB location: `~/.leadbot/leadbot.db` (configurable).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::errors::StoreError;
use crate::funnel::Stage;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A row from the `sessions` table.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRow {
    pub id: i64,
    pub external_id: String,
    pub stage: Stage,
    /// Profile facts extracted during the conversation.
    pub info: Value,
    pub finished: bool,
    pub batch_waiting: bool,
    pub batch_started_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from the `messages` table.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRow {
    pub id: i64,
    pub session_id: i64,
    pub role: Role,
    pub content: String,
    /// Stage in effect when the message was written (NULL on legacy rows).
    pub stage: Option<Stage>,
    pub created_at: String,
}

/// A row from the `stage_transitions` table.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRow {
    pub id: i64,
    pub session_id: i64,
    pub previous_stage: Option<Stage>,
    pub new_stage: Stage,
    pub trigger_message_id: Option<i64>,
    pub confidence: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Closed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Closed => "closed",
        }
    }

    pub fn parse(text: &str) -> Option<TaskStatus> {
        match text.trim().to_ascii_lowercase().as_str() {
            "open" => Some(TaskStatus::Open),
            "in_progress" | "in-progress" => Some(TaskStatus::InProgress),
            "closed" | "done" => Some(TaskStatus::Closed),
            _ => None,
        }
    }
}

/// A unit of work handed to a human operator (`human_tasks` table).
#[derive(Debug, Clone, Serialize)]
pub struct EscalationTask {
    pub id: i64,
    pub session_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub assigned_to: Option<String>,
    pub metadata: Value,
    pub completed: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields for a task about to be created.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub session_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub assigned_to: Option<String>,
    pub metadata: Value,
}

/// A reviewer's rating/comment on one message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageNote {
    pub id: i64,
    pub message_id: i64,
    pub rating: Option<u8>,
    pub note: String,
    pub author: Option<String>,
    pub created_at: String,
}

/// An operator's free-form note on a whole session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionNote {
    pub id: i64,
    pub session_id: i64,
    pub note: String,
    pub author: Option<String>,
    pub created_at: String,
}

/// User messages taken by one turn for a single model call.
#[derive(Debug, Clone)]
pub struct ClaimedBatch {
    /// Chronological.
    pub messages: Vec<MessageRow>,
    /// The session's claim mark before this batch was taken.
    pub previous_mark: i64,
}

impl ClaimedBatch {
    /// Highest message id in the batch (the new claim mark).
    pub fn mark(&self) -> i64 {
        self.messages
            .iter()
            .map(|m| m.id)
            .max()
            .unwrap_or(self.previous_mark)
    }
}

/// Session plus counters, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: SessionRow,
    pub message_count: i64,
    pub open_tasks: i64,
}

/// Result of [`ConversationStore::append_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted(i64),
    /// Identical to the previous message of the same role inside the
    /// duplicate window; carries that message's id.
    Duplicate(i64),
}

impl AppendOutcome {
    pub fn id(self) -> i64 {
        match self {
            AppendOutcome::Inserted(id) | AppendOutcome::Duplicate(id) => id,
        }
    }

    pub fn is_duplicate(self) -> bool {
        matches!(self, AppendOutcome::Duplicate(_))
    }
}

// ---------------------------------------------------------------------------
// Column codecs
// ---------------------------------------------------------------------------

impl ToSql for Stage {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Stage {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Stage::parse_loose(text)
            .ok_or_else(|| FromSqlError::Other(Box::new(StoreError::InvalidStage(text.to_string()))))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        TaskStatus::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

/// RFC 3339 UTC with fixed microsecond precision, so that lexical order
/// matches time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now() -> String {
    timestamp(Utc::now())
}

const SESSION_COLS: &str = "id, external_id, stage, info, finished, batch_waiting,
                            batch_started_at, created_at, updated_at";
const MESSAGE_COLS: &str = "id, session_id, role, content, stage, created_at";
const TRANSITION_COLS: &str =
    "id, session_id, previous_stage, new_stage, trigger_message_id, confidence, created_at";
const TASK_COLS: &str = "id, session_id, title, description, status, assigned_to, metadata,
                         completed, created_at, updated_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        external_id: row.get(1)?,
        stage: row.get(2)?,
        info: row.get(3)?,
        finished: row.get(4)?,
        batch_waiting: row.get(5)?,
        batch_started_at: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        stage: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn transition_from_row(row: &Row<'_>) -> rusqlite::Result<TransitionRow> {
    Ok(TransitionRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        previous_stage: row.get(2)?,
        new_stage: row.get(3)?,
        trigger_message_id: row.get(4)?,
        confidence: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<EscalationTask> {
    Ok(EscalationTask {
        id: row.get(0)?,
        session_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        assigned_to: row.get(5)?,
        metadata: row.get(6)?,
        completed: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

// ---------------------------------------------------------------------------
// ConversationStore
// ---------------------------------------------------------------------------

/// Thread-safe SQLite conversation store.
///
/// Uses a sync `Mutex<Connection>` because rusqlite's `Connection` is `!Sync`.
/// Every method takes the lock for a handful of short statements and never
/// holds it across an `.await`, so calling from async code is fine.
pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    /// Open (or create) the database at `db_path` and run migrations.
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;

        // Performance pragmas.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        Self::migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run schema migrations (idempotent).
    fn migrate(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 external_id TEXT NOT NULL UNIQUE,
                 stage TEXT NOT NULL DEFAULT 'new_lead',
                 info TEXT NOT NULL DEFAULT '{}',
                 finished INTEGER NOT NULL DEFAULT 0,
                 batch_waiting INTEGER NOT NULL DEFAULT 0,
                 batch_started_at TEXT,
                 claimed_through INTEGER NOT NULL DEFAULT 0,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL,
                 CHECK ((batch_waiting = 0) = (batch_started_at IS NULL))
             );

             CREATE TABLE IF NOT EXISTS messages (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_id INTEGER NOT NULL REFERENCES sessions(id),
                 role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                 content TEXT NOT NULL,
                 stage TEXT,
                 created_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS stage_transitions (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_id INTEGER NOT NULL REFERENCES sessions(id),
                 previous_stage TEXT,
                 new_stage TEXT NOT NULL,
                 trigger_message_id INTEGER REFERENCES messages(id),
                 confidence REAL NOT NULL,
                 created_at TEXT NOT NULL,
                 CHECK (previous_stage IS NULL OR previous_stage <> new_stage)
             );

             CREATE TABLE IF NOT EXISTS human_tasks (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_id INTEGER REFERENCES sessions(id),
                 title TEXT NOT NULL,
                 description TEXT NOT NULL DEFAULT '',
                 status TEXT NOT NULL DEFAULT 'open'
                     CHECK (status IN ('open', 'in_progress', 'closed')),
                 assigned_to TEXT,
                 metadata TEXT NOT NULL DEFAULT '{}',
                 completed INTEGER NOT NULL DEFAULT 0,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS message_notes (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 message_id INTEGER NOT NULL REFERENCES messages(id),
                 rating INTEGER CHECK (rating IS NULL OR rating BETWEEN 1 AND 5),
                 note TEXT NOT NULL,
                 author TEXT,
                 created_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS session_notes (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_id INTEGER NOT NULL REFERENCES sessions(id),
                 note TEXT NOT NULL,
                 author TEXT,
                 created_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_messages_session
                 ON messages(session_id, created_at, id);
             CREATE INDEX IF NOT EXISTS idx_transitions_session
                 ON stage_transitions(session_id, created_at, id);
             CREATE INDEX IF NOT EXISTS idx_tasks_session
                 ON human_tasks(session_id, completed);
             CREATE INDEX IF NOT EXISTS idx_notes_message ON message_notes(message_id);
             CREATE INDEX IF NOT EXISTS idx_session_notes ON session_notes(session_id);",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // ------------------------------------------------------------------
    // Session operations
    // ------------------------------------------------------------------

    /// Fetch the session for `external_id`, creating it at `new_lead` if it
    /// does not exist yet. The flag is true when the row was just created.
    pub fn get_or_create_session(&self, external_id: &str) -> Result<(SessionRow, bool), StoreError> {
        let conn = self.lock()?;
        let now = now();
        let created = conn.execute(
            "INSERT OR IGNORE INTO sessions (external_id, stage, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![external_id, Stage::NewLead, now],
        )? > 0;
        if created {
            info!("New session created: {}", external_id);
        }

        let session = conn.query_row(
            &format!("SELECT {SESSION_COLS} FROM sessions WHERE external_id = ?1"),
            params![external_id],
            session_from_row,
        )?;
        Ok((session, created))
    }

    pub fn find_session(&self, external_id: &str) -> Result<Option<SessionRow>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                &format!("SELECT {SESSION_COLS} FROM sessions WHERE external_id = ?1"),
                params![external_id],
                session_from_row,
            )
            .optional()?)
    }

    pub fn get_session(&self, session_id: i64) -> Result<SessionRow, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"),
            params![session_id],
            session_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    /// Most recently active sessions, with message and open-task counts.
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLS},
                    (SELECT COUNT(*) FROM messages m WHERE m.session_id = sessions.id),
                    (SELECT COUNT(*) FROM human_tasks t
                      WHERE t.session_id = sessions.id AND t.completed = 0)
             FROM sessions ORDER BY updated_at DESC, id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(SessionSummary {
                session: session_from_row(row)?,
                message_count: row.get(9)?,
                open_tasks: row.get(10)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Move the session to `stage`. Reaching the terminal stage sets the
    /// finished flag; nothing ever clears it.
    pub fn update_session_stage(&self, session_id: i64, stage: Stage) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE sessions
             SET stage = ?1,
                 finished = CASE WHEN ?2 THEN 1 ELSE finished END,
                 updated_at = ?3
             WHERE id = ?4",
            params![stage, stage.is_terminal(), now(), session_id],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Shallow-merge `facts` into the session's info blob.
    pub fn merge_session_info(&self, session_id: i64, facts: &Map<String, Value>) -> Result<(), StoreError> {
        if facts.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        let current: Value = conn.query_row(
            "SELECT info FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        let mut merged = match current {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (k, v) in facts {
            merged.insert(k.clone(), v.clone());
        }
        conn.execute(
            "UPDATE sessions SET info = ?1, updated_at = ?2 WHERE id = ?3",
            params![Value::Object(merged), now(), session_id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Batch window flag
    // ------------------------------------------------------------------

    /// Try to open a batch window for the session.
    ///
    /// Returns false when another turn already holds a live window. A flag
    /// older than `stale_after` is taken over (the turn that set it is
    /// assumed dead).
    pub fn try_begin_batch(&self, session_id: i64, stale_after: Duration) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let now_at = Utc::now();
        let cutoff = chrono::Duration::from_std(stale_after)
            .map(|d| timestamp(now_at - d))
            .unwrap_or_default();

        let (waiting, started): (bool, Option<String>) = conn.query_row(
            "SELECT batch_waiting, batch_started_at FROM sessions WHERE id = ?1",
            params![session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if waiting {
            match started {
                Some(ref at) if at.as_str() >= cutoff.as_str() => return Ok(false),
                _ => warn!(
                    "Taking over stale batch window of session {} (started {:?})",
                    session_id, started
                ),
            }
        }

        let ts = timestamp(now_at);
        conn.execute(
            "UPDATE sessions SET batch_waiting = 1, batch_started_at = ?1, updated_at = ?1
             WHERE id = ?2",
            params![ts, session_id],
        )?;
        Ok(true)
    }

    /// Close the batch window (flag and start time are cleared together).
    pub fn end_batch(&self, session_id: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sessions SET batch_waiting = 0, batch_started_at = NULL, updated_at = ?1
             WHERE id = ?2",
            params![now(), session_id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Message operations
    // ------------------------------------------------------------------

    /// Append a message.
    ///
    /// With `dedup_window`, a message byte-identical to the previous
    /// message of the same role written within the window is not stored
    /// again; the previous message's id is returned instead.
    pub fn append_message(
        &self,
        session_id: i64,
        role: Role,
        content: &str,
        stage: Option<Stage>,
        dedup_window: Option<Duration>,
    ) -> Result<AppendOutcome, StoreError> {
        let conn = self.lock()?;
        let now_at = Utc::now();

        if let Some(window) = dedup_window {
            let last: Option<(i64, String, String)> = conn
                .query_row(
                    "SELECT id, content, created_at FROM messages
                     WHERE session_id = ?1 AND role = ?2
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    params![session_id, role.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            if let Some((id, last_content, last_at)) = last {
                let within = DateTime::parse_from_rfc3339(&last_at)
                    .ok()
                    .and_then(|at| (now_at - at.with_timezone(&Utc)).to_std().ok())
                    .map(|elapsed| elapsed <= window)
                    .unwrap_or(false);
                if within && last_content == content {
                    debug!("Duplicate {} message in session {} dropped", role.as_str(), session_id);
                    return Ok(AppendOutcome::Duplicate(id));
                }
            }
        }

        let ts = timestamp(now_at);
        conn.execute(
            "INSERT INTO messages (session_id, role, content, stage, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, role.as_str(), content, stage, ts],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![ts, session_id],
        )?;
        Ok(AppendOutcome::Inserted(id))
    }

    /// The last `limit` messages of a session in chronological order.
    pub fn recent_messages(&self, session_id: i64, limit: usize) -> Result<Vec<MessageRow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM messages WHERE session_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2"
        ))?;
        let mut rows = stmt
            .query_map(params![session_id, limit as i64], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// The last `limit` messages strictly before `message`, chronological.
    pub fn messages_before(
        &self,
        session_id: i64,
        message: &MessageRow,
        limit: usize,
    ) -> Result<Vec<MessageRow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM messages
             WHERE session_id = ?1 AND (created_at, id) < (?2, ?3)
             ORDER BY created_at DESC, id DESC LIMIT ?4"
        ))?;
        let mut rows = stmt
            .query_map(
                params![session_id, message.created_at, message.id, limit as i64],
                message_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    pub fn message_count(&self, session_id: i64) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?)
    }

    pub fn has_assistant_message(&self, session_id: i64) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM messages WHERE session_id = ?1 AND role = 'assistant')",
            params![session_id],
            |row| row.get(0),
        )?)
    }

    // ------------------------------------------------------------------
    // Pending user messages
    //
    // `sessions.claimed_through` is the highest user message id already
    // taken by a model call. Everything above it is pending.
    // ------------------------------------------------------------------

    /// Claim every pending user message of the session for one model call.
    ///
    /// Returns `None` when nothing is pending, or when `own_message` was
    /// already claimed by another turn.
    pub fn claim_pending(&self, session_id: i64, own_message: i64) -> Result<Option<ClaimedBatch>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mark: i64 = tx.query_row(
            "SELECT claimed_through FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        if own_message <= mark {
            return Ok(None);
        }

        let messages = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {MESSAGE_COLS} FROM messages
                 WHERE session_id = ?1 AND role = 'user' AND id > ?2
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt
                .query_map(params![session_id, mark], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        if messages.is_empty() {
            return Ok(None);
        }

        let batch = ClaimedBatch {
            messages,
            previous_mark: mark,
        };
        tx.execute(
            "UPDATE sessions SET claimed_through = ?1 WHERE id = ?2",
            params![batch.mark(), session_id],
        )?;
        tx.commit()?;
        Ok(Some(batch))
    }

    /// Give a claimed batch back after a failed model call so the next turn
    /// answers it. Returns false when a later turn already claimed past it.
    pub fn release_claim(&self, session_id: i64, batch: &ClaimedBatch) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let released = conn.execute(
            "UPDATE sessions SET claimed_through = ?1 WHERE id = ?2 AND claimed_through = ?3",
            params![batch.previous_mark, session_id, batch.mark()],
        )? > 0;
        if !released {
            warn!("Session {} claimed past message #{}, batch not released", session_id, batch.mark());
        }
        Ok(released)
    }

    /// The newest pending user message with exactly this text, if any.
    pub fn pending_user_message(&self, session_id: i64, content: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT m.id FROM messages m JOIN sessions s ON s.id = m.session_id
                 WHERE m.session_id = ?1 AND m.role = 'user' AND m.content = ?2
                   AND m.id > s.claimed_through
                 ORDER BY m.id DESC LIMIT 1",
                params![session_id, content],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Undo a welcome whose follow-up model call failed: drop the welcome
    /// message and its transition and put the session back at `new_lead`.
    pub fn revert_welcome(&self, session_id: i64, welcome_id: i64) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM stage_transitions WHERE session_id = ?1 AND trigger_message_id = ?2",
            params![session_id, welcome_id],
        )?;
        tx.execute(
            "DELETE FROM messages WHERE id = ?1 AND session_id = ?2 AND role = 'assistant'",
            params![welcome_id, session_id],
        )?;
        tx.execute(
            "UPDATE sessions SET stage = ?1, updated_at = ?2 WHERE id = ?3 AND stage = ?4",
            params![Stage::NewLead, now(), session_id, Stage::Tagged],
        )?;
        tx.commit()?;
        info!("Welcome of session {} reverted", session_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stage transitions
    // ------------------------------------------------------------------

    pub fn record_transition(
        &self,
        session_id: i64,
        previous: Option<Stage>,
        new: Stage,
        trigger_message_id: Option<i64>,
        confidence: f64,
    ) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO stage_transitions
                 (session_id, previous_stage, new_stage, trigger_message_id, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![session_id, previous, new, trigger_message_id, confidence, now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_transitions(&self, session_id: i64) -> Result<Vec<TransitionRow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRANSITION_COLS} FROM stage_transitions WHERE session_id = ?1
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![session_id], transition_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Check that the stored transition history of a session only ever
    /// moves forward. The schema cannot express this, so it is audited here.
    pub fn verify_monotonic_transitions(&self, session_id: i64) -> Result<(), StoreError> {
        let mut reached: Option<Stage> = None;
        for t in self.list_transitions(session_id)? {
            let step_back = t
                .previous_stage
                .is_some_and(|prev| t.new_stage.order() <= prev.order());
            let below_reached = reached.is_some_and(|r| t.new_stage.order() <= r.order());
            if step_back || below_reached {
                return Err(StoreError::NonMonotonic {
                    session_id: session_id.to_string(),
                    transition_id: t.id,
                    previous: t
                        .previous_stage
                        .or(reached)
                        .map(|s| s.as_str().to_string())
                        .unwrap_or_default(),
                    new: t.new_stage.as_str().to_string(),
                });
            }
            reached = Some(t.new_stage);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Escalation tasks
    // ------------------------------------------------------------------

    pub fn create_task(&self, task: &NewTask) -> Result<EscalationTask, StoreError> {
        let conn = self.lock()?;
        let now = now();
        conn.execute(
            "INSERT INTO human_tasks
                 (session_id, title, description, status, assigned_to, metadata,
                  completed, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'open', ?4, ?5, 0, ?6, ?6)",
            params![
                task.session_id,
                task.title,
                task.description,
                task.assigned_to,
                task.metadata,
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(conn.query_row(
            &format!("SELECT {TASK_COLS} FROM human_tasks WHERE id = ?1"),
            params![id],
            task_from_row,
        )?)
    }

    /// Tasks of a session that are not completed yet, oldest first.
    pub fn open_tasks(&self, session_id: i64) -> Result<Vec<EscalationTask>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLS} FROM human_tasks
             WHERE session_id = ?1 AND completed = 0
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![session_id], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_tasks(&self, include_completed: bool, limit: usize) -> Result<Vec<EscalationTask>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLS} FROM human_tasks
             WHERE ?1 OR completed = 0
             ORDER BY created_at DESC, id DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![include_completed, limit as i64], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Change a task's status (and optionally its assignee). Closing a task
    /// marks it completed, which unblocks the session.
    pub fn update_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        assigned_to: Option<&str>,
    ) -> Result<Option<EscalationTask>, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE human_tasks
             SET status = ?1,
                 completed = ?2,
                 assigned_to = COALESCE(?3, assigned_to),
                 updated_at = ?4
             WHERE id = ?5",
            params![
                status.as_str(),
                status == TaskStatus::Closed,
                assigned_to,
                now(),
                task_id
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        info!("Task {} moved to {}", task_id, status.as_str());
        Ok(conn
            .query_row(
                &format!("SELECT {TASK_COLS} FROM human_tasks WHERE id = ?1"),
                params![task_id],
                task_from_row,
            )
            .optional()?)
    }

    // ------------------------------------------------------------------
    // Reviewer notes
    // ------------------------------------------------------------------

    pub fn add_message_note(
        &self,
        message_id: i64,
        rating: Option<u8>,
        note: &str,
        author: Option<&str>,
    ) -> Result<MessageNote, StoreError> {
        let conn = self.lock()?;
        let now = now();
        conn.execute(
            "INSERT INTO message_notes (message_id, rating, note, author, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![message_id, rating, note, author, now],
        )?;
        Ok(MessageNote {
            id: conn.last_insert_rowid(),
            message_id,
            rating,
            note: note.to_string(),
            author: author.map(String::from),
            created_at: now,
        })
    }

    pub fn notes_for_session(&self, session_id: i64) -> Result<Vec<MessageNote>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT n.id, n.message_id, n.rating, n.note, n.author, n.created_at
             FROM message_notes n JOIN messages m ON n.message_id = m.id
             WHERE m.session_id = ?1
             ORDER BY n.created_at ASC, n.id ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(MessageNote {
                    id: row.get(0)?,
                    message_id: row.get(1)?,
                    rating: row.get(2)?,
                    note: row.get(3)?,
                    author: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn add_session_note(
        &self,
        session_id: i64,
        note: &str,
        author: Option<&str>,
    ) -> Result<SessionNote, StoreError> {
        let conn = self.lock()?;
        let now = now();
        conn.execute(
            "INSERT INTO session_notes (session_id, note, author, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, note, author, now],
        )?;
        Ok(SessionNote {
            id: conn.last_insert_rowid(),
            session_id,
            note: note.to_string(),
            author: author.map(String::from),
            created_at: now,
        })
    }

    pub fn session_notes(&self, session_id: i64) -> Result<Vec<SessionNote>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, note, author, created_at FROM session_notes
             WHERE session_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(SessionNote {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    note: row.get(2)?,
                    author: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, ConversationStore) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test_store.db");
        let store = ConversationStore::new(&db_path).unwrap();
        (dir, store)
    }

    const WINDOW: Option<Duration> = Some(Duration::from_secs(3));

    #[test]
    fn test_get_or_create_session() {
        let (_dir, store) = temp_store();

        let (s1, created) = store.get_or_create_session("wa:123").unwrap();
        assert!(created);
        assert_eq!(s1.stage, Stage::NewLead);
        assert!(!s1.finished);
        assert!(!s1.batch_waiting);

        let (s2, created) = store.get_or_create_session("wa:123").unwrap();
        assert!(!created);
        assert_eq!(s1.id, s2.id);

        let (s3, _) = store.get_or_create_session("wa:999").unwrap();
        assert_ne!(s1.id, s3.id);
    }

    #[test]
    fn test_find_session_missing() {
        let (_dir, store) = temp_store();
        assert!(store.find_session("nobody").unwrap().is_none());
        assert!(matches!(
            store.get_session(42),
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_user_message_within_window() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("dup").unwrap();

        let first = store
            .append_message(s.id, Role::User, "hello", Some(Stage::Tagged), WINDOW)
            .unwrap();
        let second = store
            .append_message(s.id, Role::User, "hello", Some(Stage::Tagged), WINDOW)
            .unwrap();

        assert!(!first.is_duplicate());
        assert_eq!(second, AppendOutcome::Duplicate(first.id()));
        assert_eq!(store.message_count(s.id).unwrap(), 1);
    }

    #[test]
    fn test_duplicate_check_compares_same_role_only() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("roles").unwrap();

        store.append_message(s.id, Role::User, "ok", None, WINDOW).unwrap();
        let assistant = store
            .append_message(s.id, Role::Assistant, "ok", None, WINDOW)
            .unwrap();
        assert!(!assistant.is_duplicate());

        let again = store
            .append_message(s.id, Role::Assistant, "ok", None, WINDOW)
            .unwrap();
        assert!(again.is_duplicate());
        assert_eq!(store.message_count(s.id).unwrap(), 2);
    }

    #[test]
    fn test_different_text_is_not_duplicate() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("diff").unwrap();
        store.append_message(s.id, Role::User, "a", None, WINDOW).unwrap();
        store.append_message(s.id, Role::User, "b", None, WINDOW).unwrap();
        // Only the immediately preceding message counts.
        let third = store.append_message(s.id, Role::User, "a", None, WINDOW).unwrap();
        assert!(!third.is_duplicate());
        assert_eq!(store.message_count(s.id).unwrap(), 3);
    }

    #[test]
    fn test_without_window_everything_is_stored() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("nodedup").unwrap();
        store.append_message(s.id, Role::User, "x", None, None).unwrap();
        store.append_message(s.id, Role::User, "x", None, None).unwrap();
        assert_eq!(store.message_count(s.id).unwrap(), 2);
    }

    #[test]
    fn test_recent_messages_chronological_and_limited() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("hist").unwrap();
        for i in 0..15 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store
                .append_message(s.id, role, &format!("m{i}"), Some(Stage::Tagged), None)
                .unwrap();
        }

        let recent = store.recent_messages(s.id, 10).unwrap();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].content, "m5");
        assert_eq!(recent[9].content, "m14");
        assert!(recent.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn test_pending_batch_and_history_split() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("batch").unwrap();

        let hi = store.append_message(s.id, Role::User, "hi", None, None).unwrap().id();
        store.claim_pending(s.id, hi).unwrap().unwrap();
        store.append_message(s.id, Role::Assistant, "hello!", None, None).unwrap();
        store.append_message(s.id, Role::User, "one", None, None).unwrap();
        let two = store.append_message(s.id, Role::User, "two", None, None).unwrap().id();

        let batch = store.claim_pending(s.id, two).unwrap().unwrap();
        let texts: Vec<&str> = batch.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert_eq!(batch.mark(), two);

        let history = store.messages_before(s.id, &batch.messages[0], 10).unwrap();
        let texts: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["hi", "hello!"]);
    }

    #[test]
    fn test_claimed_messages_are_not_claimed_twice() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("claims").unwrap();
        let first = store.append_message(s.id, Role::User, "first", None, None).unwrap().id();
        assert_eq!(store.claim_pending(s.id, first).unwrap().unwrap().messages.len(), 1);

        // The reply is not written yet; a later message is still pending alone.
        let second = store.append_message(s.id, Role::User, "second", None, None).unwrap().id();
        assert!(store.claim_pending(s.id, first).unwrap().is_none());
        let batch = store.claim_pending(s.id, second).unwrap().unwrap();
        let texts: Vec<&str> = batch.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["second"]);
        assert!(store.claim_pending(s.id, second).unwrap().is_none());
    }

    #[test]
    fn test_released_batch_is_pending_again() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("release").unwrap();
        let id = store.append_message(s.id, Role::User, "how much?", None, None).unwrap().id();
        assert_eq!(store.pending_user_message(s.id, "how much?").unwrap(), Some(id));

        let batch = store.claim_pending(s.id, id).unwrap().unwrap();
        assert_eq!(store.pending_user_message(s.id, "how much?").unwrap(), None);

        assert!(store.release_claim(s.id, &batch).unwrap());
        assert_eq!(store.pending_user_message(s.id, "how much?").unwrap(), Some(id));
        assert!(store.claim_pending(s.id, id).unwrap().is_some());
    }

    #[test]
    fn test_release_after_a_later_claim_is_a_no_op() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("late").unwrap();
        let a = store.append_message(s.id, Role::User, "a", None, None).unwrap().id();
        let stale = store.claim_pending(s.id, a).unwrap().unwrap();
        let b = store.append_message(s.id, Role::User, "b", None, None).unwrap().id();
        store.claim_pending(s.id, b).unwrap().unwrap();

        assert!(!store.release_claim(s.id, &stale).unwrap());
        assert_eq!(store.pending_user_message(s.id, "b").unwrap(), None);
    }

    #[test]
    fn test_revert_welcome() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("revert").unwrap();
        store.append_message(s.id, Role::User, "Ciao", Some(Stage::NewLead), None).unwrap();
        store.update_session_stage(s.id, Stage::Tagged).unwrap();
        let welcome = store
            .append_message(s.id, Role::Assistant, "Welcome!", Some(Stage::Tagged), None)
            .unwrap()
            .id();
        store
            .record_transition(s.id, Some(Stage::NewLead), Stage::Tagged, Some(welcome), 1.0)
            .unwrap();
        assert!(store.has_assistant_message(s.id).unwrap());

        store.revert_welcome(s.id, welcome).unwrap();
        assert_eq!(store.get_session(s.id).unwrap().stage, Stage::NewLead);
        assert!(store.list_transitions(s.id).unwrap().is_empty());
        assert!(!store.has_assistant_message(s.id).unwrap());
        assert_eq!(store.message_count(s.id).unwrap(), 1);
    }

    #[test]
    fn test_stage_update_sets_finished_at_terminal() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("stage").unwrap();

        store.update_session_stage(s.id, Stage::LinkToSend).unwrap();
        assert!(!store.get_session(s.id).unwrap().finished);

        store.update_session_stage(s.id, Stage::LinkSent).unwrap();
        let after = store.get_session(s.id).unwrap();
        assert_eq!(after.stage, Stage::LinkSent);
        assert!(after.finished);
    }

    #[test]
    fn test_batch_flag_set_and_cleared_together() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("flag").unwrap();
        let stale = Duration::from_secs(300);

        assert!(store.try_begin_batch(s.id, stale).unwrap());
        let waiting = store.get_session(s.id).unwrap();
        assert!(waiting.batch_waiting);
        assert!(waiting.batch_started_at.is_some());

        // A live window is not taken over.
        assert!(!store.try_begin_batch(s.id, stale).unwrap());

        store.end_batch(s.id).unwrap();
        let cleared = store.get_session(s.id).unwrap();
        assert!(!cleared.batch_waiting);
        assert!(cleared.batch_started_at.is_none());
    }

    #[test]
    fn test_stale_batch_flag_is_taken_over() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("stale").unwrap();

        assert!(store.try_begin_batch(s.id, Duration::from_secs(300)).unwrap());
        // Everything counts as stale with a zero threshold.
        assert!(store.try_begin_batch(s.id, Duration::ZERO).unwrap());
    }

    #[test]
    fn test_transitions_and_monotonic_check() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("mono").unwrap();
        let m = store
            .append_message(s.id, Role::Assistant, "welcome", Some(Stage::Tagged), None)
            .unwrap();

        store
            .record_transition(s.id, Some(Stage::NewLead), Stage::Tagged, Some(m.id()), 1.0)
            .unwrap();
        store
            .record_transition(s.id, Some(Stage::Tagged), Stage::LinkToSend, None, 0.8)
            .unwrap();
        assert!(store.verify_monotonic_transitions(s.id).is_ok());

        let rows = store.list_transitions(s.id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].trigger_message_id, Some(m.id()));

        // A row written behind the guard's back is caught.
        let bad = store
            .record_transition(s.id, Some(Stage::LinkToSend), Stage::Qualified, None, 0.9)
            .unwrap();
        match store.verify_monotonic_transitions(s.id) {
            Err(StoreError::NonMonotonic { transition_id, .. }) => assert_eq!(transition_id, bad),
            other => panic!("expected NonMonotonic, got {other:?}"),
        }
    }

    #[test]
    fn test_transition_to_same_stage_rejected_by_schema() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("same").unwrap();
        let res = store.record_transition(s.id, Some(Stage::Tagged), Stage::Tagged, None, 0.9);
        assert!(matches!(res, Err(StoreError::Db(_))));
    }

    #[test]
    fn test_task_lifecycle() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("task").unwrap();

        let task = store
            .create_task(&NewTask {
                session_id: Some(s.id),
                title: "Price question".into(),
                description: "Lead asks for a discount".into(),
                assigned_to: None,
                metadata: serde_json::json!({"stage": "qualified"}),
            })
            .unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert!(!task.completed);
        assert_eq!(store.open_tasks(s.id).unwrap().len(), 1);

        let in_progress = store
            .update_task_status(task.id, TaskStatus::InProgress, Some("anna"))
            .unwrap()
            .unwrap();
        assert_eq!(in_progress.assigned_to.as_deref(), Some("anna"));
        assert!(!in_progress.completed);
        assert_eq!(store.open_tasks(s.id).unwrap().len(), 1);

        let closed = store
            .update_task_status(task.id, TaskStatus::Closed, None)
            .unwrap()
            .unwrap();
        assert!(closed.completed);
        assert_eq!(closed.assigned_to.as_deref(), Some("anna"));
        assert!(store.open_tasks(s.id).unwrap().is_empty());

        assert!(store.list_tasks(false, 10).unwrap().is_empty());
        assert_eq!(store.list_tasks(true, 10).unwrap().len(), 1);
        assert!(store.update_task_status(999, TaskStatus::Closed, None).unwrap().is_none());
    }

    #[test]
    fn test_merge_session_info() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("info").unwrap();

        let mut facts = Map::new();
        facts.insert("name".into(), Value::String("Giulia".into()));
        store.merge_session_info(s.id, &facts).unwrap();

        let mut more = Map::new();
        more.insert("age".into(), Value::from(34));
        store.merge_session_info(s.id, &more).unwrap();

        let info = store.get_session(s.id).unwrap().info;
        assert_eq!(info["name"], "Giulia");
        assert_eq!(info["age"], 34);
    }

    #[test]
    fn test_list_sessions_with_counts() {
        let (_dir, store) = temp_store();
        let (a, _) = store.get_or_create_session("a").unwrap();
        store.get_or_create_session("b").unwrap();
        store.append_message(a.id, Role::User, "hey", None, None).unwrap();

        let sessions = store.list_sessions(10).unwrap();
        assert_eq!(sessions.len(), 2);
        let a_row = sessions.iter().find(|s| s.session.external_id == "a").unwrap();
        assert_eq!(a_row.message_count, 1);
        assert_eq!(a_row.open_tasks, 0);
    }

    #[test]
    fn test_message_notes() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("notes").unwrap();
        let m = store
            .append_message(s.id, Role::Assistant, "Here is the link", Some(Stage::LinkSent), None)
            .unwrap();

        store.add_message_note(m.id(), Some(5), "Great close", Some("lead-coach")).unwrap();
        let notes = store.notes_for_session(s.id).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].rating, Some(5));

        assert!(store.add_message_note(m.id(), Some(9), "off scale", None).is_err());
    }

    #[test]
    fn test_session_notes() {
        let (_dir, store) = temp_store();
        let (s, _) = store.get_or_create_session("sess-notes").unwrap();
        store.add_session_note(s.id, "Called back, prefers evenings", Some("anna")).unwrap();
        store.add_session_note(s.id, "Sent brochure", None).unwrap();

        let notes = store.session_notes(s.id).unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].author.as_deref(), Some("anna"));
        assert_eq!(notes[1].note, "Sent brochure");
        assert!(store.add_session_note(9999, "nobody", None).is_err());
    }

    #[test]
    fn test_in_memory_store() {
        let store = ConversationStore::in_memory().unwrap();
        let (s, created) = store.get_or_create_session("mem").unwrap();
        assert!(created);
        assert_eq!(s.stage, Stage::NewLead);
    }
}
