//! Durable state: conversations, turns, the audit trail, code-generation
//! records, webhook delivery claims and ancillary records.
//!
//! The store is the only state shared between deliveries, so it owns the
//! concurrency guarantees: one conversation per (repo, issue) via a UNIQUE
//! constraint, a per-conversation lease, and version-checked transitions.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use crate::error::{Error, Result};
use crate::models::{
    AgentAction, Analysis, CodeGenerationRecord, CodeGenerationStatus, Conversation,
    ConversationStatus, FileChange, NewAgentAction, NewConversation, TestFile, Transition, Turn,
};

/// Result of trying to claim a webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClaim {
    /// This caller owns the delivery and must finish it.
    New,
    /// Already seen; do nothing.
    Duplicate(DeliveryState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    InProgress,
    Completed,
    Failed,
}

impl DeliveryState {
    fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::InProgress => "in_progress",
            DeliveryState::Completed => "completed",
            DeliveryState::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(DeliveryState::InProgress),
            "completed" => Ok(DeliveryState::Completed),
            "failed" => Ok(DeliveryState::Failed),
            other => Err(Error::Store(format!("unknown delivery state: {other}"))),
        }
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Get-or-create keyed by (repo, issue number). The flag is true when
    /// this call inserted the row.
    async fn create_conversation(&self, new: &NewConversation) -> Result<(Conversation, bool)>;

    async fn get_conversation(&self, repo: &str, issue_number: u64)
    -> Result<Option<Conversation>>;

    async fn get_conversation_by_id(&self, id: &str) -> Result<Option<Conversation>>;

    /// Unconditional status write. Transitions made by the orchestrator go
    /// through [`ConversationStore::commit_transition`] instead.
    async fn update_conversation_status(&self, id: &str, status: ConversationStatus)
    -> Result<()>;

    async fn update_conversation_analysis(&self, id: &str, analysis: &Analysis) -> Result<()>;

    /// Apply `transition` only if the conversation is still at
    /// `expected_version`. Fails with `VersionConflict` otherwise.
    async fn commit_transition(
        &self,
        id: &str,
        expected_version: i64,
        transition: &Transition,
    ) -> Result<Conversation>;

    /// Take (or renew) the conversation lease. Returns false if another
    /// owner holds an unexpired lease.
    async fn acquire_lease(&self, id: &str, owner: &str, ttl: Duration) -> Result<bool>;

    async fn release_lease(&self, id: &str, owner: &str) -> Result<()>;

    /// Append a response to a turn. Returns false if this comment was
    /// already recorded.
    async fn record_turn_response(
        &self,
        conversation_id: &str,
        turn_number: u32,
        comment_id: u64,
        body: &str,
    ) -> Result<bool>;

    async fn log_agent_action(&self, action: &NewAgentAction) -> Result<i64>;

    async fn list_agent_actions(&self, conversation_id: &str) -> Result<Vec<AgentAction>>;

    /// Create a record in status `generated`.
    async fn create_code_generation(
        &self,
        conversation_id: &str,
        branch: &str,
        files: &[FileChange],
        tests: &[TestFile],
    ) -> Result<CodeGenerationRecord>;

    /// Move a `generated` record to its terminal status. Happens once.
    async fn finish_code_generation(
        &self,
        id: &str,
        status: CodeGenerationStatus,
        pr_number: Option<u64>,
        error_message: Option<&str>,
    ) -> Result<()>;

    async fn get_code_generation(&self, id: &str) -> Result<Option<CodeGenerationRecord>>;

    async fn latest_code_generation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<CodeGenerationRecord>>;

    async fn list_code_generations(&self, conversation_id: &str)
    -> Result<Vec<CodeGenerationRecord>>;

    /// Claim a delivery id. Failed deliveries and in-progress claims older
    /// than `stale_after` can be claimed again.
    async fn claim_delivery(
        &self,
        delivery_id: &str,
        event: &str,
        stale_after: Duration,
    ) -> Result<DeliveryClaim>;

    async fn complete_delivery(&self, delivery_id: &str) -> Result<()>;

    async fn fail_delivery(&self, delivery_id: &str) -> Result<()>;

    /// Forget a claim so a redelivery is processed from scratch.
    async fn release_delivery(&self, delivery_id: &str) -> Result<()>;

    /// Delete finished delivery records older than `older_than`.
    async fn prune_deliveries(&self, older_than: Duration) -> Result<usize>;

    /// Fails if (collection, key) already exists.
    async fn insert_record(
        &self,
        collection: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()>;

    /// Returns false if there was nothing to update.
    async fn update_record(
        &self,
        collection: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<bool>;

    async fn get_record(&self, collection: &str, key: &str) -> Result<Option<serde_json::Value>>;

    async fn select_records(&self, collection: &str) -> Result<Vec<(String, serde_json::Value)>>;

    async fn delete_record(&self, collection: &str, key: &str) -> Result<bool>;
}

/// SQLite-backed store. Blocking rusqlite calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                id               TEXT PRIMARY KEY,
                issue_id         INTEGER NOT NULL,
                issue_number     INTEGER NOT NULL,
                repo             TEXT NOT NULL,
                title            TEXT NOT NULL DEFAULT '',
                body             TEXT NOT NULL DEFAULT '',
                status           TEXT NOT NULL,
                analysis_json    TEXT,
                version          INTEGER NOT NULL DEFAULT 0,
                lease_owner      TEXT,
                lease_expires_at INTEGER,
                created_at       INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL,
                UNIQUE (repo, issue_number)
            );

            CREATE TABLE IF NOT EXISTS turns (
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                number          INTEGER NOT NULL,
                questions_json  TEXT NOT NULL,
                created_at      INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, number)
            );

            CREATE TABLE IF NOT EXISTS turn_responses (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                turn_number     INTEGER NOT NULL,
                comment_id      INTEGER NOT NULL,
                body            TEXT NOT NULL,
                created_at      INTEGER NOT NULL,
                UNIQUE (conversation_id, comment_id)
            );

            CREATE TABLE IF NOT EXISTS agent_actions (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT,
                agent           TEXT NOT NULL,
                action          TEXT NOT NULL,
                payload_json    TEXT NOT NULL,
                created_at      INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_actions_conversation
                ON agent_actions(conversation_id, id);

            CREATE TABLE IF NOT EXISTS code_generations (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                branch          TEXT NOT NULL,
                pr_number       INTEGER,
                files_json      TEXT NOT NULL,
                tests_json      TEXT NOT NULL,
                status          TEXT NOT NULL,
                error_message   TEXT,
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_code_generations_conversation
                ON code_generations(conversation_id, created_at);

            CREATE TABLE IF NOT EXISTS deliveries (
                delivery_id TEXT PRIMARY KEY,
                event       TEXT NOT NULL,
                state       TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS records (
                collection  TEXT NOT NULL,
                key         TEXT NOT NULL,
                value_json  TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL,
                PRIMARY KEY (collection, key)
            );
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Store(format!("store task failed: {e}")))?
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", hex::encode(rand::random::<[u8; 8]>()))
}

const CONVERSATION_COLUMNS: &str = "id, issue_id, issue_number, repo, title, body, status, \
     analysis_json, version, created_at, updated_at";

struct ConversationRow {
    id: String,
    issue_id: i64,
    issue_number: i64,
    repo: String,
    title: String,
    body: String,
    status: String,
    analysis_json: Option<String>,
    version: i64,
    created_at: i64,
    updated_at: i64,
}

impl ConversationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            issue_id: row.get(1)?,
            issue_number: row.get(2)?,
            repo: row.get(3)?,
            title: row.get(4)?,
            body: row.get(5)?,
            status: row.get(6)?,
            analysis_json: row.get(7)?,
            version: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

fn load_conversation(conn: &Connection, row: ConversationRow) -> Result<Conversation> {
    let status = row.status.parse::<ConversationStatus>().map_err(Error::Store)?;
    let analysis = row
        .analysis_json
        .as_deref()
        .map(serde_json::from_str::<Analysis>)
        .transpose()?;
    let turns = load_turns(conn, &row.id)?;
    Ok(Conversation {
        id: row.id,
        issue_id: row.issue_id,
        issue_number: row.issue_number as u64,
        repo: row.repo,
        title: row.title,
        body: row.body,
        status,
        analysis,
        turns,
        version: row.version,
        created_at: from_millis(row.created_at),
        updated_at: from_millis(row.updated_at),
    })
}

fn load_turns(conn: &Connection, conversation_id: &str) -> Result<Vec<Turn>> {
    let mut stmt = conn.prepare(
        "SELECT number, questions_json, created_at FROM turns
         WHERE conversation_id = ?1 ORDER BY number",
    )?;
    let rows = stmt
        .query_map(params![conversation_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut resp_stmt = conn.prepare(
        "SELECT turn_number, body FROM turn_responses
         WHERE conversation_id = ?1 ORDER BY id",
    )?;
    let responses = resp_stmt
        .query_map(params![conversation_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(number, questions_json, created_at)| -> Result<Turn> {
            Ok(Turn {
                number: number as u32,
                questions: serde_json::from_str(&questions_json)?,
                responses: responses
                    .iter()
                    .filter(|(n, _)| *n == number)
                    .map(|(_, body)| body.clone())
                    .collect(),
                created_at: from_millis(created_at),
            })
        })
        .collect()
}

fn select_by_id(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1");
    let row = conn
        .query_row(&sql, params![id], ConversationRow::from_row)
        .optional()?;
    row.map(|row| load_conversation(conn, row)).transpose()
}

fn select_by_key(conn: &Connection, repo: &str, issue_number: u64) -> Result<Option<Conversation>> {
    let sql = format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE repo = ?1 AND issue_number = ?2"
    );
    let row = conn
        .query_row(
            &sql,
            params![repo, issue_number as i64],
            ConversationRow::from_row,
        )
        .optional()?;
    row.map(|row| load_conversation(conn, row)).transpose()
}

fn conversation_exists(conn: &Connection, id: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM conversations WHERE id = ?1",
            params![id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

const CODE_GENERATION_COLUMNS: &str = "id, conversation_id, branch, pr_number, files_json, \
     tests_json, status, error_message, created_at, updated_at";

fn code_generation_from_row(row: &Row<'_>) -> rusqlite::Result<CodeGenerationRow> {
    Ok(CodeGenerationRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        branch: row.get(2)?,
        pr_number: row.get(3)?,
        files_json: row.get(4)?,
        tests_json: row.get(5)?,
        status: row.get(6)?,
        error_message: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

struct CodeGenerationRow {
    id: String,
    conversation_id: String,
    branch: String,
    pr_number: Option<i64>,
    files_json: String,
    tests_json: String,
    status: String,
    error_message: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<CodeGenerationRow> for CodeGenerationRecord {
    type Error = Error;

    fn try_from(row: CodeGenerationRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            conversation_id: row.conversation_id,
            branch: row.branch,
            pr_number: row.pr_number.map(|n| n as u64),
            files: serde_json::from_str(&row.files_json)?,
            tests: serde_json::from_str(&row.tests_json)?,
            status: row.status.parse().map_err(Error::Store)?,
            error_message: row.error_message,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create_conversation(&self, new: &NewConversation) -> Result<(Conversation, bool)> {
        let new = new.clone();
        self.run(move |conn| {
            let now = now_millis();
            let id = new_id("conv");
            let inserted = conn.execute(
                "INSERT INTO conversations
                     (id, issue_id, issue_number, repo, title, body, status, version,
                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)
                 ON CONFLICT (repo, issue_number) DO NOTHING",
                params![
                    id,
                    new.issue_id,
                    new.issue_number as i64,
                    new.repo,
                    new.title,
                    new.body,
                    ConversationStatus::Analyzing.as_str(),
                    now,
                ],
            )?;
            let conversation = select_by_key(conn, &new.repo, new.issue_number)?.ok_or_else(
                || Error::Store(format!("conversation {}#{} vanished", new.repo, new.issue_number)),
            )?;
            Ok((conversation, inserted == 1))
        })
        .await
    }

    async fn get_conversation(
        &self,
        repo: &str,
        issue_number: u64,
    ) -> Result<Option<Conversation>> {
        let repo = repo.to_string();
        self.run(move |conn| select_by_key(conn, &repo, issue_number))
            .await
    }

    async fn get_conversation_by_id(&self, id: &str) -> Result<Option<Conversation>> {
        let id = id.to_string();
        self.run(move |conn| select_by_id(conn, &id))
            .await
    }

    async fn update_conversation_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            let n = conn.execute(
                "UPDATE conversations SET status = ?2, version = version + 1, updated_at = ?3
                 WHERE id = ?1",
                params![id, status.as_str(), now_millis()],
            )?;
            if n == 0 {
                return Err(Error::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn update_conversation_analysis(&self, id: &str, analysis: &Analysis) -> Result<()> {
        let id = id.to_string();
        let json = serde_json::to_string(analysis)?;
        self.run(move |conn| {
            let n = conn.execute(
                "UPDATE conversations SET analysis_json = ?2, version = version + 1,
                        updated_at = ?3
                 WHERE id = ?1",
                params![id, json, now_millis()],
            )?;
            if n == 0 {
                return Err(Error::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn commit_transition(
        &self,
        id: &str,
        expected_version: i64,
        transition: &Transition,
    ) -> Result<Conversation> {
        let id = id.to_string();
        let status = transition.status;
        let analysis_json = transition
            .analysis
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let questions_json = transition
            .new_turn
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_millis();
            let n = tx.execute(
                "UPDATE conversations
                 SET status = ?3,
                     analysis_json = COALESCE(?4, analysis_json),
                     version = version + 1,
                     updated_at = ?5
                 WHERE id = ?1 AND version = ?2",
                params![id, expected_version, status.as_str(), analysis_json, now],
            )?;
            if n == 0 {
                if conversation_exists(&tx, &id)? {
                    return Err(Error::VersionConflict {
                        id,
                        expected: expected_version,
                    });
                }
                return Err(Error::NotFound(format!("conversation {id}")));
            }

            if let Some(questions_json) = questions_json {
                let next: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(number), 0) + 1 FROM turns WHERE conversation_id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO turns (conversation_id, number, questions_json, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, next, questions_json, now],
                )?;
            }

            let conversation = select_by_id(&tx, &id)?
                .ok_or_else(|| Error::NotFound(format!("conversation {id}")))?;
            tx.commit()?;
            Ok(conversation)
        })
        .await
    }

    async fn acquire_lease(&self, id: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let id = id.to_string();
        let owner = owner.to_string();
        self.run(move |conn| {
            let now = now_millis();
            let n = conn.execute(
                "UPDATE conversations SET lease_owner = ?2, lease_expires_at = ?3
                 WHERE id = ?1
                   AND (lease_owner IS NULL OR lease_owner = ?2 OR lease_expires_at <= ?4)",
                params![id, owner, now.saturating_add(duration_millis(ttl)), now],
            )?;
            if n == 0 && !conversation_exists(conn, &id)? {
                return Err(Error::NotFound(format!("conversation {id}")));
            }
            Ok(n == 1)
        })
        .await
    }

    async fn release_lease(&self, id: &str, owner: &str) -> Result<()> {
        let id = id.to_string();
        let owner = owner.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE conversations SET lease_owner = NULL, lease_expires_at = NULL
                 WHERE id = ?1 AND lease_owner = ?2",
                params![id, owner],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_turn_response(
        &self,
        conversation_id: &str,
        turn_number: u32,
        comment_id: u64,
        body: &str,
    ) -> Result<bool> {
        let conversation_id = conversation_id.to_string();
        let body = body.to_string();
        self.run(move |conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO turn_responses
                     (conversation_id, turn_number, comment_id, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation_id,
                    turn_number as i64,
                    comment_id as i64,
                    body,
                    now_millis()
                ],
            )?;
            Ok(n == 1)
        })
        .await
    }

    async fn log_agent_action(&self, action: &NewAgentAction) -> Result<i64> {
        let action = action.clone();
        let payload = serde_json::to_string(&action.payload)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO agent_actions (conversation_id, agent, action, payload_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    action.conversation_id,
                    action.agent,
                    action.action,
                    payload,
                    now_millis()
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn list_agent_actions(&self, conversation_id: &str) -> Result<Vec<AgentAction>> {
        let conversation_id = conversation_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, agent, action, payload_json, created_at
                 FROM agent_actions WHERE conversation_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![conversation_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(id, conversation_id, agent, action, payload, created_at)| -> Result<AgentAction> {
                    Ok(AgentAction {
                        id,
                        conversation_id,
                        agent,
                        action,
                        payload: serde_json::from_str(&payload)?,
                        created_at: from_millis(created_at),
                    })
                })
                .collect()
        })
        .await
    }

    async fn create_code_generation(
        &self,
        conversation_id: &str,
        branch: &str,
        files: &[FileChange],
        tests: &[TestFile],
    ) -> Result<CodeGenerationRecord> {
        let conversation_id = conversation_id.to_string();
        let branch = branch.to_string();
        let files_json = serde_json::to_string(files)?;
        let tests_json = serde_json::to_string(tests)?;
        self.run(move |conn| {
            let id = new_id("gen");
            conn.execute(
                "INSERT INTO code_generations
                     (id, conversation_id, branch, files_json, tests_json, status,
                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    id,
                    conversation_id,
                    branch,
                    files_json,
                    tests_json,
                    CodeGenerationStatus::Generated.as_str(),
                    now_millis()
                ],
            )?;
            let sql = format!("SELECT {CODE_GENERATION_COLUMNS} FROM code_generations WHERE id = ?1");
            let row = conn.query_row(&sql, params![id], code_generation_from_row)?;
            CodeGenerationRecord::try_from(row)
        })
        .await
    }

    async fn finish_code_generation(
        &self,
        id: &str,
        status: CodeGenerationStatus,
        pr_number: Option<u64>,
        error_message: Option<&str>,
    ) -> Result<()> {
        if status == CodeGenerationStatus::Generated {
            return Err(Error::Store(
                "code generation must finish in a terminal status".into(),
            ));
        }
        let id = id.to_string();
        let error_message = error_message.map(str::to_string);
        self.run(move |conn| {
            let n = conn.execute(
                "UPDATE code_generations
                 SET status = ?2, pr_number = ?3, error_message = ?4, updated_at = ?5
                 WHERE id = ?1 AND status = 'generated'",
                params![
                    id,
                    status.as_str(),
                    pr_number.map(|n| n as i64),
                    error_message,
                    now_millis()
                ],
            )?;
            if n == 0 {
                return Err(Error::Store(format!(
                    "code generation {id} is missing or already finished"
                )));
            }
            Ok(())
        })
        .await
    }

    async fn get_code_generation(&self, id: &str) -> Result<Option<CodeGenerationRecord>> {
        let id = id.to_string();
        self.run(move |conn| {
            let sql = format!("SELECT {CODE_GENERATION_COLUMNS} FROM code_generations WHERE id = ?1");
            conn.query_row(&sql, params![id], code_generation_from_row)
                .optional()?
                .map(CodeGenerationRecord::try_from)
                .transpose()
        })
        .await
    }

    async fn latest_code_generation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<CodeGenerationRecord>> {
        Ok(self
            .list_code_generations(conversation_id)
            .await?
            .into_iter()
            .last())
    }

    async fn list_code_generations(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<CodeGenerationRecord>> {
        let conversation_id = conversation_id.to_string();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {CODE_GENERATION_COLUMNS} FROM code_generations
                 WHERE conversation_id = ?1 ORDER BY created_at, rowid"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![conversation_id], code_generation_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(CodeGenerationRecord::try_from).collect()
        })
        .await
    }

    async fn claim_delivery(
        &self,
        delivery_id: &str,
        event: &str,
        stale_after: Duration,
    ) -> Result<DeliveryClaim> {
        let delivery_id = delivery_id.to_string();
        let event = event.to_string();
        self.run(move |conn| {
            let now = now_millis();
            let stale_before = now.saturating_sub(duration_millis(stale_after));
            let claimed = conn.execute(
                "INSERT INTO deliveries (delivery_id, event, state, created_at, updated_at)
                 VALUES (?1, ?2, 'in_progress', ?3, ?3)
                 ON CONFLICT (delivery_id) DO UPDATE
                 SET state = 'in_progress', updated_at = excluded.updated_at
                 WHERE deliveries.state = 'failed'
                    OR (deliveries.state = 'in_progress' AND deliveries.updated_at < ?4)",
                params![delivery_id, event, now, stale_before],
            )?;
            if claimed == 1 {
                return Ok(DeliveryClaim::New);
            }
            let state: String = conn.query_row(
                "SELECT state FROM deliveries WHERE delivery_id = ?1",
                params![delivery_id],
                |row| row.get(0),
            )?;
            Ok(DeliveryClaim::Duplicate(DeliveryState::parse(&state)?))
        })
        .await
    }

    async fn complete_delivery(&self, delivery_id: &str) -> Result<()> {
        self.set_delivery_state(delivery_id, DeliveryState::Completed)
            .await
    }

    async fn fail_delivery(&self, delivery_id: &str) -> Result<()> {
        self.set_delivery_state(delivery_id, DeliveryState::Failed)
            .await
    }

    async fn release_delivery(&self, delivery_id: &str) -> Result<()> {
        let delivery_id = delivery_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM deliveries WHERE delivery_id = ?1",
                params![delivery_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn prune_deliveries(&self, older_than: Duration) -> Result<usize> {
        self.run(move |conn| {
            let cutoff = now_millis().saturating_sub(duration_millis(older_than));
            Ok(conn.execute(
                "DELETE FROM deliveries WHERE state != 'in_progress' AND updated_at < ?1",
                params![cutoff],
            )?)
        })
        .await
    }

    async fn insert_record(
        &self,
        collection: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let collection = collection.to_string();
        let key = key.to_string();
        let json = serde_json::to_string(value)?;
        self.run(move |conn| {
            let now = now_millis();
            let n = conn.execute(
                "INSERT OR IGNORE INTO records (collection, key, value_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![collection, key, json, now],
            )?;
            if n == 0 {
                return Err(Error::Store(format!("record {collection}/{key} already exists")));
            }
            Ok(())
        })
        .await
    }

    async fn update_record(
        &self,
        collection: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<bool> {
        let collection = collection.to_string();
        let key = key.to_string();
        let json = serde_json::to_string(value)?;
        self.run(move |conn| {
            let n = conn.execute(
                "UPDATE records SET value_json = ?3, updated_at = ?4
                 WHERE collection = ?1 AND key = ?2",
                params![collection, key, json, now_millis()],
            )?;
            Ok(n == 1)
        })
        .await
    }

    async fn get_record(&self, collection: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let collection = collection.to_string();
        let key = key.to_string();
        self.run(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM records WHERE collection = ?1 AND key = ?2",
                    params![collection, key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
        })
        .await
    }

    async fn select_records(&self, collection: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let collection = collection.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value_json FROM records WHERE collection = ?1 ORDER BY key",
            )?;
            let rows = stmt
                .query_map(params![collection], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(key, json)| -> Result<(String, serde_json::Value)> {
                    Ok((key, serde_json::from_str(&json)?))
                })
                .collect()
        })
        .await
    }

    async fn delete_record(&self, collection: &str, key: &str) -> Result<bool> {
        let collection = collection.to_string();
        let key = key.to_string();
        self.run(move |conn| {
            let n = conn.execute(
                "DELETE FROM records WHERE collection = ?1 AND key = ?2",
                params![collection, key],
            )?;
            Ok(n == 1)
        })
        .await
    }
}

impl SqliteStore {
    async fn set_delivery_state(&self, delivery_id: &str, state: DeliveryState) -> Result<()> {
        let delivery_id = delivery_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE deliveries SET state = ?2, updated_at = ?3 WHERE delivery_id = ?1",
                params![delivery_id, state.as_str(), now_millis()],
            )?;
            Ok(())
        })
        .await
    }
}
