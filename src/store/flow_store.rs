// src/store/flow_store.rs
//! Durable flow store backed by SQLite
//!
//! The store is the only channel between the capture process and the control
//! process. Each operation runs as a single transaction; read-modify-write
//! operations use `BEGIN IMMEDIATE` so the write lock is taken up front and
//! two processes can never interleave inside one operation.
//!
//! Statements run on the blocking thread pool, each on a connection of its
//! own. A caller stuck in `busy_timeout` therefore never holds up the others.

use crate::store::models::{
    from_micros, to_micros, AppliedCommand, CommandOutcome, FlowId, FlowRecord, FlowState,
    FlowUpdate, PendingCommand, PendingFlow, Resolution,
};
use crate::store::schema::{configure_connection, enable_wal, init_schema, INTERCEPT_MODE_KEY};
use crate::utils::config::StoreConfig;
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinError};
use tracing::{debug, info};

const FLOW_COLUMNS: &str = "flow_id, seq, method, host, port, path, request, response, status, \
     state, edited, note, captured_at, decided_at, completed_at";

/// Idle connections kept open for reuse
const MAX_IDLE_CONNECTIONS: usize = 8;

/// Handle to one session's flow database
#[derive(Clone)]
pub struct FlowStore {
    path: PathBuf,
    pool: Arc<ConnectionPool>,
}

struct ConnectionPool {
    path: PathBuf,
    busy_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl ConnectionPool {
    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(|e| {
            EngineError::StoreUnavailable(format!("Failed to open {}: {}", self.path.display(), e))
        })?;
        configure_connection(&conn, self.busy_timeout)?;
        Ok(conn)
    }

    fn checkout(&self) -> Result<Connection> {
        let idle = self.idle.lock().pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self.connect(),
        }
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }
}

impl FlowStore {
    /// Open (and create if needed) the store described by `config`
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        Self::open_path(&config.path, Duration::from_millis(config.busy_timeout_ms)).await
    }

    /// Open the store at `path`
    pub async fn open_path(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            path: path.clone(),
            pool: Arc::new(ConnectionPool {
                path,
                busy_timeout,
                idle: Mutex::new(Vec::new()),
            }),
        };

        store
            .with_conn(|conn| {
                enable_wal(conn)?;
                init_schema(conn)
            })
            .await?;

        info!("Flow store opened at {:?}", store.path);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let mut conn = pool.checkout()?;
            let result = f(&mut conn);
            pool.checkin(conn);
            result
        })
        .await
        .map_err(map_join_err)?
    }

    /// Insert a new flow record; returns its arrival sequence number
    pub async fn create_flow(&self, record: &FlowRecord) -> Result<i64> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO flows (flow_id, method, host, port, path, request, response,
                                   status, state, edited, note, captured_at, decided_at,
                                   completed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                "#,
                params![
                    record.flow_id.as_str(),
                    record.method,
                    record.host,
                    record.port,
                    record.path,
                    record.request.as_ref(),
                    record.response.as_deref(),
                    record.status,
                    record.state.as_str(),
                    record.edited,
                    record.note,
                    to_micros(&record.captured_at),
                    record.decided_at.as_ref().map(to_micros),
                    record.completed_at.as_ref().map(to_micros),
                ],
            )?;
            let seq = conn.last_insert_rowid();
            debug!("Created flow {} (seq {})", record.flow_id, seq);
            Ok(seq)
        })
        .await
    }

    /// Apply a partial update; fields left `None` keep their stored value.
    /// Returns false when no record exists for `flow_id`.
    pub async fn update_flow(&self, flow_id: &FlowId, update: FlowUpdate) -> Result<bool> {
        let flow_id = flow_id.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                r#"
                UPDATE flows
                SET request      = COALESCE(?1, request),
                    response     = COALESCE(?2, response),
                    status       = COALESCE(?3, status),
                    note         = COALESCE(?4, note),
                    completed_at = COALESCE(?5, completed_at)
                WHERE flow_id = ?6
                "#,
                params![
                    update.request.as_deref(),
                    update.response.as_deref(),
                    update.status,
                    update.note,
                    update.completed_at.as_ref().map(to_micros),
                    flow_id.as_str(),
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Move a captured flow into the pending set. Returns false if the flow
    /// was not in `Captured`, so a flow enters the pending set at most once.
    pub async fn mark_pending(&self, flow_id: &FlowId) -> Result<bool> {
        let flow_id = flow_id.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE flows SET state = ?1 WHERE flow_id = ?2 AND state = ?3",
                params![
                    FlowState::PendingIntercept.as_str(),
                    flow_id.as_str(),
                    FlowState::Captured.as_str(),
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Fetch one record
    pub async fn get_flow(&self, flow_id: &FlowId) -> Result<Option<FlowRecord>> {
        let flow_id = flow_id.clone();
        self.with_conn(move |conn| select_flow(conn, &flow_id)).await
    }

    /// Flows currently pending interception, in arrival order
    pub async fn list_pending(&self) -> Result<Vec<PendingFlow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT flow_id, seq, method, host, path, captured_at, note
                FROM flows
                WHERE state = ?1
                ORDER BY seq
                "#,
            )?;
            let pending = stmt
                .query_map(params![FlowState::PendingIntercept.as_str()], |row| {
                    Ok(PendingFlow {
                        flow_id: FlowId::from(row.get::<_, String>(0)?),
                        seq: row.get(1)?,
                        method: row.get(2)?,
                        host: row.get(3)?,
                        path: row.get(4)?,
                        captured_at: from_micros(row.get(5)?),
                        note: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(pending)
        })
        .await
    }

    /// Read the intercept-mode flag
    pub async fn intercept_mode(&self) -> Result<bool> {
        self.with_conn(|conn| {
            let value: Option<String> = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![INTERCEPT_MODE_KEY],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.as_deref() == Some("true"))
        })
        .await
    }

    /// Write the intercept-mode flag (last writer wins)
    pub async fn set_intercept_mode(&self, enabled: bool) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO settings (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
                params![INTERCEPT_MODE_KEY, if enabled { "true" } else { "false" }],
            )?;
            Ok(())
        })
        .await
    }

    /// Queue a command for a pending flow.
    ///
    /// A queued command is immutable until it is applied or its edit is
    /// rejected: a second command while one is outstanding, or any command
    /// for a terminal flow, is a no-op.
    pub async fn issue_command(
        &self,
        flow_id: &FlowId,
        command: &PendingCommand,
    ) -> Result<CommandOutcome> {
        let flow_id = flow_id.clone();
        let command = command.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let state = flow_state(&tx, &flow_id)?
                .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))?;

            if state.is_terminal() {
                debug!("Ignoring {} for terminal flow {}", command.kind(), flow_id);
                return Ok(CommandOutcome::AlreadyTerminal);
            }
            if state != FlowState::PendingIntercept {
                return Err(EngineError::FlowNotPending(flow_id.to_string()));
            }

            let existing: Option<Option<i64>> = tx
                .query_row(
                    "SELECT rejected_at FROM pending_commands WHERE flow_id = ?1",
                    params![flow_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            match existing {
                Some(None) => return Ok(CommandOutcome::AlreadyQueued),
                // The previous edit was rejected; the slot is free again
                Some(Some(_)) => {
                    tx.execute(
                        "DELETE FROM pending_commands WHERE flow_id = ?1",
                        params![flow_id.as_str()],
                    )?;
                }
                None => {}
            }

            let edited = match &command {
                PendingCommand::Forward { edited } => edited.as_deref(),
                PendingCommand::Drop => None,
            };
            tx.execute(
                r#"
                INSERT INTO pending_commands (flow_id, kind, edited, issued_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![flow_id.as_str(), command.kind(), edited, to_micros(&Utc::now())],
            )?;
            tx.commit()?;

            debug!("Queued {} for flow {}", command.kind(), flow_id);
            Ok(CommandOutcome::Queued)
        })
        .await
    }

    /// Atomically read and mark consumed the outstanding command for a flow.
    ///
    /// Consumption only becomes final together with the flow's terminal
    /// transition: while the flow is still pending, [`FlowStore::ready_commands`]
    /// keeps offering the command so an interrupted consumer cannot lose it.
    pub async fn consume_command(&self, flow_id: &FlowId) -> Result<Option<PendingCommand>> {
        let flow_id = flow_id.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let row: Option<(String, Option<Vec<u8>>)> = tx
                .query_row(
                    r#"
                    SELECT kind, edited FROM pending_commands
                    WHERE flow_id = ?1 AND consumed_at IS NULL AND rejected_at IS NULL
                    "#,
                    params![flow_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((kind, edited)) = row else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE pending_commands SET consumed_at = ?1 WHERE flow_id = ?2",
                params![to_micros(&Utc::now()), flow_id.as_str()],
            )?;
            tx.commit()?;

            Ok(Some(command_from_row(&kind, edited)?))
        })
        .await
    }

    /// Apply the outstanding command of a pending flow in one transaction.
    ///
    /// `decide` turns the command into a terminal transition. An edit
    /// rejection it returns is recorded on the flow and frees the command
    /// slot; any other error aborts without changing anything. Returns
    /// `None` when there is no command to apply or the flow is no longer
    /// pending.
    pub async fn apply_command<F>(&self, flow_id: &FlowId, decide: F) -> Result<Option<AppliedCommand>>
    where
        F: FnOnce(&FlowRecord, PendingCommand) -> Result<Resolution> + Send + 'static,
    {
        let flow_id = flow_id.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let row: Option<(String, Option<Vec<u8>>)> = tx
                .query_row(
                    r#"
                    SELECT c.kind, c.edited
                    FROM pending_commands c
                    JOIN flows f ON f.flow_id = c.flow_id
                    WHERE c.flow_id = ?1 AND c.rejected_at IS NULL AND f.state = ?2
                    "#,
                    params![flow_id.as_str(), FlowState::PendingIntercept.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((kind, edited)) = row else {
                return Ok(None);
            };
            let command = command_from_row(&kind, edited)?;
            let record = select_flow(&tx, &flow_id)?
                .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))?;

            let now = Utc::now();
            let applied = match decide(&record, command) {
                Ok(resolution) => {
                    resolve_in_tx(&tx, &flow_id, &resolution, None, now)?;
                    AppliedCommand::Resolved(resolution)
                }
                Err(e) if e.is_edit_rejection() => {
                    let reason = e.to_string();
                    tx.execute(
                        r#"
                        UPDATE pending_commands
                        SET rejected_at = ?1, consumed_at = COALESCE(consumed_at, ?1)
                        WHERE flow_id = ?2
                        "#,
                        params![to_micros(&now), flow_id.as_str()],
                    )?;
                    tx.execute(
                        "UPDATE flows SET note = ?1 WHERE flow_id = ?2",
                        params![format!("edit rejected: {}", reason), flow_id.as_str()],
                    )?;
                    AppliedCommand::Rejected(reason)
                }
                Err(e) => return Err(e),
            };
            tx.commit()?;

            Ok(Some(applied))
        })
        .await
    }

    /// Pending flows with a command that is neither applied nor rejected,
    /// in arrival order
    pub async fn ready_commands(&self) -> Result<Vec<FlowId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT c.flow_id
                FROM pending_commands c
                JOIN flows f ON f.flow_id = c.flow_id
                WHERE c.rejected_at IS NULL AND f.state = ?1
                ORDER BY f.seq
                "#,
            )?;
            let ids = stmt
                .query_map(params![FlowState::PendingIntercept.as_str()], |row| {
                    row.get::<_, String>(0).map(FlowId::from)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    /// Move a pending flow to its terminal state.
    ///
    /// Returns false when the flow is no longer pending, which makes a
    /// repeated or late decision a no-op. Any outstanding command for the
    /// flow is retired in the same transaction.
    pub async fn resolve_flow(
        &self,
        flow_id: &FlowId,
        resolution: &Resolution,
        note: Option<&str>,
    ) -> Result<bool> {
        let flow_id = flow_id.clone();
        let resolution = resolution.clone();
        let note = note.map(str::to_string);
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now();
            let changed = resolve_in_tx(&tx, &flow_id, &resolution, note.as_deref(), now)?;
            tx.commit()?;
            Ok(changed)
        })
        .await
    }

    /// Release every pending flow unmodified, in arrival order, in one
    /// transaction. Returns the released ids in that order.
    pub async fn release_all_pending(&self, note: Option<&str>) -> Result<Vec<FlowId>> {
        let note = note.map(str::to_string);
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let ids = {
                let mut stmt =
                    tx.prepare("SELECT flow_id FROM flows WHERE state = ?1 ORDER BY seq")?;
                let ids = stmt
                    .query_map(params![FlowState::PendingIntercept.as_str()], |row| {
                        row.get::<_, String>(0).map(FlowId::from)
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                ids
            };

            let release = Resolution::Released { request: None };
            let mut last: Option<DateTime<Utc>> = None;
            for id in &ids {
                // Decision timestamps never run backwards within one batch
                let now = match last {
                    Some(prev) => Utc::now().max(prev),
                    None => Utc::now(),
                };
                resolve_in_tx(&tx, id, &release, note.as_deref(), now)?;
                last = Some(now);
            }
            tx.commit()?;

            if !ids.is_empty() {
                info!("Bulk-released {} pending flows", ids.len());
            }
            Ok(ids)
        })
        .await
    }

    /// Record a response. A pass-through flow becomes `Complete`; flows in
    /// any other state keep their state. Returns false for unknown flows.
    pub async fn record_response(
        &self,
        flow_id: &FlowId,
        status: Option<u16>,
        response: Option<Bytes>,
    ) -> Result<bool> {
        let flow_id = flow_id.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                r#"
                UPDATE flows
                SET response     = COALESCE(?1, response),
                    status       = COALESCE(?2, status),
                    completed_at = ?3,
                    state        = CASE WHEN state = ?4 THEN ?5 ELSE state END
                WHERE flow_id = ?6
                "#,
                params![
                    response.as_deref(),
                    status,
                    to_micros(&Utc::now()),
                    FlowState::Captured.as_str(),
                    FlowState::Complete.as_str(),
                    flow_id.as_str(),
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Close out a flow whose exchange failed. Like a response, this moves a
    /// pass-through flow to `Complete`; other states are kept.
    pub async fn record_failure(&self, flow_id: &FlowId, note: &str) -> Result<bool> {
        let flow_id = flow_id.clone();
        let note = note.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                r#"
                UPDATE flows
                SET note         = ?1,
                    completed_at = COALESCE(completed_at, ?2),
                    state        = CASE WHEN state = ?3 THEN ?4 ELSE state END
                WHERE flow_id = ?5
                "#,
                params![
                    note,
                    to_micros(&Utc::now()),
                    FlowState::Captured.as_str(),
                    FlowState::Complete.as_str(),
                    flow_id.as_str(),
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Attach a note (edit rejection, failure reason) to a flow
    pub async fn record_note(&self, flow_id: &FlowId, note: &str) -> Result<bool> {
        self.update_flow(
            flow_id,
            FlowUpdate {
                note: Some(note.to_string()),
                ..Default::default()
            },
        )
        .await
    }
}

fn map_join_err(err: JoinError) -> EngineError {
    EngineError::StoreUnavailable(format!("store task failed: {}", err))
}

fn select_flow(conn: &Connection, flow_id: &FlowId) -> Result<Option<FlowRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {} FROM flows WHERE flow_id = ?1", FLOW_COLUMNS),
            params![flow_id.as_str()],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

fn command_from_row(kind: &str, edited: Option<Vec<u8>>) -> Result<PendingCommand> {
    PendingCommand::from_row(kind, edited)
        .ok_or_else(|| EngineError::StoreUnavailable(format!("Unknown command kind '{}'", kind)))
}

fn flow_state(conn: &Connection, flow_id: &FlowId) -> Result<Option<FlowState>> {
    let state: Option<String> = conn
        .query_row(
            "SELECT state FROM flows WHERE flow_id = ?1",
            params![flow_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    match state {
        None => Ok(None),
        Some(s) => FlowState::parse(&s)
            .map(Some)
            .ok_or_else(|| EngineError::StoreUnavailable(format!("Unknown flow state '{}'", s))),
    }
}

fn resolve_in_tx(
    conn: &Connection,
    flow_id: &FlowId,
    resolution: &Resolution,
    note: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let (request, edited) = match resolution {
        Resolution::Released { request } => (request.as_deref(), request.is_some()),
        Resolution::Dropped => (None, false),
    };
    // Dropped exchanges are answered immediately, so they complete at decision time
    let completed_at = matches!(resolution, Resolution::Dropped).then(|| to_micros(&now));

    let changed = conn.execute(
        r#"
        UPDATE flows
        SET state        = ?1,
            decided_at   = ?2,
            request      = COALESCE(?3, request),
            edited       = CASE WHEN ?4 THEN 1 ELSE edited END,
            note         = COALESCE(?5, note),
            completed_at = COALESCE(?6, completed_at)
        WHERE flow_id = ?7 AND state = ?8
        "#,
        params![
            resolution.state().as_str(),
            to_micros(&now),
            request,
            edited,
            note,
            completed_at,
            flow_id.as_str(),
            FlowState::PendingIntercept.as_str(),
        ],
    )?;

    if changed == 1 {
        conn.execute(
            "UPDATE pending_commands SET consumed_at = ?1 WHERE flow_id = ?2 AND consumed_at IS NULL",
            params![to_micros(&now), flow_id.as_str()],
        )?;
    }

    Ok(changed == 1)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<FlowRecord> {
    let state: String = row.get(9)?;
    let state = FlowState::parse(&state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            rusqlite::types::Type::Text,
            format!("unknown flow state '{}'", state).into(),
        )
    })?;

    Ok(FlowRecord {
        flow_id: FlowId::from(row.get::<_, String>(0)?),
        seq: row.get(1)?,
        method: row.get(2)?,
        host: row.get(3)?,
        port: row.get(4)?,
        path: row.get(5)?,
        request: Bytes::from(row.get::<_, Vec<u8>>(6)?),
        response: row.get::<_, Option<Vec<u8>>>(7)?.map(Bytes::from),
        status: row.get(8)?,
        state,
        edited: row.get(10)?,
        note: row.get(11)?,
        captured_at: from_micros(row.get(12)?),
        decided_at: row.get::<_, Option<i64>>(13)?.map(from_micros),
        completed_at: row.get::<_, Option<i64>>(14)?.map(from_micros),
    })
}
