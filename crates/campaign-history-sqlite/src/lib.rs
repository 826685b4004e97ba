#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use campaign_domain::{now_utc, RuntimeStatus};
use campaign_history_core::{FailureDetails, HistoryEvent, HistoryStore, InstanceRecord};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use time::OffsetDateTime;

const HISTORY_SCHEMA_VERSION: i64 = 3;

const SCHEMA_V3: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS instances (
  instance_id TEXT PRIMARY KEY,
  orchestration TEXT NOT NULL,
  input_json TEXT NOT NULL,
  runtime_status TEXT NOT NULL CHECK (runtime_status IN ('pending','running','completed','failed','terminated')),
  custom_status_json TEXT,
  output_json TEXT,
  failure_kind TEXT,
  failure_message TEXT,
  created_time TEXT NOT NULL,
  created_unix_ms INTEGER NOT NULL,
  last_updated_time TEXT NOT NULL,
  generation INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS history_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  instance_id TEXT NOT NULL,
  seq INTEGER NOT NULL,
  event_type TEXT NOT NULL CHECK (event_type IN ('activity_completed','activity_failed')),
  activity_name TEXT NOT NULL,
  input_hash TEXT NOT NULL,
  result_json TEXT,
  failure_kind TEXT,
  failure_message TEXT,
  recorded_at TEXT NOT NULL,
  UNIQUE(instance_id, seq),
  FOREIGN KEY (instance_id) REFERENCES instances(instance_id)
);

CREATE INDEX IF NOT EXISTS idx_instances_orchestration_created ON instances(orchestration, created_unix_ms);
CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(runtime_status);
CREATE INDEX IF NOT EXISTS idx_history_instance_seq ON history_events(instance_id, seq);

CREATE TRIGGER IF NOT EXISTS trg_history_events_no_update
BEFORE UPDATE ON history_events
BEGIN
  SELECT RAISE(FAIL, 'history_events is append-only');
END;
";

const INSTANCE_COLUMNS: &str = "instance_id, orchestration, input_json, runtime_status,
    custom_status_json, output_json, failure_kind, failure_message,
    created_time, last_updated_time, generation";

pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteHistoryStore {
    /// Open or create a `SQLite` history database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("history connection mutex poisoned"))
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_V3)
            .context("failed to apply history schema")?;

        ensure_column(&conn, "instances", "custom_status_json", "TEXT")?;
        ensure_column(&conn, "instances", "generation", "INTEGER NOT NULL DEFAULT 0")?;

        let now = rfc3339(now_utc())?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![HISTORY_SCHEMA_VERSION, now],
        )
        .context("failed to record history migration")?;

        Ok(())
    }

    fn try_create_instance(&self, record: &InstanceRecord) -> Result<bool> {
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO instances(
                    instance_id, orchestration, input_json, runtime_status,
                    custom_status_json, output_json, failure_kind, failure_message,
                    created_time, created_unix_ms, last_updated_time
                ) VALUES (?1, ?2, ?3, ?4, NULL, NULL, NULL, NULL, ?5, ?6, ?7)",
                params![
                    record.instance_id,
                    record.orchestration,
                    serde_json::to_string(&record.input)?,
                    runtime_status_to_str(record.runtime_status),
                    rfc3339(record.created_time)?,
                    unix_ms(record.created_time)?,
                    rfc3339(record.last_updated_time)?,
                ],
            )
            .context("failed to insert instance")?;
        Ok(inserted == 1)
    }

    fn reset_instance(
        &self,
        record: &InstanceRecord,
        resettable: &[RuntimeStatus],
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin reset transaction")?;

        let current: Option<String> = tx
            .query_row(
                "SELECT runtime_status FROM instances WHERE instance_id = ?1",
                params![record.instance_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(false);
        };
        if !resettable.contains(&parse_runtime_status(&current)?) {
            return Ok(false);
        }

        tx.execute(
            "DELETE FROM history_events WHERE instance_id = ?1",
            params![record.instance_id],
        )
        .context("failed to clear instance history")?;
        tx.execute(
            "UPDATE instances SET
                orchestration = ?2,
                input_json = ?3,
                runtime_status = ?4,
                custom_status_json = NULL,
                output_json = NULL,
                failure_kind = NULL,
                failure_message = NULL,
                created_time = ?5,
                created_unix_ms = ?6,
                last_updated_time = ?7,
                generation = generation + 1
             WHERE instance_id = ?1",
            params![
                record.instance_id,
                record.orchestration,
                serde_json::to_string(&record.input)?,
                runtime_status_to_str(record.runtime_status),
                rfc3339(record.created_time)?,
                unix_ms(record.created_time)?,
                rfc3339(record.last_updated_time)?,
            ],
        )
        .context("failed to reset instance")?;
        tx.commit().context("failed to commit instance reset")?;
        Ok(true)
    }

    fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE instance_id = ?1"
        ))?;
        let mut rows = stmt.query(params![instance_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_instance(row)?)),
            None => Ok(None),
        }
    }

    fn list_instances(
        &self,
        orchestration: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InstanceRecord>> {
        let conn = self.lock()?;
        let limit = i64::try_from(limit).map_err(|_| anyhow!("list limit too large for sqlite"))?;
        let mut out = Vec::new();

        if let Some(orchestration) = orchestration {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INSTANCE_COLUMNS} FROM instances
                 WHERE orchestration = ?1
                 ORDER BY created_unix_ms DESC, instance_id ASC
                 LIMIT ?2"
            ))?;
            let mut rows = stmt.query(params![orchestration, limit])?;
            while let Some(row) = rows.next()? {
                out.push(read_instance(row)?);
            }
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INSTANCE_COLUMNS} FROM instances
                 ORDER BY created_unix_ms DESC, instance_id ASC
                 LIMIT ?1"
            ))?;
            let mut rows = stmt.query(params![limit])?;
            while let Some(row) = rows.next()? {
                out.push(read_instance(row)?);
            }
        }

        Ok(out)
    }

    fn list_unfinished(&self) -> Result<Vec<InstanceRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances
             WHERE runtime_status IN ('pending','running')
             ORDER BY created_unix_ms ASC, instance_id ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_instance(row)?);
        }
        Ok(out)
    }

    fn transition_instance(
        &self,
        instance_id: &str,
        generation: Option<u64>,
        status: RuntimeStatus,
        output: Option<&Value>,
        failure: Option<&FailureDetails>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE instances SET
                    runtime_status = ?2,
                    output_json = COALESCE(?3, output_json),
                    failure_kind = ?4,
                    failure_message = ?5,
                    last_updated_time = ?6
                 WHERE instance_id = ?1
                   AND runtime_status IN ('pending','running')
                   AND (?7 IS NULL OR generation = ?7)",
                params![
                    instance_id,
                    runtime_status_to_str(status),
                    output.map(serde_json::to_string).transpose()?,
                    failure.map(|value| value.kind.as_str()),
                    failure.map(|value| value.message.as_str()),
                    rfc3339(now_utc())?,
                    generation.map(sql_generation).transpose()?,
                ],
            )
            .context("failed to transition instance")?;
        Ok(changed == 1)
    }

    fn set_custom_status(
        &self,
        instance_id: &str,
        generation: u64,
        custom_status: &Value,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE instances SET custom_status_json = ?2, last_updated_time = ?3
                 WHERE instance_id = ?1
                   AND generation = ?4
                   AND runtime_status IN ('pending','running')",
                params![
                    instance_id,
                    serde_json::to_string(custom_status)?,
                    rfc3339(now_utc())?,
                    sql_generation(generation)?,
                ],
            )
            .context("failed to set custom status")?;
        Ok(changed == 1)
    }

    fn append_history(
        &self,
        instance_id: &str,
        generation: u64,
        event: &HistoryEvent,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let (event_type, result_json, failure) = match event {
            HistoryEvent::ActivityCompleted { result, .. } => {
                ("activity_completed", Some(serde_json::to_string(result)?), None)
            }
            HistoryEvent::ActivityFailed { failure, .. } => ("activity_failed", None, Some(failure)),
        };
        let inserted = conn
            .execute(
                "INSERT INTO history_events(
                    instance_id, seq, event_type, activity_name, input_hash,
                    result_json, failure_kind, failure_message, recorded_at
                )
                SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
                WHERE EXISTS (
                    SELECT 1 FROM instances WHERE instance_id = ?1 AND generation = ?10
                )",
                params![
                    instance_id,
                    i64::from(event.seq()),
                    event_type,
                    event.name(),
                    event.input_hash(),
                    result_json,
                    failure.map(|value| value.kind.as_str()),
                    failure.map(|value| value.message.as_str()),
                    rfc3339(now_utc())?,
                    sql_generation(generation)?,
                ],
            )
            .with_context(|| format!("failed to append history event {}", event.seq()))?;
        Ok(inserted == 1)
    }

    fn load_history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT seq, event_type, activity_name, input_hash,
                    result_json, failure_kind, failure_message
             FROM history_events
             WHERE instance_id = ?1
             ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query(params![instance_id])?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            let seq = u32::try_from(row.get::<_, i64>(0)?)
                .map_err(|_| anyhow!("history seq out of range"))?;
            let event_type: String = row.get(1)?;
            let name: String = row.get(2)?;
            let input_hash: String = row.get(3)?;
            let event = match event_type.as_str() {
                "activity_completed" => {
                    let raw: Option<String> = row.get(4)?;
                    let raw = raw.ok_or_else(|| anyhow!("completed event {seq} has no result"))?;
                    HistoryEvent::ActivityCompleted {
                        seq,
                        name,
                        input_hash,
                        result: serde_json::from_str(&raw).context("invalid result_json")?,
                    }
                }
                "activity_failed" => HistoryEvent::ActivityFailed {
                    seq,
                    name,
                    input_hash,
                    failure: FailureDetails {
                        kind: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                        message: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                    },
                },
                other => return Err(anyhow!("unknown history event_type: {other}")),
            };
            out.push(event);
        }

        Ok(out)
    }
}

fn read_instance(row: &Row<'_>) -> Result<InstanceRecord> {
    let input_raw: String = row.get(2)?;
    let custom_raw: Option<String> = row.get(4)?;
    let output_raw: Option<String> = row.get(5)?;
    let failure_kind: Option<String> = row.get(6)?;
    let failure_message: Option<String> = row.get(7)?;

    Ok(InstanceRecord {
        instance_id: row.get(0)?,
        orchestration: row.get(1)?,
        input: serde_json::from_str(&input_raw).context("invalid input_json")?,
        runtime_status: parse_runtime_status(&row.get::<_, String>(3)?)?,
        custom_status: custom_raw
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("invalid custom_status_json")?,
        output: output_raw
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("invalid output_json")?,
        failure: failure_kind.map(|kind| FailureDetails {
            kind,
            message: failure_message.unwrap_or_default(),
        }),
        created_time: parse_rfc3339(&row.get::<_, String>(8)?)?,
        last_updated_time: parse_rfc3339(&row.get::<_, String>(9)?)?,
        generation: u64::try_from(row.get::<_, i64>(10)?)
            .map_err(|_| anyhow!("negative instance generation"))?,
    })
}

fn ensure_column(conn: &Connection, table: &str, column: &str, sql_type: &str) -> Result<()> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }

    conn.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type}"),
        [],
    )
    .with_context(|| format!("failed to add missing column {table}.{column}"))?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table info for {table}"))?;

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn parse_runtime_status(value: &str) -> Result<RuntimeStatus> {
    match value {
        "pending" => Ok(RuntimeStatus::Pending),
        "running" => Ok(RuntimeStatus::Running),
        "completed" => Ok(RuntimeStatus::Completed),
        "failed" => Ok(RuntimeStatus::Failed),
        "terminated" => Ok(RuntimeStatus::Terminated),
        _ => Err(anyhow!("unknown runtime status: {value}")),
    }
}

fn runtime_status_to_str(status: RuntimeStatus) -> &'static str {
    match status {
        RuntimeStatus::Pending => "pending",
        RuntimeStatus::Running => "running",
        RuntimeStatus::Completed => "completed",
        RuntimeStatus::Failed => "failed",
        RuntimeStatus::Terminated => "terminated",
    }
}

fn sql_generation(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("instance generation out of range for sqlite"))
}

fn unix_ms(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000)
        .map_err(|_| anyhow!("timestamp out of range for sqlite"))
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}
