use crate::schema::{Pilot, RecordMode, RunLog, RunStatus, RUN_LOG_LIMIT};
use crate::store::{CommitOutcome, PilotStore, StoreError};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const PILOT_COLUMNS: &str = "id, name, one_liner, record_mode, record_json, inputs_json, \
                             steps_json, credits, version, created_at_ms";
const RUN_LOG_COLUMNS: &str =
    "id, pilot_id, created_at_ms, input_values_json, output_preview, total_tokens, status";

/// SQLite-backed store. The connection sits behind a mutex and the credit
/// commit runs in an immediate transaction with a conditional decrement, so
/// it stays atomic even when several processes share the file.
pub struct SqliteStore {
    connection: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut connection: Connection) -> Result<Self, StoreError> {
        connection.busy_timeout(BUSY_TIMEOUT)?;
        bootstrap_schema(&mut connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.connection.lock().map_err(|_| StoreError::Poisoned)
    }
}

pub fn bootstrap_schema(connection: &mut Connection) -> Result<(), StoreError> {
    connection.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS pilots (
          id TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          one_liner TEXT NOT NULL,
          record_mode TEXT NOT NULL,
          record_json TEXT NOT NULL,
          inputs_json TEXT NOT NULL,
          steps_json TEXT NOT NULL,
          credits INTEGER NOT NULL CHECK (credits >= 0),
          created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS run_logs (
          id TEXT PRIMARY KEY,
          pilot_id TEXT NOT NULL REFERENCES pilots(id) ON DELETE CASCADE,
          created_at_ms INTEGER NOT NULL,
          input_values_json TEXT NOT NULL,
          output_preview TEXT NOT NULL,
          status TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_run_logs_pilot_created
          ON run_logs(pilot_id, created_at_ms DESC);
        CREATE INDEX IF NOT EXISTS idx_run_logs_created
          ON run_logs(created_at_ms);

        CREATE TABLE IF NOT EXISTS app_meta (
          key TEXT PRIMARY KEY,
          value_json TEXT NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );
        ",
    )?;

    ensure_column(connection, "pilots", "version", "INTEGER NOT NULL DEFAULT 1")?;
    ensure_column(connection, "run_logs", "total_tokens", "INTEGER")?;
    Ok(())
}

fn ensure_column(
    connection: &Connection,
    table: &str,
    column: &str,
    column_type: &str,
) -> Result<(), StoreError> {
    let mut stmt = connection.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(());
        }
    }
    connection.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {column_type}"), [])?;
    Ok(())
}

struct PilotRow {
    id: String,
    name: String,
    one_liner: String,
    record_mode: String,
    record_json: String,
    inputs_json: String,
    steps_json: String,
    credits: i64,
    version: i64,
    created_at_ms: i64,
}

impl PilotRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            one_liner: row.get(2)?,
            record_mode: row.get(3)?,
            record_json: row.get(4)?,
            inputs_json: row.get(5)?,
            steps_json: row.get(6)?,
            credits: row.get(7)?,
            version: row.get(8)?,
            created_at_ms: row.get(9)?,
        })
    }

    fn into_pilot(self) -> Result<Pilot, StoreError> {
        let record_mode = RecordMode::parse(&self.record_mode).ok_or_else(|| {
            StoreError::Corrupt(format!("pilot {} has record mode '{}'", self.id, self.record_mode))
        })?;
        Ok(Pilot {
            record: serde_json::from_str(&self.record_json)?,
            inputs: serde_json::from_str(&self.inputs_json)?,
            steps: serde_json::from_str(&self.steps_json)?,
            id: self.id,
            name: self.name,
            one_liner: self.one_liner,
            record_mode,
            credits: self.credits,
            version: self.version,
            created_at_ms: self.created_at_ms,
        })
    }
}

struct RunLogRow {
    id: String,
    pilot_id: String,
    created_at_ms: i64,
    input_values_json: String,
    output_preview: String,
    total_tokens: Option<i64>,
    status: String,
}

impl RunLogRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            pilot_id: row.get(1)?,
            created_at_ms: row.get(2)?,
            input_values_json: row.get(3)?,
            output_preview: row.get(4)?,
            total_tokens: row.get(5)?,
            status: row.get(6)?,
        })
    }

    fn into_run_log(self) -> Result<RunLog, StoreError> {
        let status = RunStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Corrupt(format!("run log {} has status '{}'", self.id, self.status))
        })?;
        Ok(RunLog {
            input_values: serde_json::from_str(&self.input_values_json)?,
            total_tokens: self.total_tokens.and_then(|t| u64::try_from(t).ok()),
            id: self.id,
            pilot_id: self.pilot_id,
            created_at_ms: self.created_at_ms,
            output_preview: self.output_preview,
            status,
        })
    }
}

fn insert_run_log(connection: &Connection, log: &RunLog) -> Result<(), StoreError> {
    connection.execute(
        &format!("INSERT INTO run_logs ({RUN_LOG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        params![
            log.id,
            log.pilot_id,
            log.created_at_ms,
            serde_json::to_string(&log.input_values)?,
            log.output_preview,
            log.total_tokens.and_then(|t| i64::try_from(t).ok()),
            log.status.as_str(),
        ],
    )?;
    trim_run_logs(connection, &log.pilot_id)
}

fn pilot_exists(connection: &Connection, pilot_id: &str) -> Result<bool, StoreError> {
    let found = connection
        .query_row(
            "SELECT 1 FROM pilots WHERE id = ?1",
            params![pilot_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn trim_run_logs(connection: &Connection, pilot_id: &str) -> Result<(), StoreError> {
    connection.execute(
        "DELETE FROM run_logs
         WHERE pilot_id = ?1
           AND id NOT IN (
             SELECT id FROM run_logs
             WHERE pilot_id = ?1
             ORDER BY created_at_ms DESC, rowid DESC
             LIMIT ?2
           )",
        params![pilot_id, RUN_LOG_LIMIT as i64],
    )?;
    Ok(())
}

impl PilotStore for SqliteStore {
    fn create_pilot(&self, pilot: &Pilot) -> Result<(), StoreError> {
        let connection = self.lock()?;
        connection.execute(
            &format!(
                "INSERT INTO pilots ({PILOT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                pilot.id,
                pilot.name,
                pilot.one_liner,
                pilot.record_mode.as_str(),
                serde_json::to_string(&pilot.record)?,
                serde_json::to_string(&pilot.inputs)?,
                serde_json::to_string(&pilot.steps)?,
                pilot.credits,
                pilot.version,
                pilot.created_at_ms,
            ],
        )?;
        Ok(())
    }

    fn get_pilot(&self, id: &str) -> Result<Option<Pilot>, StoreError> {
        let connection = self.lock()?;
        let row = connection
            .query_row(
                &format!("SELECT {PILOT_COLUMNS} FROM pilots WHERE id = ?1"),
                params![id],
                PilotRow::from_row,
            )
            .optional()?;
        row.map(PilotRow::into_pilot).transpose()
    }

    fn update_pilot(&self, pilot: &Pilot) -> Result<Option<Pilot>, StoreError> {
        let mut connection = self.lock()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE pilots
             SET name = ?2, one_liner = ?3, record_mode = ?4, record_json = ?5,
                 inputs_json = ?6, steps_json = ?7, version = version + 1
             WHERE id = ?1",
            params![
                pilot.id,
                pilot.name,
                pilot.one_liner,
                pilot.record_mode.as_str(),
                serde_json::to_string(&pilot.record)?,
                serde_json::to_string(&pilot.inputs)?,
                serde_json::to_string(&pilot.steps)?,
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let row = tx.query_row(
            &format!("SELECT {PILOT_COLUMNS} FROM pilots WHERE id = ?1"),
            params![pilot.id],
            PilotRow::from_row,
        )?;
        tx.commit()?;
        row.into_pilot().map(Some)
    }

    fn list_pilots(&self) -> Result<Vec<Pilot>, StoreError> {
        let connection = self.lock()?;
        let mut stmt = connection.prepare(&format!(
            "SELECT {PILOT_COLUMNS} FROM pilots ORDER BY created_at_ms DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], PilotRow::from_row)?;
        let pilots = rows
            .map(|row| row?.into_pilot())
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(pilots)
    }

    fn append_run_log(&self, log: &RunLog) -> Result<(), StoreError> {
        let mut connection = self.lock()?;
        let tx = connection.transaction()?;
        if !pilot_exists(&tx, &log.pilot_id)? {
            return Err(StoreError::UnknownPilot(log.pilot_id.clone()));
        }
        insert_run_log(&tx, log)?;
        tx.commit()?;
        Ok(())
    }

    fn list_run_logs(&self, pilot_id: &str, limit: usize) -> Result<Vec<RunLog>, StoreError> {
        let connection = self.lock()?;
        let mut stmt = connection.prepare(&format!(
            "SELECT {RUN_LOG_COLUMNS} FROM run_logs
             WHERE pilot_id = ?1
             ORDER BY created_at_ms DESC, rowid DESC
             LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![pilot_id, limit], RunLogRow::from_row)?;
        let logs = rows
            .map(|row| row?.into_run_log())
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(logs)
    }

    fn commit_run(&self, pilot_id: &str, log: &RunLog) -> Result<CommitOutcome, StoreError> {
        let mut connection = self.lock()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let credits = tx
            .query_row(
                "SELECT credits FROM pilots WHERE id = ?1",
                params![pilot_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        match credits {
            None => return Ok(CommitOutcome::NotFound),
            Some(credits) if credits <= 0 => return Ok(CommitOutcome::InsufficientCredits),
            Some(_) => {}
        }

        let changed = tx.execute(
            "UPDATE pilots SET credits = credits - 1 WHERE id = ?1 AND credits > 0",
            params![pilot_id],
        )?;
        if changed == 0 {
            return Ok(CommitOutcome::InsufficientCredits);
        }
        insert_run_log(&tx, log)?;
        let credits_left = tx.query_row(
            "SELECT credits FROM pilots WHERE id = ?1",
            params![pilot_id],
            |row| row.get::<_, i64>(0),
        )?;
        tx.commit()?;
        Ok(CommitOutcome::Success { credits_left })
    }

    fn delete_run_logs_older_than(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let connection = self.lock()?;
        let deleted = connection.execute(
            "DELETE FROM run_logs WHERE created_at_ms < ?1",
            params![cutoff_ms],
        )?;
        Ok(deleted)
    }

    fn get_meta(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let connection = self.lock()?;
        let raw = connection
            .query_row(
                "SELECT value_json FROM app_meta WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    fn set_meta(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let connection = self.lock()?;
        connection.execute(
            "INSERT INTO app_meta (key, value_json, updated_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
               value_json = excluded.value_json,
               updated_at_ms = excluded.updated_at_ms",
            params![key, serde_json::to_string(value)?, crate::ids::now_ms()],
        )?;
        Ok(())
    }

    fn claim_meta(
        &self,
        key: &str,
        expected: Option<&Value>,
        value: &Value,
    ) -> Result<bool, StoreError> {
        let mut connection = self.lock()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw = tx
            .query_row(
                "SELECT value_json FROM app_meta WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        let current = raw
            .map(|json| serde_json::from_str::<Value>(&json))
            .transpose()?;
        if current.as_ref() != expected {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO app_meta (key, value_json, updated_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
               value_json = excluded.value_json,
               updated_at_ms = excluded.updated_at_ms",
            params![key, serde_json::to_string(value)?, crate::ids::now_ms()],
        )?;
        tx.commit()?;
        Ok(true)
    }
}
