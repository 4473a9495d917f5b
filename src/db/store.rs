//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::probe::ProbeStatus;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("database connection lock poisoned")]
    Poisoned,
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const EXECUTION_COLUMNS: &str =
    "e.id, e.target_id, t.name, e.status, e.response_time, e.error, e.details, e.timestamp";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Create a store backed by a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Targets ---

    /// Add a new target and return its ID.
    pub fn add_target(&self, target: &mut Target) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO targets (name, check_type, config, enabled, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                target.name,
                target.check_type.as_str(),
                target.config.to_string(),
                target.enabled,
                format_db_time(target.created_at),
                format_db_time(target.updated_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        target.id = id;
        Ok(id)
    }

    /// Get all targets.
    pub fn get_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, check_type, config, enabled, created_at, updated_at FROM targets ORDER BY id",
        )?;

        let targets = stmt
            .query_map([], row_to_target)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(targets)
    }

    /// Get a target by ID.
    pub fn get_target(&self, id: i64) -> Result<Target, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, check_type, config, enabled, created_at, updated_at FROM targets WHERE id = ?1",
            params![id],
            row_to_target,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Get a target by its unique name.
    pub fn get_target_by_name(&self, name: &str) -> Result<Target, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, check_type, config, enabled, created_at, updated_at FROM targets WHERE name = ?1",
            params![name],
            row_to_target,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    // --- Executions ---

    /// Append an execution and return it as stored.
    pub fn add_execution(&self, execution: &NewExecution) -> Result<ExecutionRecord, DbError> {
        let timestamp = execution.timestamp.unwrap_or_else(Utc::now);
        let details = Value::Object(execution.details.clone()).to_string();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO executions (target_id, status, response_time, error, details, timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                execution.target_id,
                execution.status.as_str(),
                execution.response_time,
                execution.error,
                details,
                format_db_time(timestamp),
            ],
        )?;
        let id = conn.last_insert_rowid();

        let record = conn.query_row(
            &format!(
                "SELECT {} FROM executions e JOIN targets t ON t.id = e.target_id WHERE e.id = ?1",
                EXECUTION_COLUMNS
            ),
            params![id],
            row_to_execution,
        )?;
        Ok(record)
    }

    /// Executions of one target within `[from, to]`, newest first.
    pub fn get_executions(
        &self,
        target_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM executions e JOIN targets t ON t.id = e.target_id
             WHERE e.target_id = ?1 AND e.timestamp BETWEEN ?2 AND ?3
             ORDER BY e.timestamp DESC, e.id DESC LIMIT ?4",
            EXECUTION_COLUMNS
        ))?;

        let results = stmt
            .query_map(
                params![
                    target_id,
                    format_db_time(from),
                    format_db_time(to),
                    sql_limit(limit),
                ],
                row_to_execution,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(results)
    }

    /// Most recent executions regardless of time, newest first.
    ///
    /// With `target_id` set only that target's executions are returned.
    pub fn get_latest_executions(
        &self,
        target_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM executions e JOIN targets t ON t.id = e.target_id
             WHERE ?1 IS NULL OR e.target_id = ?1
             ORDER BY e.timestamp DESC, e.id DESC LIMIT ?2",
            EXECUTION_COLUMNS
        ))?;

        let results = stmt
            .query_map(params![target_id, sql_limit(Some(limit))], row_to_execution)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(results)
    }

    /// Timestamp of the newest execution of a target across all history.
    pub fn get_last_execution_time(&self, target_id: i64) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let result: Option<String> = conn.query_row(
            "SELECT MAX(timestamp) FROM executions WHERE target_id = ?1",
            params![target_id],
            |row| row.get(0),
        )?;

        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    /// Total number of stored executions.
    pub fn count_executions(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM executions", [], |r| r.get(0))?)
    }
}

fn sql_limit(limit: Option<usize>) -> i64 {
    // SQLite treats a negative LIMIT as "no limit".
    match limit {
        Some(n) if n > 0 => i64::try_from(n).unwrap_or(i64::MAX),
        _ => -1,
    }
}

fn row_to_target(row: &Row<'_>) -> SqlResult<Target> {
    let check_type: String = row.get(2)?;
    let config: String = row.get(3)?;
    Ok(Target {
        id: row.get(0)?,
        name: row.get(1)?,
        check_type: check_type
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
        config: serde_json::from_str(&config)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        enabled: row.get(4)?,
        created_at: time_column(row, 5)?,
        updated_at: time_column(row, 6)?,
    })
}

fn row_to_execution(row: &Row<'_>) -> SqlResult<ExecutionRecord> {
    let status: String = row.get(3)?;
    let details: String = row.get(6)?;
    let details: Map<String, Value> = serde_json::from_str(&details)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(ExecutionRecord {
        id: row.get(0)?,
        target_id: row.get(1)?,
        target_name: row.get(2)?,
        status: status
            .parse::<ProbeStatus>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?,
        response_time: row.get(4)?,
        error: row.get(5)?,
        details,
        timestamp: time_column(row, 7)?,
    })
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid timestamp {:?}", s).into(),
        )
    })
}

/// Format a datetime so that lexical order equals chronological order.
fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
