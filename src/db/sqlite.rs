//! SQLite backend implementation.

use rusqlite::ffi::ErrorCode;
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::Connection;
use std::path::PathBuf;
use std::time::Duration;

use super::driver::{DbConnection, Driver};
use super::error::{DriverError, ErrorClass};
use super::value::{Params, QueryResult, Value};

pub struct SqliteDriver {
    path: PathBuf,
    wal_mode: bool,
    busy_timeout: Duration,
}

impl SqliteDriver {
    pub fn new(path: impl Into<PathBuf>, wal_mode: bool, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            wal_mode,
            busy_timeout,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn open(&self) -> Result<Box<dyn DbConnection>, DriverError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DriverError::connection(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(&self.path).map_err(|e| classify(&e))?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| classify(&e))?;
        if self.wal_mode {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| classify(&e))?;
        }
        tracing::debug!("Opened SQLite connection to {:?}", self.path);
        Ok(Box::new(SqliteConnection { conn }))
    }
}

pub struct SqliteConnection {
    conn: Connection,
}

impl SqliteConnection {
    fn run(&mut self, sql: &str, params: &Params) -> rusqlite::Result<QueryResult> {
        let mut stmt = self.conn.prepare(sql)?;

        match params {
            Params::Empty => {}
            Params::Positional(values) => {
                for (i, value) in values.iter().enumerate() {
                    stmt.raw_bind_parameter(i + 1, value)?;
                }
            }
            Params::Named(values) => {
                for (name, value) in values {
                    let index = stmt
                        .parameter_index(name)?
                        .ok_or_else(|| rusqlite::Error::InvalidParameterName(name.clone()))?;
                    stmt.raw_bind_parameter(index, value)?;
                }
            }
        }

        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        if columns.is_empty() {
            let changed = stmt.raw_execute()?;
            let is_insert = sql
                .trim_start()
                .get(..6)
                .is_some_and(|s| s.eq_ignore_ascii_case("insert"));
            return Ok(QueryResult {
                columns,
                rows: Vec::new(),
                rows_affected: changed,
                last_insert_id: (is_insert && changed > 0).then(|| self.conn.last_insert_rowid()),
            });
        }

        let mut rows = Vec::new();
        let mut cursor = stmt.raw_query();
        while let Some(row) = cursor.next()? {
            let mut cells = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                cells.push(from_value_ref(row.get_ref(i)?));
            }
            rows.push(cells);
        }

        Ok(QueryResult {
            columns,
            rows,
            rows_affected: 0,
            last_insert_id: None,
        })
    }
}

impl DbConnection for SqliteConnection {
    fn execute(&mut self, sql: &str, params: &Params) -> Result<QueryResult, DriverError> {
        self.run(sql, params).map_err(|e| classify(&e))
    }

    fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.conn.close().map_err(|(_, e)| classify(&e))
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(v) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*v)),
            Value::Real(v) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*v)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

/// Sort a rusqlite error into the backend's error classes.
pub fn classify(err: &rusqlite::Error) -> DriverError {
    match err {
        rusqlite::Error::SqliteFailure(ffi_err, message) => {
            let class = match ffi_err.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ErrorClass::Lock,
                ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt => ErrorClass::Connection,
                ErrorCode::DiskFull
                | ErrorCode::ReadOnly
                | ErrorCode::AuthorizationForStatementDenied => ErrorClass::Consultation,
                _ => ErrorClass::Statement,
            };
            let message = message.clone().unwrap_or_else(|| ffi_err.to_string());
            DriverError::new(class, message).with_code(ffi_err.extended_code.to_string())
        }
        other => DriverError::statement(other.to_string()),
    }
}
