//! PostgreSQL backend implementation.
//!
//! One `postgres::Client` per thread; the backend never pools.

use postgres::error::SqlState;
use postgres::types::{ToSql, Type};
use postgres::{Client, NoTls, Row};

use super::driver::{DbConnection, Driver};
use super::error::{DriverError, ErrorClass};
use super::value::{Params, QueryResult, Value};

const LOCK_STATES: [SqlState; 3] = [
    SqlState::T_R_DEADLOCK_DETECTED,
    SqlState::LOCK_NOT_AVAILABLE,
    SqlState::T_R_SERIALIZATION_FAILURE,
];

const CONNECTION_STATES: [SqlState; 3] = [
    SqlState::ADMIN_SHUTDOWN,
    SqlState::CRASH_SHUTDOWN,
    SqlState::CANNOT_CONNECT_NOW,
];

const CONSULTATION_STATES: [SqlState; 2] = [SqlState::INSUFFICIENT_PRIVILEGE, SqlState::DISK_FULL];

pub struct PostgresDriver {
    url: String,
}

impl PostgresDriver {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

impl Driver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn open(&self) -> Result<Box<dyn DbConnection>, DriverError> {
        let client = Client::connect(&self.url, NoTls).map_err(|e| classify(&e))?;
        Ok(Box::new(PostgresConnection { client }))
    }
}

pub struct PostgresConnection {
    client: Client,
}

impl DbConnection for PostgresConnection {
    fn execute(&mut self, sql: &str, params: &Params) -> Result<QueryResult, DriverError> {
        let values: &[Value] = match params {
            Params::Empty => &[],
            Params::Positional(values) => values,
            Params::Named(_) => {
                return Err(DriverError::statement(
                    "named parameters are not supported by the PostgreSQL driver",
                ))
            }
        };
        let boxed: Vec<Box<dyn ToSql + Sync>> = values.iter().map(to_sql_box).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(|b| b.as_ref()).collect();

        let stmt = self.client.prepare(sql).map_err(|e| classify(&e))?;
        if stmt.columns().is_empty() {
            let changed = self
                .client
                .execute(&stmt, &refs)
                .map_err(|e| classify(&e))?;
            return Ok(QueryResult {
                rows_affected: changed as usize,
                ..QueryResult::default()
            });
        }

        let columns = stmt.columns().iter().map(|c| c.name().to_string()).collect();
        let rows = self
            .client
            .query(&stmt, &refs)
            .map_err(|e| classify(&e))?
            .iter()
            .map(row_values)
            .collect();
        Ok(QueryResult {
            columns,
            rows,
            ..QueryResult::default()
        })
    }

    fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.client.close().map_err(|e| classify(&e))
    }
}

fn to_sql_box(value: &Value) -> Box<dyn ToSql + Sync> {
    match value {
        Value::Null => Box::new(None::<String>),
        Value::Integer(v) => Box::new(*v),
        Value::Real(v) => Box::new(*v),
        Value::Text(s) => Box::new(s.clone()),
        Value::Blob(b) => Box::new(b.clone()),
    }
}

fn row_values(row: &Row) -> Vec<Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let ty = column.type_();
            let cell = if *ty == Type::INT2 {
                row.try_get::<_, Option<i16>>(i).map(|v| v.map(|v| Value::Integer(v as i64)))
            } else if *ty == Type::INT4 {
                row.try_get::<_, Option<i32>>(i).map(|v| v.map(|v| Value::Integer(v as i64)))
            } else if *ty == Type::INT8 {
                row.try_get::<_, Option<i64>>(i).map(|v| v.map(Value::Integer))
            } else if *ty == Type::FLOAT4 {
                row.try_get::<_, Option<f32>>(i).map(|v| v.map(|v| Value::Real(v as f64)))
            } else if *ty == Type::FLOAT8 {
                row.try_get::<_, Option<f64>>(i).map(|v| v.map(Value::Real))
            } else if *ty == Type::BOOL {
                row.try_get::<_, Option<bool>>(i).map(|v| v.map(Value::from))
            } else if *ty == Type::BYTEA {
                row.try_get::<_, Option<Vec<u8>>>(i).map(|v| v.map(Value::Blob))
            } else {
                row.try_get::<_, Option<String>>(i).map(|v| v.map(Value::Text))
            };
            cell.ok().flatten().unwrap_or(Value::Null)
        })
        .collect()
}

/// Sort a postgres error into the backend's error classes.
pub fn classify(err: &postgres::Error) -> DriverError {
    if err.is_closed() {
        return DriverError::connection(err.to_string());
    }
    match err.code() {
        Some(code) => {
            let class = if LOCK_STATES.contains(code) {
                ErrorClass::Lock
            } else if CONNECTION_STATES.contains(code) {
                ErrorClass::Connection
            } else if CONSULTATION_STATES.contains(code) {
                ErrorClass::Consultation
            } else {
                ErrorClass::Statement
            };
            DriverError::new(class, err.to_string()).with_code(code.code())
        }
        None => {
            let on_wire = std::error::Error::source(err)
                .is_some_and(|source| source.downcast_ref::<std::io::Error>().is_some());
            let class = if on_wire {
                ErrorClass::Connection
            } else {
                ErrorClass::Statement
            };
            DriverError::new(class, err.to_string())
        }
    }
}
