//! Engine seam: one `Driver` per backend, one `DbConnection` per thread.

use anyhow::Result;
use std::sync::Arc;

use super::error::DriverError;
use super::sqlite::SqliteDriver;
use super::value::{Params, QueryResult};
use crate::config::{DatabaseConfig, DatabaseRole};
#[cfg(feature = "postgres")]
use crate::config::DatabaseType;

/// A physical connection. Owned and used by exactly one thread.
pub trait DbConnection: Send {
    fn execute(&mut self, sql: &str, params: &Params) -> Result<QueryResult, DriverError>;

    fn begin(&mut self) -> Result<(), DriverError> {
        self.execute("BEGIN", &Params::Empty).map(|_| ())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.execute("COMMIT", &Params::Empty).map(|_| ())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.execute("ROLLBACK", &Params::Empty).map(|_| ())
    }

    fn close(self: Box<Self>) -> Result<(), DriverError>;
}

/// Opens physical connections to one configured database.
pub trait Driver: Send + Sync {
    /// Short engine name for logging.
    fn name(&self) -> &'static str;

    fn open(&self) -> Result<Box<dyn DbConnection>, DriverError>;
}

/// Build the driver for the configured engine and logical database.
pub fn driver_for(config: &DatabaseConfig, role: DatabaseRole) -> Result<Arc<dyn Driver>> {
    config.validate()?;

    #[cfg(feature = "postgres")]
    {
        if config.backend == DatabaseType::Postgresql {
            let url = config
                .postgresql_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("PostgreSQL URL not configured"))?;
            return Ok(Arc::new(super::postgres::PostgresDriver::new(url)));
        }
    }

    #[cfg(not(feature = "postgres"))]
    {
        if config.backend != crate::config::DatabaseType::Sqlite {
            anyhow::bail!("PostgreSQL support not compiled in (enable the `postgres` feature)");
        }
    }

    Ok(Arc::new(SqliteDriver::new(
        config.path_for(role),
        config.wal_mode,
        config.busy_timeout(),
    )))
}
