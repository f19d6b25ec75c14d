//! Backend facade.
//!
//! `DbBackend` is the one object application code talks to. It is cheap to
//! clone and safe to share: each calling thread gets its own connection,
//! transient lock failures are retried in place, and connection or
//! consultation errors are escalated to the application's error handler.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::action::{self, ActionRegistry};
use super::driver::{driver_for, DbConnection, Driver};
use super::error::{DbError, DbResult, DriverError};
use super::escalation::{ErrorHandler, EscalationChannel, EscalationKind, QueryStatus, Resolution};
use super::privileged::PrivilegedHandle;
use super::retry::{Boundary, RetryFailure, RetryPolicy};
use super::slots::{ConnectionSlots, LastError, RecordCell, ValidityEpoch};
use super::transaction::{self, CommitStep, Transaction};
use super::value::{Params, QueryResult, Value};
use crate::config::{Config, DatabaseRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    /// No connection has succeeded yet.
    Unavailable,
    Open,
    /// `close()` was requested. Only threads inside a transaction may go on.
    Closing,
}

pub struct DbBackendBuilder {
    config: Config,
    role: DatabaseRole,
    driver: Option<Arc<dyn Driver>>,
    handler: Option<(Arc<dyn ErrorHandler>, PrivilegedHandle)>,
}

impl DbBackendBuilder {
    /// Which logical database to open when the driver comes from config.
    pub fn role(mut self, role: DatabaseRole) -> Self {
        self.role = role;
        self
    }

    /// Use this driver instead of the one described by the config.
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Install the error handler and the context it must run on.
    pub fn error_handler(
        mut self,
        handler: Arc<dyn ErrorHandler>,
        privileged: PrivilegedHandle,
    ) -> Self {
        self.handler = Some((handler, privileged));
        self
    }

    pub fn build(self) -> Result<DbBackend> {
        let driver = match self.driver {
            Some(driver) => driver,
            None => driver_for(&self.config.database, self.role)?,
        };
        let epoch = Arc::new(ValidityEpoch::default());
        let slots = ConnectionSlots::new(driver, epoch.clone());
        let channel = EscalationChannel::new(epoch, self.handler, self.config.escalation.timeout());
        let parameters_hash = self.config.database.hash();

        if !channel.has_handler() {
            tracing::info!("No database error handler installed; connection errors fail directly");
        }
        tracing::info!(
            "Database backend ready ({} driver, parameters {})",
            slots.driver_name(),
            parameters_hash
        );

        Ok(DbBackend {
            inner: Arc::new(BackendInner {
                slots,
                channel,
                retry: RetryPolicy::from_config(&self.config.retry),
                actions: ActionRegistry::new(self.config.actions),
                closing: AtomicBool::new(false),
                close_timeout: self.config.close.timeout(),
                parameters_hash,
            }),
        })
    }
}

struct BackendInner {
    slots: Arc<ConnectionSlots>,
    channel: EscalationChannel,
    retry: RetryPolicy,
    actions: ActionRegistry,
    closing: AtomicBool,
    close_timeout: Duration,
    parameters_hash: String,
}

impl Drop for BackendInner {
    fn drop(&mut self) {
        let stuck = self.slots.close_idle();
        if !stuck.is_empty() {
            tracing::warn!(
                "Database backend dropped with open transactions on: {}",
                stuck.join(", ")
            );
        }
    }
}

/// What a guarded operation is running, for retry and escalation.
#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    Statement(&'a str),
    Boundary(Boundary),
}

impl Target<'_> {
    fn text(&self) -> &str {
        match self {
            Target::Statement(sql) => *sql,
            Target::Boundary(boundary) => boundary.as_sql(),
        }
    }
}

#[derive(Clone)]
pub struct DbBackend {
    inner: Arc<BackendInner>,
}

impl DbBackend {
    pub fn builder(config: Config) -> DbBackendBuilder {
        DbBackendBuilder {
            config,
            role: DatabaseRole::Core,
            driver: None,
            handler: None,
        }
    }

    /// Open the core database described by `config`, without an error handler.
    pub fn open(config: &Config) -> Result<Self> {
        Self::builder(config.clone()).build()
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn status(&self) -> BackendStatus {
        if self.inner.closing.load(Ordering::SeqCst) {
            BackendStatus::Closing
        } else if self.inner.slots.has_opened() {
            BackendStatus::Open
        } else {
            BackendStatus::Unavailable
        }
    }

    pub fn query_status(&self) -> QueryStatus {
        self.inner.channel.status()
    }

    /// Threads currently parked on an escalation episode.
    pub fn waiting_threads(&self) -> usize {
        self.inner.channel.waiting_threads()
    }

    /// Escalation episodes started so far.
    pub fn escalation_episodes(&self) -> u64 {
        self.inner.channel.episodes()
    }

    pub fn parameters_hash(&self) -> &str {
        &self.inner.parameters_hash
    }

    pub fn driver_name(&self) -> &'static str {
        self.inner.slots.driver_name()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    /// The calling thread's most recent database error.
    pub fn last_error(&self) -> Option<LastError> {
        self.inner.slots.existing_cell().and_then(|cell| cell.last_error())
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Make sure the calling thread holds a current connection and return
    /// its generation.
    pub fn acquire_for_current_thread(&self) -> DbResult<u64> {
        let cell = self.cell()?;
        let record = self.inner.slots.acquire(&cell).map_err(|e| {
            if cell.is_closed() {
                DbError::Closing
            } else {
                DbError::Connection(e)
            }
        })?;
        Ok(record.generation())
    }

    /// Mark every thread's connection stale. Each thread reopens lazily.
    pub fn invalidate_all(&self) -> u64 {
        self.inner.slots.invalidate_all()
    }

    pub fn current_generation(&self) -> u64 {
        self.inner.slots.epoch().current()
    }

    // ========================================================================
    // Statements
    // ========================================================================

    pub fn execute(&self, sql: &str, params: impl Into<Params>) -> DbResult<QueryResult> {
        let params = params.into();
        let cell = self.cell()?;
        self.run(&cell, Target::Statement(sql), |conn| conn.execute(sql, &params))
    }

    /// Run a configured action, see `DbAction`.
    pub fn exec_action(&self, name: &str, bindings: &[(&str, Value)]) -> DbResult<Vec<QueryResult>> {
        let action = self.inner.actions.get(name)?;
        // Bind everything up front so a missing binding never applies half an action.
        let prepared = action
            .statements
            .iter()
            .map(|sql| -> DbResult<(&str, Params)> {
                Ok((sql.as_str(), action::bind_for(sql, bindings)?))
            })
            .collect::<DbResult<Vec<_>>>()?;

        tracing::debug!("Running database action {:?} ({} statements)", name, prepared.len());

        if !action.transactional {
            return prepared
                .into_iter()
                .map(|(sql, params)| self.execute(sql, params))
                .collect();
        }

        let tx = self.transaction()?;
        let mut results = Vec::with_capacity(prepared.len());
        for (sql, params) in prepared {
            results.push(tx.execute(sql, params)?);
        }
        tx.commit()?;
        Ok(results)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn begin_transaction(&self) -> DbResult<()> {
        let cell = self.cell()?;
        if transaction::needs_begin(&cell) {
            self.run(&cell, Target::Boundary(Boundary::Begin), |conn| conn.begin())?;
        }
        transaction::entered(&cell);
        Ok(())
    }

    pub fn commit(&self) -> DbResult<()> {
        let cell = self.cell()?;
        match transaction::commit_step(&cell)? {
            CommitStep::Nested => {
                transaction::left(&cell);
            }
            CommitStep::Physical => {
                self.run(&cell, Target::Boundary(Boundary::Commit), |conn| conn.commit())?;
                transaction::left(&cell);
                self.inner.slots.notify_idle();
            }
        }
        Ok(())
    }

    /// Roll back and close every nesting level on this thread.
    pub fn rollback(&self) -> DbResult<()> {
        let cell = self.cell()?;
        let was_open = cell.depth() > 0;

        if was_open && self.is_stale(&cell) {
            // The engine discarded the transaction together with the connection.
            tracing::debug!("Rollback after connection invalidation, nothing to undo");
            transaction::reset(&cell);
            self.inner.slots.notify_idle();
            return Ok(());
        }

        let result = self.run(&cell, Target::Boundary(Boundary::Rollback), |conn| {
            conn.rollback()
        });
        transaction::reset(&cell);
        if was_open {
            self.inner.slots.notify_idle();
        }
        result
    }

    /// Begin a transaction that rolls back unless committed.
    pub fn transaction(&self) -> DbResult<Transaction<'_>> {
        Transaction::begin(self)
    }

    pub fn is_in_transaction(&self) -> bool {
        self.transaction_depth() > 0
    }

    pub fn transaction_depth(&self) -> usize {
        self.inner
            .slots
            .existing_cell()
            .map(|cell| cell.depth())
            .unwrap_or(0)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop accepting statements, wait for open transactions to finish and
    /// close every connection.
    ///
    /// Transactions still open when the wait times out are reported and
    /// their connections left alone; calling `close()` again retries them.
    pub fn close(&self) -> DbResult<()> {
        if self.is_in_transaction() {
            return Err(DbError::internal(
                "close() called with a transaction open on the calling thread",
            ));
        }

        self.inner.closing.store(true, Ordering::SeqCst);
        tracing::info!("Closing database backend");

        if let Err(busy) = self.inner.slots.wait_for_idle(self.inner.close_timeout) {
            tracing::warn!(
                "Timed out after {:?} waiting for transactions on: {}",
                self.inner.close_timeout,
                busy.join(", ")
            );
        }

        let stuck = self.inner.slots.close_idle();
        if stuck.is_empty() {
            tracing::info!("Database backend closed");
            Ok(())
        } else {
            Err(DbError::StuckTransactions { threads: stuck })
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn cell(&self) -> DbResult<Arc<RecordCell>> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return match self.inner.slots.existing_cell() {
                Some(cell) if cell.depth() > 0 => Ok(cell),
                _ => Err(DbError::Closing),
            };
        }
        Ok(self.inner.slots.cell_for_current_thread())
    }

    fn is_stale(&self, cell: &RecordCell) -> bool {
        cell.generation() < self.current_generation()
    }

    fn lose_transaction(&self, cell: &RecordCell, error: DriverError) -> DbError {
        tracing::warn!(
            "Transaction on {} lost with its connection: {}",
            cell.thread_name(),
            error
        );
        transaction::reset(cell);
        self.inner.slots.notify_idle();
        DbError::TransactionLost(error)
    }

    /// Run `op` with lock retries, escalating what retrying cannot fix.
    fn run<T>(
        &self,
        cell: &RecordCell,
        target: Target<'_>,
        mut op: impl FnMut(&mut dyn DbConnection) -> Result<T, DriverError>,
    ) -> DbResult<T> {
        if cell.depth() > 0 && self.is_stale(cell) {
            return Err(self.lose_transaction(
                cell,
                DriverError::connection("connection invalidated while the transaction was open"),
            ));
        }
        let generation = cell.generation();

        let failure = match self.attempt(cell, target, &mut op) {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };
        if cell.is_closed() {
            // `close()` swept this record after the caller got past `cell()`.
            return Err(DbError::Closing);
        }

        let Some(kind) = EscalationKind::for_class(failure.error.class) else {
            return Err(DbError::from_driver(failure.error, failure.attempts));
        };
        if !self.inner.channel.has_handler() {
            return Err(DbError::from_driver(failure.error, failure.attempts));
        }

        match self.inner.channel.escalate(kind, &failure.error, target.text())? {
            Resolution::Abort => Err(DbError::Aborted(failure.error)),
            Resolution::Continue => {
                if cell.depth() > 0 && self.current_generation() > generation {
                    return Err(self.lose_transaction(cell, failure.error));
                }
                // One more try; whatever happens now goes back to the caller.
                self.attempt(cell, target, &mut op)
                    .map_err(|f| DbError::from_driver(f.error, f.attempts))
            }
        }
    }

    fn attempt<T>(
        &self,
        cell: &RecordCell,
        target: Target<'_>,
        op: &mut impl FnMut(&mut dyn DbConnection) -> Result<T, DriverError>,
    ) -> Result<T, RetryFailure> {
        let slots = &self.inner.slots;
        let once = || slots.with_connection(cell, |conn| op(conn));
        match target {
            Target::Statement(sql) => self.inner.retry.retry_statement(sql, once),
            Target::Boundary(boundary) => self.inner.retry.retry_boundary(boundary, once),
        }
    }
}

impl std::fmt::Debug for DbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbBackend")
            .field("driver", &self.driver_name())
            .field("status", &self.status())
            .field("parameters", &self.inner.parameters_hash)
            .finish()
    }
}
