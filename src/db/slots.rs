//! Per-thread connection ownership.
//!
//! Every thread that touches the database gets its own `RecordCell` holding
//! one physical connection. The registry map is only locked to add or remove
//! a thread; a thread finds its own cell through a thread-local lookup. The
//! cell's inner mutex is uncontended except while `close()` sweeps records.

use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use super::driver::{DbConnection, Driver};
use super::error::{DriverError, ErrorClass};

/// Process-wide connection generation. A record stamped with an older
/// generation is stale and gets reopened before its next use.
#[derive(Debug, Default)]
pub struct ValidityEpoch(AtomicU64);

impl ValidityEpoch {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Mark every existing connection stale. Returns the new generation.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Most recent failure seen on a thread's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl From<&DriverError> for LastError {
    fn from(error: &DriverError) -> Self {
        Self {
            class: error.class,
            message: error.message.clone(),
            at: Utc::now(),
        }
    }
}

pub(crate) struct ConnectionRecord {
    connection: Option<Box<dyn DbConnection>>,
    generation: u64,
    last_error: Option<LastError>,
    /// Swept by `close()`. A closed record never opens again.
    closed: bool,
}

impl ConnectionRecord {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    fn close_connection(&mut self) {
        if let Some(conn) = self.connection.take() {
            if let Err(e) = conn.close() {
                tracing::debug!("Ignoring error while closing connection: {}", e);
            }
        }
    }
}

pub(crate) struct RecordCell {
    thread: ThreadId,
    thread_name: String,
    /// Transaction depth. Written only by the owning thread.
    depth: AtomicUsize,
    record: Mutex<ConnectionRecord>,
}

impl RecordCell {
    fn new() -> Self {
        let current = thread::current();
        let thread_name = current
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", current.id()));
        Self {
            thread: current.id(),
            thread_name,
            depth: AtomicUsize::new(0),
            record: Mutex::new(ConnectionRecord {
                connection: None,
                generation: 0,
                last_error: None,
                closed: false,
            }),
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub(crate) fn set_depth(&self, depth: usize) {
        self.depth.store(depth, Ordering::SeqCst);
    }

    pub(crate) fn thread_name(&self) -> &str {
        &self.thread_name
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub(crate) fn has_connection(&self) -> bool {
        self.lock().connection.is_some()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn last_error(&self) -> Option<LastError> {
        self.lock().last_error.clone()
    }

    pub(crate) fn record_error(&self, error: &DriverError) {
        self.lock().last_error = Some(error.into());
    }
}

pub(crate) struct ConnectionSlots {
    id: u64,
    driver: Arc<dyn Driver>,
    epoch: Arc<ValidityEpoch>,
    records: Mutex<HashMap<ThreadId, Arc<RecordCell>>>,
    /// Signalled whenever a thread's transaction depth drops to zero.
    idle: Condvar,
    opened: AtomicBool,
}

impl ConnectionSlots {
    pub(crate) fn new(driver: Arc<dyn Driver>, epoch: Arc<ValidityEpoch>) -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::SeqCst),
            driver,
            epoch,
            records: Mutex::new(HashMap::new()),
            idle: Condvar::new(),
            opened: AtomicBool::new(false),
        })
    }

    pub(crate) fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    pub(crate) fn epoch(&self) -> &Arc<ValidityEpoch> {
        &self.epoch
    }

    /// Whether any connection has ever opened successfully.
    pub(crate) fn has_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ThreadId, Arc<RecordCell>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The calling thread's cell, if it has touched this backend.
    pub(crate) fn existing_cell(&self) -> Option<Arc<RecordCell>> {
        LOCAL_CELLS.with(|local| local.borrow().find(self.id))
    }

    /// The calling thread's cell, registering the thread on first use.
    pub(crate) fn cell_for_current_thread(self: &Arc<Self>) -> Arc<RecordCell> {
        if let Some(cell) = self.existing_cell() {
            return cell;
        }
        let cell = Arc::new(RecordCell::new());
        self.registry().insert(cell.thread, cell.clone());
        let pruned = LOCAL_CELLS.with(|local| {
            let mut local = local.borrow_mut();
            let pruned = local.prune();
            local.entries.push(LocalEntry {
                slots_id: self.id,
                slots: Arc::downgrade(self),
                cell: cell.clone(),
            });
            pruned
        });
        // Outside the borrow: closing a connection may run driver code.
        drop(pruned);
        tracing::debug!("Registered database thread {}", cell.thread_name);
        cell
    }

    /// Lock the thread's record with a live connection, opening a fresh one
    /// if the record has none or its generation is stale.
    pub(crate) fn acquire<'a>(
        &self,
        cell: &'a RecordCell,
    ) -> Result<MutexGuard<'a, ConnectionRecord>, DriverError> {
        let current = self.epoch.current();
        let mut record = cell.lock();

        if record.closed {
            return Err(DriverError::connection("connection closed by backend shutdown"));
        }
        if record.connection.is_some() && record.generation >= current {
            return Ok(record);
        }

        if record.connection.is_some() {
            tracing::debug!(
                "Connection for {} is stale (generation {} < {}), reopening",
                cell.thread_name,
                record.generation,
                current
            );
        }
        record.close_connection();
        // Stamped even on failure so the next attempt starts fresh.
        record.generation = current;

        match self.driver.open() {
            Ok(conn) => {
                record.connection = Some(conn);
                self.opened.store(true, Ordering::SeqCst);
                Ok(record)
            }
            Err(error) => {
                tracing::warn!("Failed to open {} connection: {}", self.driver.name(), error);
                let error = DriverError {
                    class: ErrorClass::Connection,
                    ..error
                };
                record.last_error = Some((&error).into());
                Err(error)
            }
        }
    }

    /// Run `op` on the thread's live connection.
    pub(crate) fn with_connection<T>(
        &self,
        cell: &RecordCell,
        op: impl FnOnce(&mut dyn DbConnection) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let mut record = self.acquire(cell)?;
        let result = match record.connection.as_deref_mut() {
            Some(conn) => op(conn),
            None => Err(DriverError::connection("no live connection")),
        };
        if let Err(error) = &result {
            record.last_error = Some(error.into());
        }
        result
    }

    pub(crate) fn invalidate_all(&self) -> u64 {
        let generation = self.epoch.advance();
        tracing::info!("Invalidated all database connections (generation {})", generation);
        generation
    }

    pub(crate) fn notify_idle(&self) {
        let _registry = self.registry();
        self.idle.notify_all();
    }

    /// Wait until no registered thread holds an open transaction.
    /// On timeout, returns the names of the threads still in one.
    pub(crate) fn wait_for_idle(&self, timeout: Duration) -> Result<(), Vec<String>> {
        let deadline = Instant::now() + timeout;
        let mut registry = self.registry();
        loop {
            let busy: Vec<String> = registry
                .values()
                .filter(|cell| cell.depth() > 0)
                .map(|cell| cell.thread_name.clone())
                .collect();
            if busy.is_empty() {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(busy);
            }
            registry = self
                .idle
                .wait_timeout(registry, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Close every record without an open transaction. Records still inside
    /// one are left untouched; their thread names are returned.
    pub(crate) fn close_idle(&self) -> Vec<String> {
        let mut registry = self.registry();
        let mut stuck = Vec::new();
        registry.retain(|_, cell| {
            if cell.depth() > 0 {
                stuck.push(cell.thread_name.clone());
                return true;
            }
            let mut record = cell.lock();
            record.close_connection();
            record.closed = true;
            false
        });
        stuck
    }

    fn deregister(&self, thread: ThreadId) {
        let cell = self.registry().remove(&thread);
        if let Some(cell) = cell {
            cell.lock().close_connection();
            tracing::debug!("Released database connection for exiting thread {}", cell.thread_name);
            self.notify_idle();
        }
    }

    #[cfg(test)]
    pub(crate) fn registered_threads(&self) -> usize {
        self.registry().len()
    }
}

#[cfg(test)]
fn local_entries() -> usize {
    LOCAL_CELLS.with(|local| local.borrow().entries.len())
}

struct LocalEntry {
    slots_id: u64,
    slots: Weak<ConnectionSlots>,
    cell: Arc<RecordCell>,
}

/// The calling thread's cells, one per backend it has used. Dropped when the
/// thread exits, which tears down its connections.
#[derive(Default)]
struct LocalCells {
    entries: Vec<LocalEntry>,
}

impl LocalCells {
    fn find(&self, slots_id: u64) -> Option<Arc<RecordCell>> {
        self.entries
            .iter()
            .find(|e| e.slots_id == slots_id)
            .map(|e| e.cell.clone())
    }

    /// Take out the entries of backends that no longer exist.
    fn prune(&mut self) -> Vec<LocalEntry> {
        let (live, dead): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.slots.strong_count() > 0);
        self.entries = live;
        dead
    }
}

impl Drop for LocalCells {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            if let Some(slots) = entry.slots.upgrade() {
                slots.deregister(entry.cell.thread);
            }
        }
    }
}

thread_local! {
    static LOCAL_CELLS: RefCell<LocalCells> = RefCell::new(LocalCells::default());
}
