//! Transaction depth tracking.
//!
//! Nested `begin` calls on one thread collapse into the outermost physical
//! transaction: only the 0 -> 1 step issues BEGIN and only the 1 -> 0 step
//! issues COMMIT. ROLLBACK always ends the whole chain.

use std::marker::PhantomData;

use super::backend::DbBackend;
use super::error::{DbError, DbResult};
use super::slots::RecordCell;
use super::value::{Params, QueryResult};

/// What a commit at the current depth has to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitStep {
    /// Inner level: just pop it.
    Nested,
    /// Outermost level: issue the physical COMMIT.
    Physical,
}

/// Whether entering a transaction needs a physical BEGIN.
pub(crate) fn needs_begin(cell: &RecordCell) -> bool {
    cell.depth() == 0
}

pub(crate) fn entered(cell: &RecordCell) {
    cell.set_depth(cell.depth() + 1);
}

pub(crate) fn commit_step(cell: &RecordCell) -> DbResult<CommitStep> {
    match cell.depth() {
        0 => Err(DbError::internal(
            "commit without a matching begin (transaction depth is already 0)",
        )),
        1 => Ok(CommitStep::Physical),
        _ => Ok(CommitStep::Nested),
    }
}

/// Pop one level after the commit step succeeded. Returns the new depth.
pub(crate) fn left(cell: &RecordCell) -> usize {
    let depth = cell.depth().saturating_sub(1);
    cell.set_depth(depth);
    depth
}

pub(crate) fn reset(cell: &RecordCell) {
    cell.set_depth(0);
}

/// Scoped transaction on the calling thread.
///
/// Dropping the guard without `commit()` rolls the transaction back, which
/// ends any enclosing transactions on this thread as well.
#[must_use = "dropping a Transaction rolls it back"]
pub struct Transaction<'a> {
    backend: &'a DbBackend,
    finished: bool,
    /// Depth lives with the thread that began it.
    _not_send: PhantomData<*const ()>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(backend: &'a DbBackend) -> DbResult<Self> {
        backend.begin_transaction()?;
        Ok(Self {
            backend,
            finished: false,
            _not_send: PhantomData,
        })
    }

    pub fn execute(&self, sql: &str, params: impl Into<Params>) -> DbResult<QueryResult> {
        self.backend.execute(sql, params)
    }

    /// Commit this level. If the commit fails the guard stays armed and
    /// rolls the transaction back when it drops.
    pub fn commit(mut self) -> DbResult<()> {
        self.backend.commit()?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> DbResult<()> {
        self.finished = true;
        self.backend.rollback()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished || !self.backend.is_in_transaction() {
            return;
        }
        if let Err(e) = self.backend.rollback() {
            tracing::warn!("Rollback of abandoned transaction failed: {}", e);
        }
    }
}
