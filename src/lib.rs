//! Database engine backend core.
//!
//! One connection per thread, lock retries absorbed in place, and connection
//! failures escalated to a single application-supplied handler that runs on
//! a privileged thread. Start with [`DbBackend::builder`].

pub mod config;
pub mod db;
pub mod logging;

pub use config::Config;
pub use db::{DbBackend, DbError, DbResult, Params, QueryResult, Value};
