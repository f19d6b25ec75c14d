//! Scripted driver for exercising the backend without a real engine.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use clepho_dbengine::config::Config;
use clepho_dbengine::db::{
    DbBackend, DbBackendBuilder, DbConnection, Driver, DriverError, Params, QueryResult, Value,
};

/// Statement that answers with the id of the connection it ran on.
pub const CONNECTION_ID: &str = "SELECT connection_id()";

struct Failure {
    pattern: String,
    remaining: usize,
    error: DriverError,
}

/// Holds a statement inside the driver until released.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
    reached: AtomicBool,
}

impl Gate {
    pub fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }

    /// Whether a statement is (or was) held at the gate.
    pub fn reached(&self) -> bool {
        self.reached.load(Ordering::SeqCst)
    }

    fn pass(&self) {
        self.reached.store(true, Ordering::SeqCst);
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
    }
}

/// Shared record of everything the scripted connections saw, plus the
/// failures they should inject.
#[derive(Default)]
pub struct Script {
    log: Mutex<Vec<(usize, String)>>,
    failures: Mutex<Vec<Failure>>,
    gates: Mutex<Vec<(String, Arc<Gate>)>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` statements containing `pattern` with `error`.
    pub fn fail(&self, pattern: &str, times: usize, error: DriverError) {
        self.failures.lock().unwrap().push(Failure {
            pattern: pattern.to_string(),
            remaining: times,
            error,
        });
    }

    pub fn fail_always(&self, pattern: &str, error: DriverError) {
        self.fail(pattern, usize::MAX, error);
    }

    /// Hold statements containing `pattern` until the returned gate is released.
    pub fn hold(&self, pattern: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates.lock().unwrap().push((pattern.to_string(), gate.clone()));
        gate
    }

    fn gate_for(&self, sql: &str) -> Option<Arc<Gate>> {
        self.gates
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| sql.contains(pattern))
            .map(|(_, gate)| gate.clone())
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    /// Every statement attempt, in order.
    pub fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(_, sql)| sql.clone()).collect()
    }

    /// Attempts of exactly `sql`.
    pub fn count(&self, sql: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|(_, s)| s == sql).count()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn injected(&self, sql: &str) -> Option<DriverError> {
        let mut failures = self.failures.lock().unwrap();
        let failure = failures
            .iter_mut()
            .find(|f| f.remaining > 0 && sql.contains(&f.pattern))?;
        failure.remaining = failure.remaining.saturating_sub(1);
        Some(failure.error.clone())
    }
}

pub struct ScriptedDriver(pub Arc<Script>);

impl Driver for ScriptedDriver {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn open(&self) -> Result<Box<dyn DbConnection>, DriverError> {
        if let Some(error) = self.0.injected("<open>") {
            return Err(error);
        }
        let id = self.0.opens.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(ScriptedConnection {
            id,
            script: self.0.clone(),
        }))
    }
}

struct ScriptedConnection {
    id: usize,
    script: Arc<Script>,
}

impl DbConnection for ScriptedConnection {
    fn execute(&mut self, sql: &str, _params: &Params) -> Result<QueryResult, DriverError> {
        self.script.log.lock().unwrap().push((self.id, sql.to_string()));
        if let Some(gate) = self.script.gate_for(sql) {
            gate.pass();
        }
        if let Some(error) = self.script.injected(sql) {
            return Err(error);
        }
        if sql == CONNECTION_ID {
            return Ok(QueryResult {
                columns: vec!["id".to_string()],
                rows: vec![vec![Value::Integer(self.id as i64)]],
                ..QueryResult::default()
            });
        }
        Ok(QueryResult {
            rows_affected: 1,
            ..QueryResult::default()
        })
    }

    fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Config with retry delays short enough for tests.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry.max_retries = 3;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.close.timeout_ms = 2_000;
    config
}

pub fn builder(script: &Arc<Script>) -> DbBackendBuilder {
    DbBackend::builder(fast_config()).driver(Arc::new(ScriptedDriver(script.clone())))
}

pub fn backend(script: &Arc<Script>) -> DbBackend {
    builder(script).build().unwrap()
}

pub fn connection_id(backend: &DbBackend) -> i64 {
    backend
        .execute(CONNECTION_ID, ())
        .unwrap()
        .scalar()
        .and_then(Value::as_i64)
        .unwrap()
}

/// Poll `condition` until it holds, panicking after a few seconds.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}
