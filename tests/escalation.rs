mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use clepho_dbengine::db::{
    BackendStatus, DbBackend, DbError, DriverError, ErrorAnswer, ErrorHandler, PrivilegedContext,
    PrivilegedHandle, QueryStatus, Resolution,
};
use common::{backend, builder, connection_id, fast_config, wait_until, Script, ScriptedDriver};

/// Answers every escalation the same way and remembers what it saw.
struct RecordingHandler {
    resolution: Resolution,
    invalidate: bool,
    connection_errors: AtomicUsize,
    consultations: AtomicUsize,
    statements: Mutex<Vec<String>>,
    threads: Mutex<Vec<thread::ThreadId>>,
}

impl RecordingHandler {
    fn new(resolution: Resolution, invalidate: bool) -> Arc<Self> {
        Arc::new(Self {
            resolution,
            invalidate,
            connection_errors: AtomicUsize::new(0),
            consultations: AtomicUsize::new(0),
            statements: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.connection_errors.load(Ordering::SeqCst) + self.consultations.load(Ordering::SeqCst)
    }

    fn answer(&self, answer: ErrorAnswer, statement: &str) {
        self.statements.lock().unwrap().push(statement.to_string());
        self.threads.lock().unwrap().push(thread::current().id());
        if self.invalidate {
            answer.invalidate_connections();
        }
        match self.resolution {
            Resolution::Continue => answer.continue_queries(),
            Resolution::Abort => answer.abort_queries(),
        }
    }
}

impl ErrorHandler for RecordingHandler {
    fn on_connection_error(&self, answer: ErrorAnswer, _error: &DriverError, statement: &str) {
        self.connection_errors.fetch_add(1, Ordering::SeqCst);
        self.answer(answer, statement);
    }

    fn on_consultation_required(&self, answer: ErrorAnswer, _error: &DriverError, statement: &str) {
        self.consultations.fetch_add(1, Ordering::SeqCst);
        self.answer(answer, statement);
    }
}

fn spawn_update(db: &DbBackend, name: &str) -> thread::JoinHandle<Result<(), DbError>> {
    let db = db.clone();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || db.execute("UPDATE photos SET rating = 2", ()).map(|_| ()))
        .unwrap()
}

#[test]
fn test_without_handler_connection_errors_fail_directly() {
    let script = Script::new();
    let db = backend(&script);
    script.fail("SELECT", 1, DriverError::connection("server closed the connection"));

    let err = db.execute("SELECT 1", ()).unwrap_err();
    assert!(matches!(err, DbError::Connection(_)), "unexpected error: {err}");
    assert_eq!(db.escalation_episodes(), 0);
    assert_eq!(script.count("SELECT 1"), 1);
}

#[test]
fn test_concurrent_failures_share_one_decision() {
    let script = Script::new();
    let (privileged, event_loop) = PrivilegedContext::for_current_thread();
    let handler = RecordingHandler::new(Resolution::Continue, true);
    let db = builder(&script)
        .error_handler(handler.clone(), privileged)
        .build()
        .unwrap();
    let generation = db.current_generation();
    script.fail("UPDATE", 2, DriverError::connection("server closed the connection"));

    let first = spawn_update(&db, "worker-1");
    let second = spawn_update(&db, "worker-2");

    wait_until("both workers to wait", || db.waiting_threads() == 2);
    assert_eq!(db.query_status(), QueryStatus::Wait);
    wait_until("the handler to run", || event_loop.run_pending() > 0);

    first.join().unwrap().unwrap();
    second.join().unwrap().unwrap();

    assert_eq!(handler.calls(), 1);
    assert_eq!(handler.threads.lock().unwrap().as_slice(), &[thread::current().id()]);
    assert_eq!(db.escalation_episodes(), 1);
    assert_eq!(db.query_status(), QueryStatus::ExecuteNormal);
    assert_eq!(db.current_generation(), generation + 1);
    assert_eq!(script.count("UPDATE photos SET rating = 2"), 4);
}

#[test]
fn test_abort_fails_every_waiter() {
    let script = Script::new();
    let (privileged, event_loop) = PrivilegedContext::for_current_thread();
    let handler = RecordingHandler::new(Resolution::Abort, false);
    let db = builder(&script)
        .error_handler(handler.clone(), privileged)
        .build()
        .unwrap();
    script.fail("UPDATE", 2, DriverError::connection("server closed the connection"));

    let first = spawn_update(&db, "worker-1");
    let second = spawn_update(&db, "worker-2");

    wait_until("both workers to wait", || db.waiting_threads() == 2);
    wait_until("the handler to run", || event_loop.run_pending() > 0);

    for worker in [first, second] {
        let err = worker.join().unwrap().unwrap_err();
        assert!(matches!(err, DbError::Aborted(_)), "unexpected error: {err}");
    }
    assert_eq!(handler.calls(), 1);
    assert_eq!(db.query_status(), QueryStatus::ExecuteNormal);

    // The next statement runs normally.
    db.execute("UPDATE photos SET rating = 2", ()).unwrap();
}

#[test]
fn test_handler_runs_inline_on_privileged_thread() {
    let script = Script::new();
    let (privileged, _event_loop) = PrivilegedContext::for_current_thread();
    let handler = RecordingHandler::new(Resolution::Continue, false);
    let db = builder(&script)
        .error_handler(handler.clone(), privileged)
        .build()
        .unwrap();
    script.fail("DELETE", 1, DriverError::consultation("attempt to write a readonly database"));

    db.execute("DELETE FROM trash", ()).unwrap();

    assert_eq!(handler.consultations.load(Ordering::SeqCst), 1);
    assert_eq!(handler.statements.lock().unwrap().as_slice(), &["DELETE FROM trash"]);
    assert_eq!(script.count("DELETE FROM trash"), 2);
}

#[test]
fn test_privileged_thread_joining_an_episode_runs_the_handler() {
    let script = Script::new();
    let (privileged, _event_loop) = PrivilegedContext::for_current_thread();
    let handler = RecordingHandler::new(Resolution::Continue, false);
    let mut config = fast_config();
    config.escalation.timeout_ms = Some(5_000);
    let db = DbBackend::builder(config)
        .driver(Arc::new(ScriptedDriver(script.clone())))
        .error_handler(handler.clone(), privileged)
        .build()
        .unwrap();
    script.fail("UPDATE", 2, DriverError::connection("server closed the connection"));

    let worker = spawn_update(&db, "worker");
    wait_until("the worker to wait", || db.waiting_threads() == 1);

    // The handler task is queued for this thread, whose loop is never pumped.
    db.execute("UPDATE albums SET name = 'holiday'", ()).unwrap();
    worker.join().unwrap().unwrap();

    assert_eq!(handler.calls(), 1);
    assert_eq!(handler.threads.lock().unwrap().as_slice(), &[thread::current().id()]);
    assert_eq!(handler.statements.lock().unwrap().as_slice(), &["UPDATE photos SET rating = 2"]);
    assert_eq!(db.escalation_episodes(), 1);
    assert_eq!(db.query_status(), QueryStatus::ExecuteNormal);
}

/// Leaves the decision to a follow-up task on the privileged queue.
struct DialogHandler {
    privileged: PrivilegedHandle,
    shown: AtomicUsize,
}

impl ErrorHandler for DialogHandler {
    fn on_connection_error(&self, answer: ErrorAnswer, _error: &DriverError, _statement: &str) {
        self.shown.fetch_add(1, Ordering::SeqCst);
        self.privileged.dispatch(move || answer.continue_queries());
    }

    fn on_consultation_required(&self, answer: ErrorAnswer, _error: &DriverError, _statement: &str) {
        self.shown.fetch_add(1, Ordering::SeqCst);
        self.privileged.dispatch(move || answer.abort_queries());
    }
}

#[test]
fn test_deferred_answer_on_privileged_thread() {
    let script = Script::new();
    let (privileged, _event_loop) = PrivilegedContext::for_current_thread();
    let handler = Arc::new(DialogHandler {
        privileged: privileged.clone(),
        shown: AtomicUsize::new(0),
    });
    let mut config = fast_config();
    config.escalation.timeout_ms = Some(5_000);
    let db = DbBackend::builder(config)
        .driver(Arc::new(ScriptedDriver(script.clone())))
        .error_handler(handler.clone(), privileged)
        .build()
        .unwrap();

    script.fail("SELECT", 1, DriverError::connection("server closed the connection"));
    db.execute("SELECT 1", ()).unwrap();
    assert_eq!(script.count("SELECT 1"), 2);

    script.fail("DELETE", 1, DriverError::consultation("attempt to write a readonly database"));
    let err = db.execute("DELETE FROM trash", ()).unwrap_err();
    assert!(matches!(err, DbError::Aborted(_)), "unexpected error: {err}");
    assert_eq!(handler.shown.load(Ordering::SeqCst), 2);
}

#[test]
fn test_second_failure_after_continue_is_returned() {
    let script = Script::new();
    let (privileged, _event_loop) = PrivilegedContext::for_current_thread();
    let handler = RecordingHandler::new(Resolution::Continue, false);
    let db = builder(&script)
        .error_handler(handler.clone(), privileged)
        .build()
        .unwrap();
    script.fail_always("DELETE", DriverError::consultation("disk is full"));

    let err = db.execute("DELETE FROM trash", ()).unwrap_err();
    assert!(matches!(err, DbError::ConsultationRequired(_)), "unexpected error: {err}");
    assert_eq!(handler.calls(), 1);
    assert_eq!(script.count("DELETE FROM trash"), 2);
}

#[test]
fn test_escalation_timeout() {
    let script = Script::new();
    let (privileged, _event_loop) = PrivilegedContext::for_current_thread();
    let mut config = fast_config();
    config.escalation.timeout_ms = Some(50);
    let db = DbBackend::builder(config)
        .driver(Arc::new(ScriptedDriver(script.clone())))
        .error_handler(RecordingHandler::new(Resolution::Continue, false), privileged)
        .build()
        .unwrap();
    script.fail("UPDATE", 1, DriverError::connection("server closed the connection"));

    // The loop is never pumped, so nobody answers.
    let err = spawn_update(&db, "worker").join().unwrap().unwrap_err();
    assert!(matches!(err, DbError::EscalationTimeout(_)), "unexpected error: {err}");
    assert_eq!(db.waiting_threads(), 0);
}

#[test]
fn test_lost_privileged_context_aborts() {
    let script = Script::new();
    let (privileged, event_loop) = PrivilegedContext::for_current_thread();
    let db = builder(&script)
        .error_handler(RecordingHandler::new(Resolution::Continue, false), privileged)
        .build()
        .unwrap();
    drop(event_loop);
    script.fail("UPDATE", 1, DriverError::connection("server closed the connection"));

    let err = spawn_update(&db, "worker").join().unwrap().unwrap_err();
    assert!(matches!(err, DbError::Aborted(_)), "unexpected error: {err}");
}

#[test]
fn test_reconnect_inside_transaction_loses_it() {
    let script = Script::new();
    let (privileged, _event_loop) = PrivilegedContext::for_current_thread();
    let db = builder(&script)
        .error_handler(RecordingHandler::new(Resolution::Continue, true), privileged)
        .build()
        .unwrap();

    db.begin_transaction().unwrap();
    let before = connection_id(&db);
    script.fail("INSERT", 1, DriverError::connection("server closed the connection"));

    let err = db.execute("INSERT INTO tags VALUES (1)", ()).unwrap_err();
    assert!(matches!(err, DbError::TransactionLost(_)), "unexpected error: {err}");
    assert_eq!(db.transaction_depth(), 0);

    assert_ne!(connection_id(&db), before);
    assert!(db.commit().unwrap_err().is_internal());
}

#[test]
fn test_invalidate_all_reopens_lazily() {
    let script = Script::new();
    let db = backend(&script);

    let first = connection_id(&db);
    assert_eq!(connection_id(&db), first);

    let generation = db.invalidate_all();
    assert_eq!(db.current_generation(), generation);
    assert_eq!(script.opens(), 1);

    let second = connection_id(&db);
    assert_ne!(second, first);
    assert_eq!(db.acquire_for_current_thread().unwrap(), generation);
    assert_eq!(script.opens(), 2);
    assert_eq!(script.closes(), 1);
}

#[test]
fn test_failed_open_without_handler() {
    let script = Script::new();
    let db = backend(&script);
    script.fail("<open>", 1, DriverError::connection("could not connect to server"));

    assert_eq!(db.status(), BackendStatus::Unavailable);
    let err = db.execute("SELECT 1", ()).unwrap_err();
    assert!(matches!(err, DbError::Connection(_)), "unexpected error: {err}");
    assert_eq!(db.status(), BackendStatus::Unavailable);

    db.execute("SELECT 1", ()).unwrap();
    assert_eq!(db.status(), BackendStatus::Open);
}

#[test]
fn test_failed_open_escalates() {
    let script = Script::new();
    let (privileged, _event_loop) = PrivilegedContext::for_current_thread();
    let handler = RecordingHandler::new(Resolution::Continue, false);
    let db = builder(&script)
        .error_handler(handler.clone(), privileged)
        .build()
        .unwrap();
    script.fail("<open>", 1, DriverError::statement("unable to open database file"));

    db.execute("SELECT 1", ()).unwrap();
    assert_eq!(handler.connection_errors.load(Ordering::SeqCst), 1);
    assert_eq!(script.opens(), 1);
}

#[test]
fn test_exhausted_lock_asks_the_handler() {
    let script = Script::new();
    let (privileged, _event_loop) = PrivilegedContext::for_current_thread();
    let handler = RecordingHandler::new(Resolution::Continue, false);
    let db = builder(&script)
        .error_handler(handler.clone(), privileged)
        .build()
        .unwrap();
    // One more than the retry bound lets through.
    script.fail("UPDATE", 4, DriverError::lock("database is locked"));

    db.execute("UPDATE photos SET rating = 2", ()).unwrap();
    assert_eq!(handler.consultations.load(Ordering::SeqCst), 1);
    assert_eq!(script.count("UPDATE photos SET rating = 2"), 5);
}
