use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use clepho_dbengine::config::{Config, DatabaseConfig};
use clepho_dbengine::db::{DbAction, DbBackend, DbError, Params, Value};
use tempfile::TempDir;

fn open(dir: &TempDir) -> DbBackend {
    let mut config = Config::default();
    config.database = DatabaseConfig::sqlite(dir.path().join("clepho.db"));
    config.actions = vec![DbAction {
        name: "add_tag".to_string(),
        transactional: true,
        statements: vec![
            "INSERT INTO tags (name) VALUES (:name)".to_string(),
            "UPDATE tags SET uses = uses + :uses WHERE name = :name".to_string(),
        ],
    }];
    let db = DbBackend::open(&config).unwrap();
    db.execute(
        "CREATE TABLE IF NOT EXISTS tags (id INTEGER PRIMARY KEY, name TEXT UNIQUE, uses INTEGER DEFAULT 0)",
        (),
    )
    .unwrap();
    db
}

fn tag_count(db: &DbBackend) -> i64 {
    db.execute("SELECT COUNT(*) FROM tags", ())
        .unwrap()
        .scalar()
        .and_then(Value::as_i64)
        .unwrap()
}

#[test]
fn test_commit_and_rollback_against_sqlite() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);

    let tx = db.transaction().unwrap();
    let inserted = tx
        .execute("INSERT INTO tags (name) VALUES (?1)", Params::positional(["beach"]))
        .unwrap();
    assert_eq!(inserted.last_insert_id, Some(1));
    tx.commit().unwrap();

    db.begin_transaction().unwrap();
    db.execute("INSERT INTO tags (name) VALUES ('forest')", ()).unwrap();
    db.rollback().unwrap();

    let rows = db.execute("SELECT name FROM tags ORDER BY id", ()).unwrap();
    assert_eq!(rows.columns, vec!["name"]);
    assert_eq!(rows.rows, vec![vec![Value::from("beach")]]);
}

#[test]
fn test_named_action_against_sqlite() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);

    db.exec_action("add_tag", &[("name", Value::from("sunset")), ("uses", Value::Integer(3))])
        .unwrap();

    let uses = db
        .execute("SELECT uses FROM tags WHERE name = :name", Params::named([(":name", "sunset")]))
        .unwrap();
    assert_eq!(uses.scalar(), Some(&Value::Integer(3)));

    // Second insert violates UNIQUE; the whole action rolls back.
    let err = db
        .exec_action("add_tag", &[("name", Value::from("sunset")), ("uses", Value::Integer(1))])
        .unwrap_err();
    assert!(matches!(err, DbError::Sql(_)), "unexpected error: {err}");
    assert!(!db.is_in_transaction());
    assert_eq!(tag_count(&db), 1);
}

#[test]
fn test_writer_waits_out_another_threads_lock() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let barrier = Arc::new(Barrier::new(2));

    let holder_db = db.clone();
    let holder_barrier = barrier.clone();
    let holder = thread::spawn(move || {
        holder_db.begin_transaction().unwrap();
        holder_db
            .execute("INSERT INTO tags (name) VALUES ('held')", ())
            .unwrap();
        holder_barrier.wait();
        thread::sleep(Duration::from_millis(60));
        holder_db.commit().unwrap();
    });

    barrier.wait();
    db.execute("INSERT INTO tags (name) VALUES ('waiting')", ())
        .unwrap();
    holder.join().unwrap();

    assert_eq!(tag_count(&db), 2);
}

#[test]
fn test_sql_errors_are_not_escalated() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);

    let err = db.execute("SELECT * FROM missing_table", ()).unwrap_err();
    assert!(matches!(err, DbError::Sql(_)), "unexpected error: {err}");
    assert_eq!(db.escalation_episodes(), 0);
    assert_eq!(db.driver_name(), "sqlite");
    assert_eq!(db.parameters_hash().len(), 32);
    assert!(db.last_error().unwrap().message.contains("missing_table"));
}
