//! clepho-dbshell: run SQL through the database backend.
//!
//! Statements come from the command line or stdin and run on a worker
//! thread. The main thread is the privileged context: when the connection
//! fails it asks on the terminal whether to reconnect or give up.

use anyhow::{anyhow, Result};
use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clepho_dbengine::config::{Config, DatabaseType};
use clepho_dbengine::db::{
    DbBackend, DbResult, DriverError, ErrorAnswer, ErrorHandler, PrivilegedContext, QueryResult,
    Value,
};
use clepho_dbengine::logging;

#[derive(Default)]
struct ShellArgs {
    config_path: Option<PathBuf>,
    db_path: Option<PathBuf>,
    statements: Vec<String>,
}

fn parse_args() -> ShellArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut shell = ShellArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("clepho-dbshell {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    shell.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    shell.db_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --db requires a path argument");
                    std::process::exit(1);
                }
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
            sql => shell.statements.push(sql.to_string()),
        }
        i += 1;
    }

    shell
}

fn print_help() {
    println!(
        r#"clepho-dbshell - run SQL against the clepho database backend

USAGE:
    clepho-dbshell [OPTIONS] [SQL...]

OPTIONS:
    --config, -c PATH   Path to config file
    --db, -d PATH       SQLite database file (overrides the config)
    --version, -V       Show version
    --help, -h          Show this help message

Without SQL arguments, statements are read from stdin and split on ';'.
BEGIN, COMMIT and ROLLBACK use the backend's nested transactions.
A line of the form '@name key=value ...' runs a configured action.

ENVIRONMENT:
    CLEPHO_DB_LOG       Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/clepho/dbengine.toml"#
    );
}

/// Asks on the terminal what to do about a failed connection.
struct ConsoleErrorHandler {
    interactive: bool,
}

impl ConsoleErrorHandler {
    fn ask(&self, question: &str) -> bool {
        if !self.interactive {
            eprintln!("{} [y/N] n (stdin is not a terminal)", question);
            return false;
        }
        eprint!("{} [y/N] ", question);
        let _ = io::stderr().flush();
        let mut line = String::new();
        match io::stdin().read_line(&mut line) {
            Ok(_) => matches!(line.trim(), "y" | "Y" | "yes"),
            Err(_) => false,
        }
    }
}

impl ErrorHandler for ConsoleErrorHandler {
    fn on_connection_error(&self, answer: ErrorAnswer, error: &DriverError, statement: &str) {
        eprintln!("Database connection failed while running:\n    {}\n{}", statement, error);
        if self.ask("Reconnect and continue?") {
            answer.invalidate_connections();
            answer.continue_queries();
        } else {
            answer.abort_queries();
        }
    }

    fn on_consultation_required(&self, answer: ErrorAnswer, error: &DriverError, statement: &str) {
        eprintln!("The database needs attention before continuing:\n    {}\n{}", statement, error);
        if self.ask("Try the statement again?") {
            answer.continue_queries();
        } else {
            answer.abort_queries();
        }
    }
}

fn main() -> Result<()> {
    let args = parse_args();

    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let mut config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(path) = args.db_path {
        config.database.backend = DatabaseType::Sqlite;
        config.database.sqlite_path = path;
    }

    let interactive = args.statements.is_empty() && io::stdin().is_terminal();
    let script = if args.statements.is_empty() {
        let mut input = String::new();
        io::stdin().read_to_string(&mut input)?;
        input
    } else {
        args.statements.join(";\n")
    };
    let statements = split_statements(&script);
    if statements.is_empty() {
        return Ok(());
    }

    let (privileged, event_loop) = PrivilegedContext::for_current_thread();
    let backend = DbBackend::builder(config)
        .error_handler(Arc::new(ConsoleErrorHandler { interactive }), privileged)
        .build()?;

    let worker_backend = backend.clone();
    let worker = thread::Builder::new()
        .name("dbshell-worker".to_string())
        .spawn(move || run_script(&worker_backend, &statements))?;

    while !worker.is_finished() {
        event_loop.run_for(Duration::from_millis(50));
    }
    let failures = worker
        .join()
        .map_err(|_| anyhow!("worker thread panicked"))?;

    backend.close()?;

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Run every statement in order, returning how many failed.
fn run_script(backend: &DbBackend, statements: &[String]) -> usize {
    let mut failures = 0;

    for sql in statements {
        match run_one(backend, sql) {
            Ok(Some(result)) => print_result(&result),
            Ok(None) => {}
            Err(e) => {
                failures += 1;
                eprintln!("Error: {}", e);
            }
        }
    }

    if backend.is_in_transaction() {
        eprintln!("Rolling back transaction left open at end of input");
        if let Err(e) = backend.rollback() {
            eprintln!("Error: {}", e);
            failures += 1;
        }
    }

    failures
}

fn run_one(backend: &DbBackend, sql: &str) -> DbResult<Option<QueryResult>> {
    if let Some(action) = sql.strip_prefix('@') {
        let (name, bindings) = parse_action(action);
        let bindings: Vec<(&str, Value)> = bindings
            .iter()
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect();
        let results = backend.exec_action(&name, &bindings)?;
        return Ok(results.into_iter().last());
    }

    match sql.to_ascii_uppercase().as_str() {
        "BEGIN" | "BEGIN TRANSACTION" => backend.begin_transaction().map(|_| None),
        "COMMIT" | "END" | "COMMIT TRANSACTION" => backend.commit().map(|_| None),
        "ROLLBACK" | "ROLLBACK TRANSACTION" => backend.rollback().map(|_| None),
        _ => backend.execute(sql, ()).map(Some),
    }
}

/// `name key=value ...`; values that parse as integers bind as integers.
fn parse_action(text: &str) -> (String, Vec<(String, Value)>) {
    let mut words = text.split_whitespace();
    let name = words.next().unwrap_or_default().to_string();
    let bindings = words
        .filter_map(|word| word.split_once('='))
        .map(|(key, value)| {
            let value = match value.parse::<i64>() {
                Ok(n) => Value::Integer(n),
                Err(_) => Value::from(value),
            };
            (key.to_string(), value)
        })
        .collect();
    (name, bindings)
}

/// Split a script on `;` outside single-quoted text.
fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;

    for c in script.chars() {
        match c {
            '\'' => {
                in_quote = !in_quote;
                current.push(c);
            }
            ';' if !in_quote => statements.push(std::mem::take(&mut current)),
            '\n' if !in_quote && current.trim_start().starts_with('@') => {
                statements.push(std::mem::take(&mut current))
            }
            _ => current.push(c),
        }
    }
    statements.push(current);

    statements
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn print_result(result: &QueryResult) {
    if result.columns.is_empty() {
        println!("OK ({} rows affected)", result.rows_affected);
        return;
    }

    println!("{}", result.columns.join("\t"));
    for row in &result.rows {
        let cells: Vec<String> = row.iter().map(Value::to_string).collect();
        println!("{}", cells.join("\t"));
    }
    println!("({} rows)", result.rows.len());
}
