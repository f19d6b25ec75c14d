//! Named database actions.
//!
//! An action is a configured list of statements run in order under one
//! name, optionally inside a single transaction. Bindings are supplied by
//! name and each statement receives only the ones it mentions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::error::{DbError, DbResult};
use super::value::{Params, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbAction {
    pub name: String,

    /// Run all statements inside one transaction.
    #[serde(default)]
    pub transactional: bool,

    pub statements: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct ActionRegistry {
    actions: HashMap<String, DbAction>,
}

impl ActionRegistry {
    pub(crate) fn new(actions: impl IntoIterator<Item = DbAction>) -> Self {
        let mut registry = HashMap::new();
        for action in actions {
            if registry.contains_key(&action.name) {
                tracing::warn!("Duplicate database action {:?}, keeping the last one", action.name);
            }
            registry.insert(action.name.clone(), action);
        }
        Self { actions: registry }
    }

    pub(crate) fn get(&self, name: &str) -> DbResult<&DbAction> {
        self.actions
            .get(name)
            .ok_or_else(|| DbError::internal(format!("unknown database action {:?}", name)))
    }
}

/// Names of the `:name` placeholders in `sql`, in order of first use.
/// Quoted text and `::` casts are skipped.
pub fn placeholder_names(sql: &str) -> Vec<String> {
    let bytes = sql.as_bytes();
    let mut names: Vec<String> = Vec::new();
    let mut in_quote = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c == b'\'' {
            in_quote = !in_quote;
            i += 1;
            continue;
        }
        if in_quote || c != b':' {
            i += 1;
            continue;
        }
        if bytes.get(i + 1) == Some(&b':') {
            i += 2;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
            end += 1;
        }
        if end > start && !bytes[start].is_ascii_digit() {
            let name = &sql[start..end];
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        i = end.max(i + 1);
    }
    names
}

/// Pick out the bindings `sql` uses. A placeholder without a binding is a
/// caller error.
pub(crate) fn bind_for(sql: &str, bindings: &[(&str, Value)]) -> DbResult<Params> {
    let names = placeholder_names(sql);
    if names.is_empty() {
        return Ok(Params::Empty);
    }
    let mut params = Vec::with_capacity(names.len());
    for name in names {
        let value = bindings
            .iter()
            .find(|(key, _)| key.trim_start_matches(':') == name)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| DbError::internal(format!("no binding for :{} in {:?}", name, sql)))?;
        params.push((format!(":{}", name), value));
    }
    Ok(Params::Named(params))
}
