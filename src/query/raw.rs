//! Guarded read-only passthrough to the storage backend.
//!
//! Statements are checked for write keywords and length before they reach
//! the backend. Values are never spliced into the statement; they travel in
//! the bound parameter map.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use super::QueryError;
use crate::config::QuerySettings;
use crate::storage::{Params, Row, StorageBackend};

/// Keywords that make a statement a write.
pub const WRITE_KEYWORDS: &[&str] = &[
    "DELETE", "DROP", "CREATE", "SET", "REMOVE", "MERGE", "DETACH", "INSTALL", "LOAD", "COPY", "CALL",
];

fn write_keyword() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(&format!(r"(?i)\b({})\b", WRITE_KEYWORDS.join("|"))).ok())
        .as_ref()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawQueryResult {
    pub rows: Vec<Row>,
    /// Rows the backend returned before the row cap
    pub total_rows: usize,
    /// Rows were dropped by the row cap
    pub partial: bool,
    /// Cells shortened by the cell cap
    pub truncated_cells: usize,
}

/// Check `statement` without running it.
pub fn check_statement(statement: &str, settings: &QuerySettings) -> Result<(), QueryError> {
    let trimmed = statement.trim();
    if trimmed.is_empty() {
        return Err(QueryError::Rejected("empty statement".into()));
    }
    if statement.len() > settings.max_statement_len {
        return Err(QueryError::Rejected(format!(
            "statement is {} bytes, limit is {}",
            statement.len(),
            settings.max_statement_len
        )));
    }
    let Some(re) = write_keyword() else {
        return Err(QueryError::Rejected("write guard unavailable".into()));
    };
    if let Some(m) = re.find(trimmed) {
        return Err(QueryError::Rejected(format!(
            "only read-only statements are allowed, found {}",
            m.as_str().to_uppercase()
        )));
    }
    Ok(())
}

pub(crate) fn execute(
    backend: &dyn StorageBackend,
    statement: &str,
    params: &Params,
    settings: &QuerySettings,
) -> Result<RawQueryResult, QueryError> {
    if let Err(e) = check_statement(statement, settings) {
        tracing::warn!(error = %e, "raw query rejected");
        return Err(e);
    }

    let mut rows = backend.execute_read(statement, params)?;
    let total_rows = rows.len();
    let partial = total_rows > settings.max_rows;
    rows.truncate(settings.max_rows);

    let mut truncated_cells = 0;
    for row in rows.iter_mut() {
        for value in row.values_mut() {
            if let Some(short) = truncate_cell(value, settings.max_cell_len) {
                *value = short;
                truncated_cells += 1;
            }
        }
    }
    if partial {
        tracing::debug!(total_rows, cap = settings.max_rows, "raw query truncated");
    }
    Ok(RawQueryResult {
        rows,
        total_rows,
        partial,
        truncated_cells,
    })
}

/// Shortened form of `value` if its text exceeds `max` characters.
fn truncate_cell(value: &serde_json::Value, max: usize) -> Option<serde_json::Value> {
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => value.to_string(),
        _ => return None,
    };
    if text.chars().count() <= max {
        return None;
    }
    let mut short: String = text.chars().take(max).collect();
    short.push_str("...");
    Some(serde_json::Value::String(short))
}
