//! Batch execution with cross-database `USE` protection.
//!
//! Scripts are split on lines that contain only `GO`. Each batch is searched
//! for `USE <database>` statements outside comments and literals before
//! anything is sent to the server: a switch to a different catalog is
//! rejected when `disallow_use` is set, and a leading `USE` of the current
//! catalog is dropped as a no-op. The executor never opens a connection of
//! its own.

use std::sync::OnceLock;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CatalogSource, ContainError, CrossDatabaseUse};
use crate::options::HardenerOptions;
use crate::scanner::{MaskKind, Masked, masked_regions, sanitize};
use crate::session::{FromSqlValue, SqlSession, SqlValue};
use crate::Result;

/// Pre-compiled batch patterns.
struct BatchPatterns {
    separator: Regex,
    use_keyword: Regex,
}

impl BatchPatterns {
    fn instance() -> &'static Self {
        static PATTERNS: OnceLock<BatchPatterns> = OnceLock::new();
        PATTERNS.get_or_init(|| Self {
            separator: Regex::new(r"(?mi)^[ \t]*GO[ \t]*\r?$").expect("Invalid batch separator pattern"),
            use_keyword: Regex::new(r"(?i)\buse\b").expect("Invalid USE pattern"),
        })
    }
}

/// Splits a script on separator-only lines, dropping empty batches.
///
/// # Example
/// ```rust
/// use sqlcontain_core::executor::split_batches;
///
/// let batches = split_batches("SELECT 1\nGO\n\ngo  \nSELECT 2\n");
/// assert_eq!(batches, vec!["SELECT 1", "SELECT 2"]);
/// ```
pub fn split_batches(script: &str) -> Vec<&str> {
    BatchPatterns::instance()
        .separator
        .split(script)
        .map(str::trim)
        .filter(|batch| !batch.is_empty())
        .collect()
}

/// A `USE <database>` statement found in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
struct UseStatement {
    target: String,
    /// Only whitespace and comments precede it
    leading: bool,
    /// Byte offset past the name and an optional `;`
    end: usize,
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '@' | '#' | '$')
}

/// Reads a `[..]` or `".."` identifier starting at `start`, undoubling
/// escaped closers. Returns the name and the offset past the closer.
fn delimited_identifier(batch: &str, start: usize) -> (String, usize) {
    let mut chars = batch[start..].char_indices().peekable();
    let close = match chars.next() {
        Some((_, '[')) => ']',
        _ => '"',
    };

    let mut name = String::new();
    while let Some((i, c)) = chars.next() {
        if c == close {
            if chars.next_if(|&(_, n)| n == close).is_some() {
                name.push(close);
                continue;
            }
            return (name, start + i + 1);
        }
        name.push(c);
    }
    (name, batch.len())
}

/// Reads the database name after a `USE` keyword ending at `from`.
fn use_target(batch: &str, regions: &[Masked], from: usize) -> Option<(String, usize)> {
    let mut pos = from;
    loop {
        if let Ok(index) = regions.binary_search_by_key(&pos, |r| r.start) {
            let region = regions[index];
            match region.kind {
                MaskKind::Comment => {
                    pos = region.end;
                    continue;
                }
                MaskKind::Identifier => return Some(delimited_identifier(batch, region.start)),
                MaskKind::Literal => return None,
            }
        }

        let c = batch[pos..].chars().next()?;
        if c.is_whitespace() {
            pos += c.len_utf8();
            continue;
        }

        let len: usize = batch[pos..]
            .chars()
            .take_while(|&c| is_name_char(c))
            .map(char::len_utf8)
            .sum();
        return (len > 0).then(|| (batch[pos..pos + len].to_string(), pos + len));
    }
}

/// Every `USE` statement in `batch`, in order.
///
/// Keywords are matched on the sanitized text so comments, literals and
/// quoted identifiers never count. Names are read from the original text at
/// the same offsets.
fn use_statements(batch: &str) -> Vec<UseStatement> {
    let clean = sanitize(batch);
    let regions = masked_regions(batch);

    BatchPatterns::instance()
        .use_keyword
        .find_iter(&clean)
        .filter_map(|m| {
            let before = clean[..m.start()].trim_end();
            // `@use`, `#use` and `OPTION (USE HINT ...)` are not statements.
            if clean[..m.start()].ends_with(['@', '#', '$', '.']) || before.ends_with(['(', ',']) {
                return None;
            }

            let (target, name_end) = use_target(batch, &regions, m.end())?;
            let rest = clean[name_end..].trim_start();
            let end = if rest.starts_with(';') {
                clean.len() - rest.len() + 1
            } else {
                name_end
            };

            Some(UseStatement {
                target,
                leading: before.is_empty(),
                end,
            })
        })
        .collect()
}

/// Resolves the catalog `USE` statements are compared against.
///
/// Priority: the database the connection reports, then the options, then
/// the catalog the connection was opened with.
fn current_catalog(conn: &dyn SqlSession, options: Option<&HardenerOptions>) -> (String, CatalogSource) {
    if let Some(db) = conn.database().filter(|d| !d.trim().is_empty()) {
        return (db.to_string(), CatalogSource::ConnectionDatabase);
    }
    if let Some(db) = options.map(|o| o.database.as_str()).filter(|d| !d.trim().is_empty()) {
        return (db.to_string(), CatalogSource::OptionsDatabase);
    }
    (
        conn.connection_catalog().unwrap_or_default().to_string(),
        CatalogSource::ConnectionString,
    )
}

/// What to send for one batch after the `USE` check.
enum Plan<'a> {
    Skip,
    Run(&'a str),
}

fn plan_batch<'a>(
    conn: &dyn SqlSession,
    batch: &'a str,
    options: Option<&HardenerOptions>,
) -> Result<Plan<'a>> {
    let statements = use_statements(batch);
    let Some(first) = statements.first() else {
        return Ok(Plan::Run(batch));
    };

    let (current, source) = current_catalog(conn, options);
    let Some(foreign) = statements.iter().find(|s| !s.target.eq_ignore_ascii_case(&current)) else {
        debug!(database = %current, "USE of the current database treated as no-op");
        if !first.leading {
            return Ok(Plan::Run(batch));
        }
        let rest = batch[first.end..].trim();
        return Ok(if rest.is_empty() { Plan::Skip } else { Plan::Run(rest) });
    };

    let disallow_use = options.is_none_or(|o| o.disallow_use);
    if disallow_use {
        return Err(ContainError::CrossDatabaseUse(Box::new(CrossDatabaseUse {
            offending_sql: batch.to_string(),
            target_database: foreign.target.clone(),
            original_initial_catalog: current,
            original_initial_catalog_source: source,
        })));
    }

    warn!(
        target_database = %foreign.target,
        current_database = %current,
        "Executing USE of a different database on the current connection"
    );
    Ok(Plan::Run(batch))
}

/// Executes every batch of `script` on `conn`.
///
/// # Arguments
/// * `conn` - Live session; never replaced or duplicated
/// * `script` - One or more batches separated by `GO` lines
/// * `options` - Supplies `disallow_use` (default true) and the fallback catalog
/// * `params` - Positional parameters bound to every batch
///
/// # Errors
/// - [`ContainError::CrossDatabaseUse`] before executing the offending batch
/// - [`ContainError::Execution`] carrying the failing batch text
pub async fn execute_batches(
    conn: &mut dyn SqlSession,
    script: &str,
    options: Option<&HardenerOptions>,
    params: &[SqlValue],
) -> Result<()> {
    execute_batches_cancellable(conn, script, options, params, &CancellationToken::new()).await
}

/// [`execute_batches`] that stops with [`ContainError::Cancelled`] once
/// `cancel` fires.
pub async fn execute_batches_cancellable(
    conn: &mut dyn SqlSession,
    script: &str,
    options: Option<&HardenerOptions>,
    params: &[SqlValue],
    cancel: &CancellationToken,
) -> Result<()> {
    for batch in split_batches(script) {
        ensure_active(cancel)?;

        let sql = match plan_batch(conn, batch, options)? {
            Plan::Skip => continue,
            Plan::Run(sql) => sql,
        };

        debug!(sql, "Executing batch");
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ContainError::Cancelled),
            result = conn.execute(sql, params) => result,
        };

        result.map_err(|e| ContainError::execution("SQL execution failed", sql, e))?;
    }

    Ok(())
}

/// Fails with [`ContainError::Cancelled`] once `cancel` has fired.
pub fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(ContainError::Cancelled)
    } else {
        Ok(())
    }
}

/// Runs a single statement and converts its scalar result.
///
/// NULL and an empty result both yield `T::default()`.
///
/// # Errors
/// [`ContainError::Execution`] on server failure, [`ContainError::Conversion`]
/// when the value cannot be converted.
pub async fn exec_scalar<T: FromSqlValue>(conn: &mut dyn SqlSession, sql: &str, params: &[SqlValue]) -> Result<T> {
    let value = conn
        .query_scalar(sql, params)
        .await
        .map_err(|e| ContainError::execution("Scalar query failed", sql, e))?;
    T::from_sql_value(value)
}
