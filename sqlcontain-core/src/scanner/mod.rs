//! Static mutation scanner.
//!
//! An advisory, pre-execution check over candidate SQL text. The scanner
//! never touches a server; it sanitizes the text, normalizes it and runs the
//! fixed rule table from [`rules`] over the result.
//!
//! # Example
//! ```rust
//! use sqlcontain_core::scanner::{contains_mutations, scan, Category};
//!
//! assert!(!contains_mutations("SELECT 1"));
//! assert!(contains_mutations("DROP TABLE t"));
//!
//! let findings = scan("SELECT * FROM t -- delete everything");
//! assert!(findings.is_empty());
//!
//! let findings = scan("UPDATE t SET a = 1");
//! assert_eq!(findings[0].category, Category::Dml);
//! ```

pub mod rules;
mod sanitize;

use serde::Serialize;

pub use rules::{Category, Rule};
pub use sanitize::sanitize;
pub(crate) use sanitize::{MaskKind, Masked, masked_regions};

/// Characters of context kept on each side of a match in [`Finding::excerpt`].
pub const EXCERPT_RADIUS: usize = 40;

/// A single rule match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// Rule category
    pub category: Category,
    /// Identifier of the rule that matched
    pub pattern: &'static str,
    /// Byte offset of the match in the normalized text
    pub offset: usize,
    /// Byte offset of the same character in the caller's input
    pub source_offset: usize,
    /// Normalized text around the match
    pub excerpt: String,
}

/// Sanitized, lowercased, whitespace-collapsed text plus a map back to the
/// input. `origin[i]` is the input byte offset of normalized byte `i`.
struct Normalized {
    text: String,
    origin: Vec<usize>,
}

fn normalize(sanitized: &str) -> Normalized {
    let mut text = String::with_capacity(sanitized.len());
    let mut origin = Vec::with_capacity(sanitized.len());
    let mut in_whitespace = false;

    for (pos, c) in sanitized.char_indices() {
        if c.is_whitespace() {
            if !in_whitespace {
                text.push(' ');
                origin.push(pos);
                in_whitespace = true;
            }
            continue;
        }
        in_whitespace = false;

        for lower in c.to_lowercase() {
            text.push(lower);
            origin.extend(std::iter::repeat_n(pos, lower.len_utf8()));
        }
    }

    Normalized { text, origin }
}

fn floor_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

fn excerpt(text: &str, start: usize, end: usize) -> String {
    let from = floor_boundary(text, start.saturating_sub(EXCERPT_RADIUS));
    let to = ceil_boundary(text, (end + EXCERPT_RADIUS).min(text.len()));
    text[from..to].trim().to_string()
}

/// Scans SQL text for statements likely to mutate state.
///
/// Findings are de-duplicated on (offset, pattern, excerpt) and ordered by
/// offset, then category.
pub fn scan(sql: &str) -> Vec<Finding> {
    let sanitized = sanitize(sql);
    let normalized = normalize(&sanitized);
    let text = normalized.text.as_str();

    let mut findings: Vec<Finding> = rules::rules()
        .iter()
        .flat_map(|rule| {
            rule.regex.find_iter(text).map(|m| Finding {
                category: rule.category,
                pattern: rule.id,
                offset: m.start(),
                source_offset: normalized.origin.get(m.start()).copied().unwrap_or(sql.len()),
                excerpt: excerpt(text, m.start(), m.end()),
            })
        })
        .collect();

    findings.sort_by(|a, b| {
        (a.offset, a.category, a.pattern, &a.excerpt).cmp(&(b.offset, b.category, b.pattern, &b.excerpt))
    });
    findings.dedup_by(|a, b| a.offset == b.offset && a.pattern == b.pattern && a.excerpt == b.excerpt);

    tracing::trace!(count = findings.len(), "Scanned SQL text");
    findings
}

/// Returns true when [`scan`] reports at least one finding.
pub fn contains_mutations(sql: &str) -> bool {
    !scan(sql).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories(sql: &str) -> Vec<Category> {
        scan(sql).into_iter().map(|f| f.category).collect()
    }

    fn patterns(sql: &str) -> Vec<&'static str> {
        scan(sql).into_iter().map(|f| f.pattern).collect()
    }

    #[test]
    fn test_select_is_clean() {
        assert!(!contains_mutations("SELECT 1"));
        assert!(!contains_mutations("select name, object_id from sys.tables where type = 'U'"));
    }

    #[test]
    fn test_drop_table_is_flagged() {
        assert!(contains_mutations("DROP TABLE t"));
        assert_eq!(categories("DROP TABLE t"), vec![Category::Ddl]);
    }

    #[test]
    fn test_dml_verbs() {
        for sql in [
            "INSERT INTO t VALUES (1)",
            "update t set a = 1",
            "DELETE FROM t",
            "MERGE INTO t USING s ON 1=1 WHEN MATCHED THEN UPDATE SET a=1;",
        ] {
            assert!(categories(sql).contains(&Category::Dml), "sql: {}", sql);
        }
    }

    #[test]
    fn test_keywords_in_literals_and_comments_are_ignored() {
        let sql = "SELECT 'insert into x' AS a, [delete] /* drop table t */ FROM t -- update t";
        assert!(scan(sql).is_empty());
    }

    #[test]
    fn test_whitespace_is_collapsed_before_matching() {
        assert!(patterns("TRUNCATE\n\t  TABLE t").contains(&"ddl-truncate"));
        assert!(patterns("BULK\r\nINSERT t FROM 'f'").contains(&"dml-bulk-insert"));
    }

    #[test]
    fn test_select_into_and_temp_tables() {
        let found = patterns("SELECT * INTO #tmp FROM t");
        assert!(found.contains(&"ddl-select-into"));
        assert!(found.contains(&"ddl-into-temp"));

        assert!(patterns("CREATE TABLE #t (a int)").contains(&"ddl-create-temp-table"));
        assert!(patterns("DECLARE @rows TABLE (a int)").contains(&"ddl-table-variable"));
    }

    #[test]
    fn test_exec_family() {
        assert!(patterns("EXEC xp_cmdshell 'dir'").contains(&"exec-xp"));
        assert!(patterns("EXECUTE sp_executesql @s").contains(&"exec-sp-executesql"));
        assert!(patterns("EXEC sp_OACreate 'x', @o OUT").contains(&"exec-sp-oa"));
        assert!(patterns("exec sp_rename 'a', 'b'").contains(&"exec-sp-rename"));
    }

    #[test]
    fn test_security_txn_and_set() {
        assert!(categories("GRANT SELECT ON t TO u").contains(&Category::Security));
        assert!(categories("DENY CREATE ASSEMBLY TO public").contains(&Category::Security));
        assert!(patterns("BEGIN TRANSACTION").contains(&"txn-begin"));
        assert!(patterns("BEGIN TRAN; COMMIT").contains(&"txn-commit"));
        assert!(patterns("SET IDENTITY_INSERT t ON").contains(&"set-identity-insert"));
    }

    #[test]
    fn test_server_and_index_rules() {
        assert!(patterns("USE master").contains(&"server-use"));
        assert!(patterns("DBCC CHECKDB").contains(&"server-dbcc"));
        assert!(patterns("EXEC sp_addlinkedserver 'x'").contains(&"server-linked-server"));
        assert!(patterns("ALTER INDEX ix ON t REBUILD").contains(&"index-alter"));
        assert!(patterns("ALTER INDEX ix ON t REBUILD").contains(&"index-rebuild"));
    }

    #[test]
    fn test_external_objects() {
        let found = patterns("CREATE EXTERNAL DATA SOURCE src WITH (LOCATION = 'x')");
        assert!(found.contains(&"ext-create-external"));
        assert!(found.contains(&"ddl-create"));
    }

    #[test]
    fn test_findings_ordered_by_offset_then_category() {
        let findings = scan("DELETE FROM t; DROP TABLE t");
        let offsets: Vec<_> = findings.iter().map(|f| f.offset).collect();
        let mut sorted = offsets.clone();
        sorted.sort();
        assert_eq!(offsets, sorted);
        assert_eq!(findings.first().map(|f| f.category), Some(Category::Dml));
    }

    #[test]
    fn test_findings_are_deduplicated() {
        let findings = scan("DELETE FROM t");
        let dml: Vec<_> = findings.iter().filter(|f| f.pattern == "dml-verb").collect();
        assert_eq!(dml.len(), 1);
    }

    #[test]
    fn test_source_offset_points_into_input() {
        let sql = "SELECT 1;\n\n    /* note */   DELETE FROM t";
        let finding = scan(sql)
            .into_iter()
            .find(|f| f.pattern == "dml-verb")
            .expect("delete should be found");
        assert_eq!(&sql[finding.source_offset..finding.source_offset + 6], "DELETE");
        assert!(finding.offset < finding.source_offset);
    }

    #[test]
    fn test_excerpt_is_bounded_and_multibyte_safe() {
        let prefix = "é".repeat(60);
        let sql = format!("SELECT {} ; DELETE FROM t", prefix);
        let finding = scan(&sql)
            .into_iter()
            .find(|f| f.pattern == "dml-verb")
            .expect("delete should be found");
        assert!(finding.excerpt.contains("delete"));
        assert!(finding.excerpt.chars().count() <= 2 * EXCERPT_RADIUS + 6);
    }

    #[test]
    fn test_finding_serializes() {
        let finding = scan("DROP TABLE t").remove(0);
        let json = serde_json::to_value(&finding).unwrap();
        assert_eq!(json["category"], "DDL");
        assert_eq!(json["pattern"], "ddl-drop");
        assert_eq!(json["offset"], 0);
    }
}
