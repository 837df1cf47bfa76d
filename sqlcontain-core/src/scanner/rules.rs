//! The fixed mutation rule table.
//!
//! Patterns are matched against sanitized, lowercased, whitespace-collapsed
//! text, so they are written in lowercase and assume single spaces.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Rule category of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    /// Data modification
    Dml,
    /// Schema modification
    Ddl,
    /// Procedure execution and dynamic SQL
    Exec,
    /// Permission changes
    Security,
    /// Transaction control
    Txn,
    /// Session options with lasting effect
    Set,
    /// Server and database level operations
    Server,
    /// Index maintenance
    Index,
    /// External data and libraries
    Ext,
}

impl Category {
    /// Upper-case tag as used in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dml => "DML",
            Self::Ddl => "DDL",
            Self::Exec => "EXEC",
            Self::Security => "SECURITY",
            Self::Txn => "TXN",
            Self::Set => "SET",
            Self::Server => "SERVER",
            Self::Index => "INDEX",
            Self::Ext => "EXT",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One category-tagged pattern.
#[derive(Debug)]
pub struct Rule {
    /// Stable identifier reported in findings
    pub id: &'static str,
    /// Category reported in findings
    pub category: Category,
    /// Compiled pattern
    pub regex: Regex,
}

const OBJECT_KINDS: &str = "table|view|function|procedure|proc|trigger|index|type|schema|database|role|user|assembly|sequence|synonym|external";

/// Rule definitions in evaluation order.
fn definitions() -> Vec<(&'static str, Category, String)> {
    use Category::*;

    let plain = |id, category, pattern: &str| (id, category, pattern.to_string());

    vec![
        plain("dml-verb", Dml, r"\b(insert|update|delete|merge)\b"),
        plain("dml-output-into", Dml, r"\boutput\s+into\b"),
        plain("dml-bulk-insert", Dml, r"\bbulk\s+insert\b"),
        plain("dml-openrowset-bulk", Dml, r"\bopenrowset\s*\(\s*bulk\b"),
        ("ddl-create", Ddl, format!(r"\bcreate\s+({})\b", OBJECT_KINDS)),
        ("ddl-alter", Ddl, format!(r"\balter\s+({})\b", OBJECT_KINDS)),
        ("ddl-drop", Ddl, format!(r"\bdrop\s+({}|login|server)\b", OBJECT_KINDS)),
        plain("ddl-truncate", Ddl, r"\btruncate\s+table\b"),
        plain("ddl-select-into", Ddl, r"\bselect\b[\s\S]*?\binto\b"),
        plain("ddl-create-temp-table", Ddl, r"\bcreate\s+table\s+#"),
        plain("ddl-into-temp", Ddl, r"\binto\s+#"),
        plain("ddl-table-variable", Ddl, r"\bdeclare\s+@[a-z_][a-z0-9_]*\s+table\b"),
        plain("exec", Exec, r"\bexec(?:ute)?\b"),
        plain("exec-sp-executesql", Exec, r"\bsp_executesql\b"),
        plain("exec-xp", Exec, r"\bxp_[a-z0-9_]+\b"),
        plain("exec-sp-oa", Exec, r"\bsp_oa[a-z0-9_]*\b"),
        plain("exec-sp-rename", Exec, r"\bsp_rename\b"),
        plain("security-grant", Security, r"\bgrant\b"),
        plain("security-revoke", Security, r"\brevoke\b"),
        plain("security-deny", Security, r"\bdeny\b"),
        plain("txn-begin", Txn, r"\bbegin\s+tran(?:saction)?\b"),
        plain("txn-commit", Txn, r"\bcommit\b"),
        plain("txn-rollback", Txn, r"\brollback\b"),
        plain("set-identity-insert", Set, r"\bset\s+identity_insert\b"),
        plain("set-quoted-identifier", Set, r"\bset\s+quoted_identifier\b"),
        plain("set-ansi-nulls", Set, r"\bset\s+ansi_nulls\b"),
        plain("server-backup", Server, r"\bbackup\b"),
        plain("server-restore", Server, r"\brestore\b"),
        plain("server-dbcc", Server, r"\bdbcc\b"),
        plain("server-use", Server, r"\buse\s+[a-z_][a-z0-9_]*\b"),
        plain("index-alter", Index, r"\balter\s+index\b"),
        plain("index-rebuild", Index, r"\brebuild\b"),
        plain("index-reorganize", Index, r"\breorganize\b"),
        plain(
            "ext-create-external",
            Ext,
            r"\bcreate\s+external\s+(data\s+source|file\s+format|table|library)\b",
        ),
        plain(
            "server-linked-server",
            Server,
            r"\bsp_addlinkedserver\b|\bsp_dropserver\b|\bsp_serveroption\b",
        ),
    ]
}

/// The process-wide rule table, compiled once on first use.
pub fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        definitions()
            .into_iter()
            .map(|(id, category, pattern)| Rule {
                id,
                category,
                regex: Regex::new(&pattern).expect("Invalid mutation rule pattern"),
            })
            .collect()
    })
}
