//! Read-only gate for agent-proposed SQL.
//!
//! Candidate statements arrive as free text that should contain one
//! `<SqlXmlRequest>` element. The gate pulls that element out of any
//! surrounding prose, deserializes it and, in read-only mode, refuses
//! anything other than a plain text command with no scanner findings.
//!
//! Malformed input is reported as [`GateError::InvalidInput`], which is a
//! different failure from [`GateError::MutationDetected`].

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scanner::{self, Finding};

/// Root element name of a request envelope.
pub const REQUEST_ELEMENT: &str = "SqlXmlRequest";

/// The only command type accepted in read-only mode.
pub const TEXT_COMMAND: &str = "Text";

/// A deserialized request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlRequest {
    /// Statement text
    #[serde(rename = "Sql", default)]
    pub sql: String,
    /// `Text`, `StoredProcedure` or `TableDirect`
    #[serde(rename = "CommandType", default = "default_command_type")]
    pub command_type: String,
    /// Optional per-command timeout
    #[serde(rename = "CommandTimeoutSeconds", default)]
    pub command_timeout_seconds: Option<u32>,
    /// Whether the request only reads schema metadata
    #[serde(rename = "IsSchemaRequest", default)]
    pub is_schema_request: bool,
}

fn default_command_type() -> String {
    TEXT_COMMAND.to_string()
}

/// Why the gate refused a request.
#[derive(Debug, Error)]
pub enum GateError {
    /// No well-formed request envelope could be read
    #[error("Invalid request input: {0}")]
    InvalidInput(String),

    /// Only plain text commands pass in read-only mode
    #[error("Command type '{0}' is not allowed in read-only mode")]
    CommandTypeNotAllowed(String),

    /// The statement text matched one or more mutation rules
    #[error("Mutation detected in read-only mode ({} finding(s))", .0.len())]
    MutationDetected(Vec<Finding>),
}

/// Pre-compiled envelope patterns.
struct GatePatterns {
    /// `<Tag ...>` or `<Tag .../>`; group 1 is the name, group 2 the rest
    open_tag: Regex,
}

impl GatePatterns {
    fn instance() -> &'static Self {
        static PATTERNS: OnceLock<GatePatterns> = OnceLock::new();
        PATTERNS.get_or_init(|| Self {
            open_tag: Regex::new(r"<([A-Za-z_][\w:.\-]*)(\s[^<>]*|/)?>").expect("Invalid XML tag pattern"),
        })
    }
}

/// Returns the first complete XML element embedded in `text`.
///
/// The element is either self-closing (`<Tag ... />`) or runs to the first
/// matching `</Tag>`. Opening tags without a closing tag are passed over.
/// Returns `None` when no complete element is present.
pub fn extract_xml(text: &str) -> Option<&str> {
    GatePatterns::instance().open_tag.captures_iter(text).find_map(|caps| {
        let open = caps.get(0)?;
        if caps.get(2).is_some_and(|rest| rest.as_str().ends_with('/')) {
            return Some(open.as_str());
        }

        let closing = format!("</{}>", caps.get(1)?.as_str());
        let close = text[open.end()..].find(&closing)?;
        Some(&text[open.start()..open.end() + close + closing.len()])
    })
}

fn root_name(xml: &str) -> &str {
    let inner = &xml[1..];
    let end = inner
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(inner.len());
    &inner[..end]
}

/// Extracts and deserializes a request envelope from free text.
///
/// # Errors
/// [`GateError::InvalidInput`] when no element is found, the root element is
/// not `SqlXmlRequest`, or the element does not deserialize.
pub fn parse_request(text: &str) -> Result<SqlRequest, GateError> {
    let xml = extract_xml(text)
        .ok_or_else(|| GateError::InvalidInput("no complete XML element found".to_string()))?;

    let root = root_name(xml);
    if root != REQUEST_ELEMENT {
        return Err(GateError::InvalidInput(format!(
            "expected <{}> element, found <{}>",
            REQUEST_ELEMENT, root
        )));
    }

    quick_xml::de::from_str(xml).map_err(|e| GateError::InvalidInput(e.to_string()))
}

/// Parses a request and enforces read-only mode on it.
///
/// # Errors
/// - [`GateError::InvalidInput`] for malformed or empty requests
/// - [`GateError::CommandTypeNotAllowed`] for anything but `Text`
/// - [`GateError::MutationDetected`] when the scanner reports findings
///
/// # Example
/// ```rust
/// use sqlcontain_core::gate::{check_read_only, GateError};
///
/// let ok = check_read_only(
///     "Here you go: <SqlXmlRequest><Sql>SELECT 1</Sql></SqlXmlRequest>",
/// );
/// assert!(ok.is_ok());
///
/// assert!(matches!(check_read_only("<notvalid"), Err(GateError::InvalidInput(_))));
/// ```
pub fn check_read_only(text: &str) -> Result<SqlRequest, GateError> {
    let request = parse_request(text)?;

    if request.sql.trim().is_empty() {
        return Err(GateError::InvalidInput("request has no SQL text".to_string()));
    }

    if !request.command_type.trim().eq_ignore_ascii_case(TEXT_COMMAND) {
        return Err(GateError::CommandTypeNotAllowed(request.command_type));
    }

    let findings = scanner::scan(&request.sql);
    if !findings.is_empty() {
        tracing::warn!(count = findings.len(), "Read-only gate rejected mutating SQL");
        return Err(GateError::MutationDetected(findings));
    }

    Ok(request)
}
