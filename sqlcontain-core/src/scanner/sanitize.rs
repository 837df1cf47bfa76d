//! Offset-preserving T-SQL sanitizer.
//!
//! Comments, string and binary literals, and quoted or bracketed identifiers
//! are blanked out with spaces so that keywords hidden inside them cannot
//! trigger a rule. Every masked character is replaced by as many spaces as it
//! occupies in UTF-8, so byte offsets into the output are valid offsets into
//! the input.

/// Blanks out literals, comments and quoted identifiers.
///
/// Handles `-- line` and `/* block */` comments, `'...'` and `N'...'`
/// strings (with doubled-quote escapes), `0x...` binary literals,
/// `[bracketed]` and `"double quoted"` identifiers. Identifiers end at the
/// first closing character and comments do not nest. Tabs outside those
/// regions become spaces; everything else is copied verbatim.
///
/// Unterminated regions run to the end of the input.
///
/// # Example
/// ```rust
/// use sqlcontain_core::scanner::sanitize;
///
/// let sql = "SELECT 'drop table t' -- delete\nFROM [insert]";
/// let clean = sanitize(sql);
/// assert_eq!(clean.len(), sql.len());
/// assert!(!clean.contains("drop"));
/// assert!(!clean.contains("delete"));
/// assert!(!clean.contains("insert"));
/// assert!(clean.contains("SELECT"));
/// ```
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut copied = 0;

    for region in masked_regions(input) {
        push_plain(&mut out, &input[copied..region.start]);
        out.extend(std::iter::repeat_n(' ', region.end - region.start));
        copied = region.end;
    }
    push_plain(&mut out, &input[copied..]);

    out
}

/// What a masked region of the input holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MaskKind {
    Comment,
    Literal,
    Identifier,
}

/// Byte range of the input that [`sanitize`] blanks out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Masked {
    pub start: usize,
    pub end: usize,
    pub kind: MaskKind,
}

/// Masked regions of `input`, in order and non-overlapping.
pub(crate) fn masked_regions(input: &str) -> Vec<Masked> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let offset = |i: usize| chars.get(i).map_or(input.len(), |&(o, _)| o);
    let mut regions = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i].1;
        let next = chars.get(i + 1).map(|&(_, n)| n);

        let (end, kind) = match (c, next) {
            ('-', Some('-')) => (line_comment_end(&chars, i + 2), MaskKind::Comment),
            ('/', Some('*')) => (block_comment_end(&chars, i + 2), MaskKind::Comment),
            ('N' | 'n', Some('\'')) => (string_end(&chars, i + 2), MaskKind::Literal),
            ('\'', _) => (string_end(&chars, i + 1), MaskKind::Literal),
            ('0', Some('x' | 'X')) => (hex_end(&chars, i + 2), MaskKind::Literal),
            ('[', _) => (closing_end(&chars, i + 1, ']'), MaskKind::Identifier),
            ('"', _) => (closing_end(&chars, i + 1, '"'), MaskKind::Identifier),
            _ => {
                i += 1;
                continue;
            }
        };

        regions.push(Masked {
            start: offset(i),
            end: offset(end),
            kind,
        });
        i = end;
    }

    regions
}

fn push_plain(out: &mut String, text: &str) {
    out.extend(text.chars().map(|c| if c == '\t' { ' ' } else { c }));
}

fn line_comment_end(chars: &[(usize, char)], mut i: usize) -> usize {
    while i < chars.len() && chars[i].1 != '\n' && chars[i].1 != '\r' {
        i += 1;
    }
    i
}

fn block_comment_end(chars: &[(usize, char)], mut i: usize) -> usize {
    while i + 1 < chars.len() {
        if chars[i].1 == '*' && chars[i + 1].1 == '/' {
            return i + 2;
        }
        i += 1;
    }
    chars.len()
}

fn string_end(chars: &[(usize, char)], mut i: usize) -> usize {
    while i < chars.len() {
        if chars[i].1 == '\'' {
            if chars.get(i + 1).is_some_and(|&(_, n)| n == '\'') {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn hex_end(chars: &[(usize, char)], mut i: usize) -> usize {
    while i < chars.len() && chars[i].1.is_ascii_hexdigit() {
        i += 1;
    }
    i
}

fn closing_end(chars: &[(usize, char)], mut i: usize, close: char) -> usize {
    while i < chars.len() {
        if chars[i].1 == close {
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_is_preserved() {
        let inputs = [
            "SELECT 1",
            "SELECT N'naïve ünïcode' FROM t",
            "/* unterminated",
            "'unterminated",
            "[unterminated",
            "select 0xDEADbeef, \"quoted id\"",
        ];
        for input in inputs {
            assert_eq!(sanitize(input).len(), input.len(), "input: {}", input);
        }
    }

    #[test]
    fn test_line_comment_stops_at_newline() {
        let clean = sanitize("SELECT 1 -- drop table x\nDELETE FROM t");
        assert!(!clean.contains("drop"));
        assert!(clean.contains("\nDELETE FROM t"));
    }

    #[test]
    fn test_block_comment() {
        let clean = sanitize("SELECT /* update t set a=1 */ 1");
        assert_eq!(clean, format!("SELECT {} 1", " ".repeat(22)));
    }

    #[test]
    fn test_doubled_quotes_stay_inside_string() {
        let clean = sanitize("SELECT 'it''s; drop table t' AS x");
        assert!(!clean.contains("drop"));
        assert!(clean.ends_with(" AS x"));
    }

    #[test]
    fn test_unicode_string_prefix() {
        let clean = sanitize("SELECT N'insert' , n'merge'");
        assert!(!clean.contains("insert"));
        assert!(!clean.contains("merge"));
    }

    #[test]
    fn test_plain_text_is_copied() {
        let clean = sanitize("SELECT column1 FROM t WHERE x = 'a'");
        assert!(clean.starts_with("SELECT column1 FROM t WHERE x = "));
    }

    #[test]
    fn test_binary_literal() {
        let clean = sanitize("SELECT 0x1F2e FROM t");
        assert_eq!(clean, format!("SELECT {} FROM t", " ".repeat(6)));
    }

    #[test]
    fn test_bracketed_and_quoted_identifiers() {
        let clean = sanitize("SELECT [delete], \"update\" FROM [drop table]");
        assert!(!clean.contains("delete"));
        assert!(!clean.contains("update"));
        assert!(!clean.contains("drop"));
    }

    #[test]
    fn test_block_comment_ends_at_first_terminator() {
        let clean = sanitize("SELECT /* a /* b */ 1");
        assert_eq!(clean, format!("SELECT {} 1", " ".repeat(12)));
    }

    #[test]
    fn test_masked_regions_are_classified() {
        let sql = "USE [Other Db] -- go\nSELECT 'x'";
        let regions = masked_regions(sql);
        let kinds: Vec<MaskKind> = regions.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![MaskKind::Identifier, MaskKind::Comment, MaskKind::Literal]);
        assert_eq!(&sql[regions[0].start..regions[0].end], "[Other Db]");
        assert_eq!(&sql[regions[1].start..regions[1].end], "-- go");
    }

    #[test]
    fn test_tabs_become_spaces() {
        assert_eq!(sanitize("SELECT\t1"), "SELECT 1");
    }

    #[test]
    fn test_multibyte_offsets_line_up() {
        let input = "SELECT 'ö' , x";
        let clean = sanitize(input);
        assert_eq!(clean.find('x'), input.find('x'));
    }
}
