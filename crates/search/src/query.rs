//! SQL text and parameters for the three search modes.

use regex_syntax::hir::{Hir, HirKind};
use rusqlite::types::Value;
use std::path::MAIN_SEPARATOR;

/// Prefix matches beyond the exact ones are capped at this many rows.
pub const PREFIX_MATCH_LIMIT: usize = 1000;

/// Shortest literal worth a trigram lookup.
pub const MIN_LITERAL_CHARS: usize = 3;

pub(crate) const TAGS_SQL: &str = "
    SELECT * FROM (
        SELECT tag_name, path, line_number FROM tags_and_source_files
        WHERE tag_name = ?1
        ORDER BY path, line_number
    )
    UNION ALL
    SELECT * FROM (
        SELECT tag_name, path, line_number FROM tags_and_source_files
        WHERE tag_name GLOB ?2
        ORDER BY tag_name, path, line_number
        LIMIT ?3
    )";

pub(crate) const FILES_SQL: &str = "
    SELECT * FROM (SELECT path, 0 FROM source_files WHERE path GLOB ?1 ORDER BY path)
    UNION ALL
    SELECT * FROM (SELECT path, 1 FROM source_files WHERE path GLOB ?2 ORDER BY path)";

pub(crate) const CONTENT_CANDIDATES_SQL: &str = "
    SELECT source_files.path FROM full_text
    JOIN source_files ON source_files.id = full_text.rowid
    WHERE full_text MATCH ?1
    ORDER BY source_files.id";

pub(crate) const ALL_FILES_SQL: &str = "SELECT path FROM source_files ORDER BY id";

/// Escape GLOB metacharacters so `text` only matches itself.
pub fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '*' => escaped.push_str("[*]"),
            '?' => escaped.push_str("[?]"),
            '[' => escaped.push_str("[[]"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub(crate) fn tags_params(text: &str) -> Vec<Value> {
    vec![
        Value::Text(text.to_string()),
        Value::Text(format!("{}?*", escape_glob(text))),
        Value::Integer(PREFIX_MATCH_LIMIT as i64),
    ]
}

pub(crate) fn files_params(text: &str) -> Vec<Value> {
    let escaped = escape_glob(text);
    vec![
        Value::Text(format!("*{MAIN_SEPARATOR}{escaped}")),
        Value::Text(format!("*{MAIN_SEPARATOR}{escaped}?*")),
    ]
}

/// Whether the last component of `path` starts with `text` and is longer than it.
///
/// The prefix pass's GLOB may also match inside a directory name.
pub(crate) fn last_component_extends(path: &str, text: &str) -> bool {
    let name = path.rsplit(MAIN_SEPARATOR).next().unwrap_or(path);
    name.len() > text.len() && name.starts_with(text)
}

/// Literal substrings every match of `hir` must contain.
pub fn required_literals(hir: &Hir) -> Vec<String> {
    let mut literals = Vec::new();
    collect_required(hir, &mut literals);
    literals
}

fn collect_required(hir: &Hir, out: &mut Vec<String>) {
    match hir.kind() {
        HirKind::Literal(literal) => push_literal(&literal.0, out),
        HirKind::Capture(capture) => collect_required(&capture.sub, out),
        HirKind::Repetition(repetition) if repetition.min > 0 => {
            collect_required(&repetition.sub, out)
        }
        HirKind::Concat(parts) => {
            let mut run: Vec<u8> = Vec::new();
            for part in parts {
                if let HirKind::Literal(literal) = part.kind() {
                    run.extend_from_slice(&literal.0);
                    continue;
                }
                push_literal(&run, out);
                run.clear();
                collect_required(part, out);
            }
            push_literal(&run, out);
        }
        // Alternations, classes and look-arounds guarantee no particular text.
        _ => {}
    }
}

fn push_literal(bytes: &[u8], out: &mut Vec<String>) {
    if bytes.is_empty() {
        return;
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        if !out.iter().any(|seen| seen == text) {
            out.push(text.to_string());
        }
    }
}

/// Trigram query for the full-text index, `None` when no literal is long enough.
pub fn full_text_query(literals: &[String]) -> Option<String> {
    let terms: Vec<String> = literals
        .iter()
        .filter(|literal| literal.chars().count() >= MIN_LITERAL_CHARS)
        .map(|literal| format!("\"{}\"", literal.replace('"', "\"\"")))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" AND "))
}

/// Parse `pattern` the way `regex` does and derive its full-text query.
pub fn content_query(pattern: &str) -> Option<String> {
    let hir = regex_syntax::Parser::new().parse(pattern).ok()?;
    full_text_query(&required_literals(&hir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn literals(pattern: &str) -> Vec<String> {
        let hir = regex_syntax::Parser::new().parse(pattern).unwrap();
        required_literals(&hir)
    }

    #[test]
    fn glob_metacharacters_are_bracketed() {
        assert_eq!(escape_glob("a*b?c[d]"), "a[*]b[?]c[[]d]");
        assert_eq!(escape_glob("plain_name"), "plain_name");
    }

    #[test]
    fn literals_split_at_non_literal_pieces() {
        assert_eq!(literals(r"foo\d+barbaz"), vec!["foo", "barbaz"]);
        assert_eq!(literals(r"fn\s+(parse_header)"), vec!["fn", "parse_header"]);
    }

    #[test]
    fn optional_and_alternative_parts_are_not_required() {
        assert_eq!(literals(r"main(helper)?"), vec!["main"]);
        assert!(literals(r"alpha|beta").is_empty());
        assert!(literals(r"(?i)case").is_empty());
    }

    #[test]
    fn short_literals_do_not_reach_the_index() {
        let query = full_text_query(&["fn".into(), "parse".into(), "say \"hi\"".into()]);
        assert_eq!(query.as_deref(), Some(r#""parse" AND "say ""hi""""#));
        assert_eq!(full_text_query(&["ab".into()]), None);
        assert_eq!(content_query(r"\w+"), None);
    }

    #[test]
    fn prefix_pass_keeps_only_longer_file_names() {
        let sep = MAIN_SEPARATOR;
        assert!(last_component_extends(&format!("{sep}src{sep}main.c"), "main"));
        assert!(!last_component_extends(&format!("{sep}src{sep}main"), "main"));
        assert!(!last_component_extends(
            &format!("{sep}mainline{sep}util.c"),
            "main"
        ));
    }
}
