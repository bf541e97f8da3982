//! Parser for tagger output in the ctags extended format:
//!
//! ```text
//! name<TAB>file<TAB>excmd;"<TAB>field<TAB>field...
//! ```
//!
//! Fields are `key:value` pairs (`line`, `language`, `kind`, ...) or a bare kind name. The
//! ex command is either a search pattern (`/^...$/`), which becomes the tag's context, or a
//! line number.

use std::fmt;
use std::path::PathBuf;
use tagdex_store::Tag;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedTagLine {
    pub line: String,
    pub reason: &'static str,
}

impl fmt::Display for MalformedTagLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}", self.reason, self.line)
    }
}

impl std::error::Error for MalformedTagLine {}

/// Parse one output line. Blank lines and `!_` pseudo-tags yield `Ok(None)`.
pub fn parse_tag_line(line: &str) -> Result<Option<Tag>, MalformedTagLine> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || line.starts_with("!_") {
        return Ok(None);
    }
    let malformed = |reason| MalformedTagLine {
        line: line.to_string(),
        reason,
    };

    let mut parts = line.splitn(3, '\t');
    let name = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| malformed("missing name"))?;
    let file = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| malformed("missing file"))?;
    let rest = parts.next().ok_or_else(|| malformed("missing address"))?;

    let (excmd, fields) = split_address(rest);

    let mut line_number = None;
    let mut kind = None;
    let mut language = None;
    for field in fields.split('\t').filter(|field| !field.is_empty()) {
        match field.split_once(':') {
            Some(("line", value)) => {
                line_number = Some(value.parse::<i64>().map_err(|_| malformed("bad line field"))?)
            }
            Some(("kind", value)) => kind = Some(value.to_string()),
            Some(("language", value)) => language = Some(value.to_string()),
            Some(_) => {}
            None => kind = Some(field.to_string()),
        }
    }

    let context = match excmd.trim().parse::<i64>() {
        Ok(number) => {
            line_number.get_or_insert(number);
            None
        }
        Err(_) => pattern_text(excmd),
    };

    let line_number = line_number.ok_or_else(|| malformed("no line number"))?;

    Ok(Some(Tag {
        name: name.to_string(),
        path: PathBuf::from(file),
        line: line_number,
        kind: kind.filter(|k| !k.is_empty()),
        context,
        language: language.filter(|l| !l.is_empty()),
    }))
}

/// Split `excmd;"<TAB>fields` into its two halves. Without the `;"` marker the whole
/// remainder is the ex command.
fn split_address(rest: &str) -> (&str, &str) {
    if let Some(at) = rest.rfind(";\"\t") {
        return (&rest[..at], &rest[at + 3..]);
    }
    if let Some(excmd) = rest.strip_suffix(";\"") {
        return (excmd, "");
    }
    (rest, "")
}

/// `/^int main(void)$/` -> `int main(void)`.
fn pattern_text(excmd: &str) -> Option<String> {
    let excmd = excmd.trim();
    let delimiter = excmd.chars().next().filter(|c| *c == '/' || *c == '?')?;
    let inner = excmd.strip_prefix(delimiter)?;
    let inner = inner.strip_suffix(delimiter).unwrap_or(inner);
    let inner = inner.strip_prefix('^').unwrap_or(inner);
    let inner = inner.strip_suffix('$').unwrap_or(inner);

    let mut text = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) if next == delimiter || next == '\\' => text.push(next),
                Some(next) => {
                    text.push('\\');
                    text.push(next);
                }
                None => text.push('\\'),
            }
        } else {
            text.push(c);
        }
    }
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_extended_line_with_pattern() {
        let tag = parse_tag_line(
            "main\t/src/main.c\t/^int main(int argc, char **argv)$/;\"\tfunction\tline:12\tlanguage:C",
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            tag,
            Tag {
                name: "main".into(),
                path: PathBuf::from("/src/main.c"),
                line: 12,
                kind: Some("function".into()),
                context: Some("int main(int argc, char **argv)".into()),
                language: Some("C".into()),
            }
        );
    }

    #[test]
    fn explicit_kind_field_and_number_address() {
        let tag = parse_tag_line("Point\t/src/geo.rs\t40;\"\tkind:struct")
            .unwrap()
            .unwrap();
        assert_eq!(tag.line, 40);
        assert_eq!(tag.kind.as_deref(), Some("struct"));
        assert_eq!(tag.context, None);
        assert_eq!(tag.language, None);
    }

    #[test]
    fn unescapes_pattern_delimiters() {
        let tag = parse_tag_line("url\t/a.js\t/^var url = \"a\\/b\";$/;\"\tvariable\tline:1")
            .unwrap()
            .unwrap();
        assert_eq!(tag.context.as_deref(), Some("var url = \"a/b\";"));
    }

    #[test]
    fn pseudo_tags_and_blank_lines_are_ignored() {
        assert_eq!(parse_tag_line("!_TAG_FILE_FORMAT\t2\t/extended format/"), Ok(None));
        assert_eq!(parse_tag_line("   "), Ok(None));
    }

    #[test]
    fn malformed_lines_are_reported() {
        assert!(parse_tag_line("lonely").is_err());
        assert!(parse_tag_line("name\t/file.c\t/^pattern$/;\"\tfunction").is_err());
        assert!(parse_tag_line("name\t/file.c\t1;\"\tline:abc").is_err());
    }
}
