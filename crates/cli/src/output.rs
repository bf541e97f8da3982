use anyhow::Result;
use serde::Serialize;
use tagdex_search::{SearchHit, SearchMode};

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// One line per hit: `path:line: name` for tags, `path:line: text` for content.
pub(crate) fn format_hit(mode: SearchMode, hit: &SearchHit) -> String {
    let path = hit.path.display();
    match (mode, hit.line) {
        (SearchMode::Files, _) | (_, None) => path.to_string(),
        (SearchMode::Tags, Some(line)) => {
            format!("{path}:{line}: {}", hit.name.as_deref().unwrap_or_default())
        }
        (SearchMode::Content, Some(line)) => {
            let text = hit
                .context
                .as_deref()
                .and_then(|context| context.split('\n').nth(1))
                .unwrap_or_default();
            format!("{path}:{line}: {}", text.trim_end())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn content_hits_show_the_matching_line() {
        let hit = SearchHit {
            path: PathBuf::from("/src/main.c"),
            line: Some(4),
            name: None,
            context: Some("{\n    return parse();\n}".to_string()),
        };
        assert_eq!(
            format_hit(SearchMode::Content, &hit),
            "/src/main.c:4:     return parse();"
        );
    }

    #[test]
    fn tag_hits_show_the_name() {
        let hit = SearchHit {
            path: PathBuf::from("/src/main.c"),
            line: Some(12),
            name: Some("main".to_string()),
            context: None,
        };
        assert_eq!(format_hit(SearchMode::Tags, &hit), "/src/main.c:12: main");
        assert_eq!(format_hit(SearchMode::Files, &hit), "/src/main.c");
    }
}
