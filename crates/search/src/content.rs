use regex::Regex;

/// Lines longer than this are cut down in hit contexts.
pub const MAX_CONTEXT_LINE_CHARS: usize = 1024;

/// A matching line: its 1-based number and the previous/current/next window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMatch {
    pub line: i64,
    pub context: String,
}

fn truncate_line(line: &str) -> &str {
    match line.char_indices().nth(MAX_CONTEXT_LINE_CHARS) {
        Some((at, _)) => &line[..at],
        None => line,
    }
}

/// Resumable line-by-line scan of one file's text.
///
/// Lines are split on `\n` with a trailing `\r` dropped. The context window always has three
/// slots; a missing neighbour (first or last line) is an empty slot.
pub struct LineScanner<'a> {
    lines: Vec<&'a str>,
    position: usize,
}

impl<'a> LineScanner<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().collect(),
            position: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.position >= self.lines.len()
    }

    /// Scan up to `budget` more lines, appending matches to `out`.
    pub fn scan(&mut self, regex: &Regex, budget: usize, out: &mut Vec<LineMatch>) {
        let end = (self.position + budget).min(self.lines.len());
        while self.position < end {
            let index = self.position;
            self.position += 1;
            if regex.is_match(self.lines[index]) {
                out.push(LineMatch {
                    line: index as i64 + 1,
                    context: self.window(index),
                });
            }
        }
    }

    fn window(&self, index: usize) -> String {
        let previous = index.checked_sub(1).and_then(|i| self.lines.get(i)).copied();
        let next = self.lines.get(index + 1).copied();
        [previous, Some(self.lines[index]), next]
            .into_iter()
            .map(|line| truncate_line(line.unwrap_or("")))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scan_all(text: &str, pattern: &str) -> Vec<LineMatch> {
        let regex = Regex::new(pattern).unwrap();
        let mut scanner = LineScanner::new(text);
        let mut out = Vec::new();
        while !scanner.is_done() {
            scanner.scan(&regex, 2, &mut out);
        }
        out
    }

    #[test]
    fn window_covers_neighbouring_lines() {
        let hits = scan_all("one\r\ntwo needle\r\nthree\r\n", "needle");
        assert_eq!(
            hits,
            vec![LineMatch {
                line: 2,
                context: "one\ntwo needle\nthree".to_string(),
            }]
        );
    }

    #[test]
    fn edges_leave_empty_slots() {
        let hits = scan_all("needle a\nmiddle\nneedle b", "needle");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].context, "\nneedle a\nmiddle");
        assert_eq!(hits[1].line, 3);
        assert_eq!(hits[1].context, "middle\nneedle b\n");
    }

    #[test]
    fn long_lines_are_truncated_by_characters() {
        let long = "é".repeat(MAX_CONTEXT_LINE_CHARS + 10);
        let text = format!("{long}\nneedle");
        let hits = scan_all(&text, "needle");
        let previous = hits[0].context.split('\n').next().unwrap();
        assert_eq!(previous.chars().count(), MAX_CONTEXT_LINE_CHARS);
    }
}
