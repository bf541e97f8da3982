use crate::content::{LineMatch, LineScanner};
use crate::error::Result;
use crate::query;
use regex::Regex;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;
use tagdex_indexer::read_source_text;
use tagdex_runtime::{yield_now, Promise, Scheduler, TaskError, TaskPolicy};
use tagdex_store::{DbConnection, RowStream, TagStore};

/// Lines scanned between two yields to the scheduler.
const SCAN_SLICE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Tag names: exact matches, then longer names starting with the text.
    Tags,
    /// File names: exact last component, then longer ones starting with the text.
    Files,
    /// File contents, as a regular expression.
    Content,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SearchMode::Tags => "tags",
            SearchMode::Files => "files",
            SearchMode::Content => "content",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    /// Tag name, for tag searches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Previous, matching and next line joined by `\n`, for content searches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Progress delivered to the observer of one search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchEvent {
    /// All hits found so far.
    Partial(Vec<SearchHit>),
    /// The complete result list.
    Finished(Vec<SearchHit>),
    /// The search text is not a valid pattern for the mode.
    InvalidInput(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum SearchStatus {
    Completed,
    InvalidInput(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchReport {
    pub mode: SearchMode,
    pub text: String,
    #[serde(flatten)]
    pub status: SearchStatus,
    pub hits: Vec<SearchHit>,
    /// Stopped at the session's hit limit.
    pub truncated: bool,
    /// Candidate files opened by a content search.
    pub files_scanned: usize,
    pub time_ms: u64,
}

/// Whether the `count`-th hit triggers a partial update: the 1st, 5th, 10th, 15th and 20th,
/// then every 50th.
pub fn is_update_point(count: usize) -> bool {
    count == 1 || (count <= 20 && count % 5 == 0) || count % 50 == 0
}

/// An interactive search context with its own read-only connection.
///
/// At most one query runs per session: starting a search cancels the one in flight, whose
/// promise settles as canceled and whose observer hears nothing more.
pub struct SearchSession {
    scheduler: Scheduler,
    connection: DbConnection,
    generation: Rc<Cell<u64>>,
    active: RefCell<Option<Promise<SearchReport>>>,
    max_hits: Option<usize>,
}

impl SearchSession {
    pub fn new(store: &TagStore) -> Result<Self> {
        Ok(Self {
            scheduler: store.scheduler().clone(),
            connection: store.open_read_connection()?,
            generation: Rc::new(Cell::new(0)),
            active: RefCell::new(None),
            max_hits: None,
        })
    }

    /// Stop every search after `limit` hits.
    pub fn with_max_hits(mut self, limit: usize) -> Self {
        self.max_hits = Some(limit.max(1));
        self
    }

    pub fn is_searching(&self) -> bool {
        self.active
            .borrow()
            .as_ref()
            .is_some_and(|active| active.is_pending())
    }

    /// Cancel the search in flight, if any.
    pub fn cancel(&self) {
        self.generation.set(self.generation.get() + 1);
        let active = self.active.borrow_mut().take();
        if let Some(active) = active {
            active.dispose();
        }
    }

    pub fn search<F>(&self, text: &str, mode: SearchMode, observer: F) -> Promise<SearchReport>
    where
        F: FnMut(SearchEvent) + 'static,
    {
        self.cancel();
        let run = SearchRun {
            scheduler: self.scheduler.clone(),
            connection: self.connection.clone(),
            generation: Rc::clone(&self.generation),
            mine: self.generation.get(),
            text: text.to_string(),
            mode,
            max_hits: self.max_hits,
        };
        log::debug!("Searching {mode} for {text:?}");
        let promise = self
            .scheduler
            .start_with(TaskPolicy::WhileFutureLives, run.execute(observer));
        *self.active.borrow_mut() = Some(promise.clone());
        promise
    }
}

struct SearchRun {
    scheduler: Scheduler,
    connection: DbConnection,
    generation: Rc<Cell<u64>>,
    mine: u64,
    text: String,
    mode: SearchMode,
    max_hits: Option<usize>,
}

/// Collects hits and forwards updates at the reporting cadence.
struct HitSink<F> {
    hits: Vec<SearchHit>,
    observer: F,
    generation: Rc<Cell<u64>>,
    mine: u64,
    max_hits: Option<usize>,
}

impl<F: FnMut(SearchEvent)> HitSink<F> {
    /// Fails with [`TaskError::Canceled`] once a newer search has started.
    fn check_current(&self) -> std::result::Result<(), TaskError> {
        if self.generation.get() == self.mine {
            Ok(())
        } else {
            Err(TaskError::Canceled)
        }
    }

    fn is_full(&self) -> bool {
        self.max_hits.is_some_and(|limit| self.hits.len() >= limit)
    }

    /// Record a hit; returns whether the sink can take more.
    fn push(&mut self, hit: SearchHit) -> std::result::Result<bool, TaskError> {
        self.check_current()?;
        self.hits.push(hit);
        if is_update_point(self.hits.len()) {
            (self.observer)(SearchEvent::Partial(self.hits.clone()));
            self.check_current()?;
        }
        Ok(!self.is_full())
    }

    fn emit(&mut self, event: SearchEvent) -> std::result::Result<(), TaskError> {
        self.check_current()?;
        (self.observer)(event);
        Ok(())
    }
}

impl SearchRun {
    async fn execute<F>(self, observer: F) -> std::result::Result<SearchReport, TaskError>
    where
        F: FnMut(SearchEvent) + 'static,
    {
        let started = Instant::now();
        let mut sink = HitSink {
            hits: Vec::new(),
            observer,
            generation: Rc::clone(&self.generation),
            mine: self.mine,
            max_hits: self.max_hits,
        };
        let mut files_scanned = 0;

        let text = self.text.trim();
        let status = if text.is_empty() {
            SearchStatus::Completed
        } else {
            match self.mode {
                SearchMode::Tags => {
                    self.find_tags(text, &mut sink).await?;
                    SearchStatus::Completed
                }
                SearchMode::Files => {
                    self.find_files(text, &mut sink).await?;
                    SearchStatus::Completed
                }
                // Surrounding whitespace can be part of a pattern.
                SearchMode::Content => match Regex::new(&self.text) {
                    Ok(regex) => {
                        files_scanned = self.find_content(&self.text, &regex, &mut sink).await?;
                        SearchStatus::Completed
                    }
                    Err(err) => {
                        let message = err.to_string();
                        log::debug!("Rejected content pattern {:?}: {message}", self.text);
                        sink.emit(SearchEvent::InvalidInput(message.clone()))?;
                        SearchStatus::InvalidInput(message)
                    }
                },
            }
        };

        let truncated = sink.is_full();
        if status == SearchStatus::Completed {
            sink.emit(SearchEvent::Finished(sink.hits.clone()))?;
        }
        let report = SearchReport {
            mode: self.mode,
            text: self.text.clone(),
            status,
            hits: std::mem::take(&mut sink.hits),
            truncated,
            files_scanned,
            time_ms: started.elapsed().as_millis() as u64,
        };
        log::debug!(
            "Search {} {:?}: {} hits in {} ms",
            report.mode,
            report.text,
            report.hits.len(),
            report.time_ms
        );
        Ok(report)
    }

    async fn find_tags<F: FnMut(SearchEvent)>(
        &self,
        text: &str,
        sink: &mut HitSink<F>,
    ) -> std::result::Result<(), TaskError> {
        let mut rows = self
            .connection
            .stream(query::TAGS_SQL, query::tags_params(text), |row| {
                Ok(SearchHit {
                    name: Some(row.get(0)?),
                    path: PathBuf::from(row.get::<_, String>(1)?),
                    line: Some(row.get(2)?),
                    context: None,
                })
            });
        while let Some(hit) = rows.next().await? {
            if !sink.push(hit)? {
                break;
            }
        }
        Ok(())
    }

    async fn find_files<F: FnMut(SearchEvent)>(
        &self,
        text: &str,
        sink: &mut HitSink<F>,
    ) -> std::result::Result<(), TaskError> {
        let mut rows = self
            .connection
            .stream(query::FILES_SQL, query::files_params(text), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            });
        while let Some((path, pass)) = rows.next().await? {
            if pass == 1 && !query::last_component_extends(&path, text) {
                continue;
            }
            let hit = SearchHit {
                path: PathBuf::from(path),
                line: None,
                name: None,
                context: None,
            };
            if !sink.push(hit)? {
                break;
            }
        }
        Ok(())
    }

    fn candidates(&self, pattern: &str) -> RowStream<PathBuf> {
        let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<PathBuf> {
            Ok(PathBuf::from(row.get::<_, String>(0)?))
        };
        match query::content_query(pattern) {
            Some(fts) => {
                log::debug!("Content candidates from full text: {fts}");
                self.connection
                    .stream(query::CONTENT_CANDIDATES_SQL, vec![Value::Text(fts)], map)
            }
            None => self.connection.stream(query::ALL_FILES_SQL, Vec::new(), map),
        }
    }

    /// Scan every candidate file; returns how many were opened.
    async fn find_content<F: FnMut(SearchEvent)>(
        &self,
        pattern: &str,
        regex: &Regex,
        sink: &mut HitSink<F>,
    ) -> std::result::Result<usize, TaskError> {
        let mut candidates = self.candidates(pattern);
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut scanned = 0;

        while let Some(path) = candidates.next().await? {
            sink.check_current()?;
            if !seen.insert(path.clone()) {
                continue;
            }

            let source = path.clone();
            let loaded = self
                .scheduler
                .run_blocking(move || Ok(read_source_text(&source)?))
                .await;
            sink.check_current()?;
            let text = match loaded {
                Ok(text) => text,
                Err(err) => {
                    log::debug!("Skipping {}: {err}", path.display());
                    continue;
                }
            };
            scanned += 1;

            let mut scanner = LineScanner::new(&text);
            let mut matches: Vec<LineMatch> = Vec::new();
            while !scanner.is_done() {
                scanner.scan(regex, SCAN_SLICE, &mut matches);
                for found in matches.drain(..) {
                    let hit = SearchHit {
                        path: path.clone(),
                        line: Some(found.line),
                        name: None,
                        context: Some(found.context),
                    };
                    if !sink.push(hit)? {
                        return Ok(scanned);
                    }
                }
                yield_now().await;
                sink.check_current()?;
            }
        }
        Ok(scanned)
    }
}
