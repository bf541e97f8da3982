use crate::error::IndexerError;
use crate::source::modified_nanos;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::thread;
use tagdex_runtime::{Promise, Queue, Scheduler, TaskError, TaskPolicy};
use tagdex_store::{Filter, Folder, SourceFile, TagStore};
use tokio::sync::mpsc;
use walkdir::WalkDir;

const EXISTENCE_BATCH: usize = 128;
const WALK_BUFFER: usize = 256;

/// One entry of a change set: a file to re-tag, or a tracked file to forget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub path: PathBuf,
    pub deleted: bool,
}

impl Change {
    pub fn updated(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            deleted: false,
        }
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            deleted: true,
        }
    }
}

/// Compile filter patterns into one matcher applied to file names.
pub fn build_filter_set(filters: &[Filter]) -> Result<GlobSet, IndexerError> {
    let mut builder = GlobSetBuilder::new();
    for filter in filters {
        let glob = Glob::new(&filter.pattern).map_err(|source| IndexerError::InvalidPattern {
            pattern: filter.pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| IndexerError::InvalidPattern {
        pattern: filters
            .iter()
            .map(|f| f.pattern.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        source,
    })
}

/// Component-wise containment: `/proj` contains `/proj/a.c` but not `/project/a.c`.
fn inside_any(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}

/// Drop roots nested inside other roots so no file is walked twice.
fn outermost_roots(folders: &[Folder]) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = folders.iter().map(|f| f.path.clone()).collect();
    roots.sort();
    roots.dedup();
    let mut outermost: Vec<PathBuf> = Vec::with_capacity(roots.len());
    for root in roots {
        if !inside_any(&root, &outermost) {
            outermost.push(root);
        }
    }
    outermost
}

/// Reconciles the database with the file system.
///
/// A change set first lists tracked files that vanished or fell outside every folder, then
/// walks each folder (depth first) for filter-matching files modified since they were last
/// tagged.
pub struct ChangeDetector {
    scheduler: Scheduler,
    store: TagStore,
    capacity: usize,
}

impl ChangeDetector {
    pub fn new(store: &TagStore) -> Self {
        Self {
            scheduler: store.scheduler().clone(),
            store: store.clone(),
            capacity: WALK_BUFFER,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Start producing the change set; consume it through the returned stream.
    pub fn change_set(&self) -> ChangeStream {
        let queue = Queue::bounded(self.capacity);
        let producer_queue = queue.clone();
        let scheduler = self.scheduler.clone();
        let store = self.store.clone();

        let producer = self
            .scheduler
            .start_with(TaskPolicy::WhileFutureLives, async move {
                let result = produce(&scheduler, &store, &producer_queue).await;
                producer_queue.close();
                result
            });

        ChangeStream {
            queue,
            producer,
            finished: false,
        }
    }
}

async fn produce(
    scheduler: &Scheduler,
    store: &TagStore,
    out: &Queue<Change>,
) -> Result<(), TaskError> {
    let filters = store.filters().collect().await?;
    let folders = store.folders().collect().await?;
    let globs = build_filter_set(&filters)?;
    let roots = outermost_roots(&folders);
    if filters.is_empty() {
        log::warn!("No filters configured; no files will be indexed");
    }

    let mut known: HashMap<PathBuf, i64> = HashMap::new();
    let mut deleted = 0usize;
    let mut batch: Vec<SourceFile> = Vec::with_capacity(EXISTENCE_BATCH);
    let mut tracked = store.source_files();
    loop {
        let next = tracked.next().await?;
        let exhausted = next.is_none();
        if let Some(file) = next {
            batch.push(file);
        }
        if batch.len() >= EXISTENCE_BATCH || (exhausted && !batch.is_empty()) {
            let files = std::mem::take(&mut batch);
            deleted += reconcile_batch(scheduler, &roots, files, &mut known, out).await?;
        }
        if exhausted {
            break;
        }
    }
    log::debug!("{deleted} tracked files are gone or outside every folder");

    let mut updated = 0usize;
    for root in &roots {
        updated += walk_root(scheduler, root, &globs, &known, out).await?;
    }
    log::debug!("{updated} files need tagging");
    Ok(())
}

/// Emit deletions for one batch of tracked files; remember the timestamps of the survivors.
async fn reconcile_batch(
    scheduler: &Scheduler,
    roots: &[PathBuf],
    files: Vec<SourceFile>,
    known: &mut HashMap<PathBuf, i64>,
    out: &Queue<Change>,
) -> Result<usize, TaskError> {
    let paths: Vec<PathBuf> = files.iter().map(|file| file.path.clone()).collect();
    let exists = scheduler
        .run_blocking(move || Ok(paths.iter().map(|path| path.is_file()).collect::<Vec<bool>>()))
        .await?;

    let mut deleted = 0;
    for (file, exists) in files.into_iter().zip(exists) {
        if exists && inside_any(&file.path, roots) {
            known.insert(file.path, file.timestamp);
        } else {
            deleted += 1;
            out.send(Change::deleted(file.path)).await?;
        }
    }
    Ok(deleted)
}

struct WalkedFile {
    path: PathBuf,
    modified: i64,
}

async fn walk_root(
    scheduler: &Scheduler,
    root: &Path,
    globs: &GlobSet,
    known: &HashMap<PathBuf, i64>,
    out: &Queue<Change>,
) -> Result<usize, TaskError> {
    let (tx, mut rx) = mpsc::channel::<WalkedFile>(WALK_BUFFER);
    let walk_root = root.to_path_buf();
    let walk_globs = globs.clone();
    thread::Builder::new()
        .name("tagdex-walk".to_string())
        .spawn(move || walk(&walk_root, &walk_globs, &tx))
        .map_err(IndexerError::from)?;

    let mut updated = 0;
    while let Some(file) = scheduler.external(rx.recv()).await {
        let stored = known.get(&file.path).copied().unwrap_or(0);
        if file.modified > stored {
            updated += 1;
            out.send(Change::updated(file.path)).await?;
        }
    }
    Ok(updated)
}

/// Runs on the walker thread. Stops early once the receiving side is gone.
fn walk(root: &Path, globs: &GlobSet, tx: &mpsc::Sender<WalkedFile>) {
    log::debug!("Walking {}", root.display());
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::debug!("Skipping unreadable entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() || !globs.is_match(entry.file_name()) {
            continue;
        }
        let modified = match entry.metadata() {
            Ok(meta) => modified_nanos(&meta),
            Err(err) => {
                log::debug!("Skipping {}: {err}", entry.path().display());
                continue;
            }
        };
        let file = WalkedFile {
            path: entry.into_path(),
            modified,
        };
        if tx.blocking_send(file).is_err() {
            return;
        }
    }
}

/// Lazily produced change set.
///
/// Backed by a bounded queue, so the detector only runs ahead of the consumer by the queue's
/// capacity. A producer failure is returned once the already-queued changes are consumed.
/// Dropping the stream stops the producer.
pub struct ChangeStream {
    queue: Queue<Change>,
    producer: Promise<()>,
    finished: bool,
}

impl ChangeStream {
    pub async fn next(&mut self) -> Result<Option<Change>, TaskError> {
        if self.finished {
            return Ok(None);
        }
        match self.queue.dequeue().await? {
            Some(change) => Ok(Some(change)),
            None => {
                self.finished = true;
                self.producer.clone().await?;
                Ok(None)
            }
        }
    }

    pub async fn collect(mut self) -> Result<Vec<Change>, TaskError> {
        let mut changes = Vec::new();
        while let Some(change) = self.next().await? {
            changes.push(change);
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(path: &str) -> Folder {
        Folder {
            id: 0,
            path: PathBuf::from(path),
        }
    }

    #[test]
    fn nested_roots_collapse_into_their_parent() {
        let roots = outermost_roots(&[folder("/proj/sub"), folder("/proj"), folder("/project")]);
        assert_eq!(roots, vec![PathBuf::from("/proj"), PathBuf::from("/project")]);
    }

    #[test]
    fn filters_match_file_names_only() {
        let filters = vec![Filter {
            id: 1,
            pattern: "*.c".into(),
            language: None,
        }];
        let set = build_filter_set(&filters).unwrap();
        assert!(set.is_match("main.c"));
        assert!(!set.is_match("main.cpp"));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let filters = vec![Filter {
            id: 1,
            pattern: "[".into(),
            language: None,
        }];
        assert!(matches!(
            build_filter_set(&filters),
            Err(IndexerError::InvalidPattern { .. })
        ));
    }
}
