use crate::changes::ChangeDetector;
use crate::config::IndexerConfig;
use crate::generator::{GeneratorRun, TagGenerator};
use crate::source::load_source;
use crate::stats::IndexStats;
use crate::tagline::parse_tag_line;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tagdex_runtime::{Promise, Queue, Scheduler, TaskError, TaskPolicy};
use tagdex_store::TagStore;

type SharedStats = Rc<RefCell<IndexStats>>;
type PendingTimestamps = Rc<RefCell<Vec<(PathBuf, i64)>>>;

/// Incremental indexer for every configured folder.
///
/// A run reconciles the database with the file system: deletions go straight to the store,
/// new and modified files go through the tagger and their tags are written as they are parsed.
/// Timestamps are only recorded once the tagger run that covered them succeeded, so files of a
/// failed run are picked up again next time.
pub struct ProjectIndexer {
    scheduler: Scheduler,
    store: TagStore,
    config: IndexerConfig,
}

impl ProjectIndexer {
    pub fn new(store: &TagStore, config: IndexerConfig) -> Self {
        Self {
            scheduler: store.scheduler().clone(),
            store: store.clone(),
            config,
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Start an index run. Dropping or disposing the promise stops the run.
    pub fn run(&self) -> Promise<IndexStats> {
        let run = IndexRun {
            scheduler: self.scheduler.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            stats: Rc::new(RefCell::new(IndexStats::new())),
            pending: Rc::new(RefCell::new(Vec::new())),
        };
        self.scheduler
            .start_with(TaskPolicy::WhileFutureLives, run.execute())
    }
}

struct IndexRun {
    scheduler: Scheduler,
    store: TagStore,
    config: IndexerConfig,
    stats: SharedStats,
    pending: PendingTimestamps,
}

/// The tagger side of a run, started on the first changed file.
struct Pipeline {
    filenames: Queue<PathBuf>,
    run: GeneratorRun,
    parser: Promise<()>,
}

impl IndexRun {
    async fn execute(self) -> Result<IndexStats, TaskError> {
        let started = Instant::now();
        log::info!("Indexing started");
        let _progress = self.scheduler.start_with(
            TaskPolicy::WhileFutureLives,
            report_progress(
                self.scheduler.clone(),
                Rc::clone(&self.stats),
                self.config.progress_interval(),
            ),
        );

        let mut changes = ChangeDetector::new(&self.store)
            .with_capacity(self.config.queue_capacity)
            .change_set();
        let mut pipeline: Option<Pipeline> = None;

        while let Some(change) = changes.next().await? {
            if change.deleted {
                let removed = self
                    .store
                    .delete_source_file_or_folder(&change.path)
                    .await?;
                log::debug!("Removed {} ({removed} rows)", change.path.display());
                self.stats.borrow_mut().files_deleted += removed;
                continue;
            }

            self.stats.borrow_mut().files_changed += 1;
            if pipeline.is_none() {
                pipeline = Some(self.start_pipeline()?);
            }
            if let Some(active) = &pipeline {
                if active.filenames.send(change.path).await.is_err() {
                    // The feeder stopped; its own failure is reported below.
                    break;
                }
            }
        }
        drop(changes);

        if let Some(Pipeline {
            filenames,
            run,
            parser,
        }) = pipeline
        {
            filenames.close();
            let generated = run.done.await;
            let parsed = parser.await;
            parsed?;
            generated?;

            let pending = std::mem::take(&mut *self.pending.borrow_mut());
            if !pending.is_empty() {
                self.store.set_source_file_timestamps(pending).await?;
            }
        }

        if self.config.compact_after_index {
            let removed = self.store.compact().await?;
            log::info!("Compacted database ({removed} unused contexts removed)");
        }

        let mut stats = self.stats.borrow().clone();
        stats.time_ms = started.elapsed().as_millis() as u64;
        log::info!(
            "Indexing completed: {} changed, {} deleted, {} tagged, {} skipped, {} tags in {} ms",
            stats.files_changed,
            stats.files_deleted,
            stats.files_tagged,
            stats.files_skipped,
            stats.tags_added,
            stats.time_ms
        );
        Ok(stats)
    }

    fn start_pipeline(&self) -> Result<Pipeline, TaskError> {
        let filenames = Queue::bounded(self.config.queue_capacity);
        let generator = TagGenerator::new(&self.scheduler, self.config.tagger.clone())
            .with_capacity(self.config.queue_capacity);

        let scheduler = self.scheduler.clone();
        let store = self.store.clone();
        let stats = Rc::clone(&self.stats);
        let pending = Rc::clone(&self.pending);
        let run = generator.start(filenames.clone(), move |path: &Path| {
            prepare_file(&scheduler, &store, &stats, &pending, path)
        })?;

        let parser = self.scheduler.start_with(
            TaskPolicy::WhileFutureLives,
            store_tags(self.store.clone(), run.lines.clone(), Rc::clone(&self.stats)),
        );

        Ok(Pipeline {
            filenames,
            run,
            parser,
        })
    }
}

/// Read a changed file, replace its text and drop its old tags before it is re-tagged.
/// Resolves to `false` for files that cannot be read; those are skipped.
fn prepare_file(
    scheduler: &Scheduler,
    store: &TagStore,
    stats: &SharedStats,
    pending: &PendingTimestamps,
    path: &Path,
) -> Promise<bool> {
    let worker = scheduler.clone();
    let store = store.clone();
    let stats = Rc::clone(stats);
    let pending = Rc::clone(pending);
    let path = path.to_path_buf();

    scheduler.start_with(TaskPolicy::WhileFutureLives, async move {
        let source = path.clone();
        let loaded = worker
            .run_blocking(move || Ok(load_source(&source)?))
            .await;
        let (modified, text) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                log::warn!("Skipping {}: {err}", path.display());
                stats.borrow_mut().files_skipped += 1;
                return Ok(false);
            }
        };

        log::debug!("Tagging {}", path.display());
        store.delete_tags_for_file(&path).await?;
        store.set_file_text(&path, text).await?;
        pending.borrow_mut().push((path, modified));
        stats.borrow_mut().files_tagged += 1;
        Ok(true)
    })
}

async fn store_tags(store: TagStore, lines: Queue<String>, stats: SharedStats) -> Result<(), TaskError> {
    let result = async {
        while let Some(line) = lines.dequeue().await? {
            match parse_tag_line(&line) {
                Ok(Some(tag)) => {
                    store.add_tag(&tag).await?;
                    stats.borrow_mut().tags_added += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!("Skipping malformed tag line: {err}");
                    stats.borrow_mut().malformed_lines += 1;
                }
            }
        }
        Ok(())
    }
    .await;
    // Stop the reader from waiting on a consumer that is gone.
    lines.close();
    result
}

async fn report_progress(
    scheduler: Scheduler,
    stats: SharedStats,
    interval: Duration,
) -> Result<(), TaskError> {
    loop {
        scheduler.sleep(interval).await?;
        let snapshot = stats.borrow().clone();
        log::info!(
            "Indexing: {} changed, {} deleted, {} tagged, {} tags so far",
            snapshot.files_changed,
            snapshot.files_deleted,
            snapshot.files_tagged,
            snapshot.tags_added
        );
    }
}
