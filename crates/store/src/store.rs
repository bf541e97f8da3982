use crate::connection::{DbConnection, RowStream};
use crate::error::Result;
use crate::memo::{Memo, DEFAULT_MEMO_CAPACITY};
use crate::types::{path_key, Filter, Folder, SourceFile, StoreStats, Tag};
use rusqlite::{params, Connection, OptionalExtension};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::rc::Rc;
use tagdex_runtime::{Outcome, Promise, Scheduler, TaskPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interned {
    SourceFile,
    Kind,
    Context,
    Language,
}

impl Interned {
    fn insert_sql(self) -> &'static str {
        match self {
            Self::SourceFile => "INSERT OR IGNORE INTO source_files (path) VALUES (?1)",
            Self::Kind => "INSERT OR IGNORE INTO tag_kinds (name) VALUES (?1)",
            Self::Context => "INSERT OR IGNORE INTO tag_contexts (text) VALUES (?1)",
            Self::Language => "INSERT OR IGNORE INTO tag_languages (name) VALUES (?1)",
        }
    }

    fn select_sql(self) -> &'static str {
        match self {
            Self::SourceFile => "SELECT id FROM source_files WHERE path = ?1",
            Self::Kind => "SELECT id FROM tag_kinds WHERE name = ?1",
            Self::Context => "SELECT id FROM tag_contexts WHERE text = ?1",
            Self::Language => "SELECT id FROM tag_languages WHERE name = ?1",
        }
    }
}

/// Lookup-or-insert in one statement pair on the writer thread; UNIQUE keeps it race free.
fn intern(conn: &Connection, table: Interned, text: &str) -> Result<i64> {
    conn.prepare_cached(table.insert_sql())?.execute([text])?;
    let id = conn
        .prepare_cached(table.select_sql())?
        .query_row([text], |row| row.get(0))?;
    Ok(id)
}

/// `path` with exactly one trailing separator, for prefix matching of folder contents.
fn folder_prefix(path: &Path) -> String {
    let mut prefix = path_key(path);
    while prefix.len() > 1 && prefix.ends_with(MAIN_SEPARATOR) {
        prefix.pop();
    }
    if !prefix.ends_with(MAIN_SEPARATOR) {
        prefix.push(MAIN_SEPARATOR);
    }
    prefix
}

fn delete_file_rows(conn: &Connection, id: i64) -> Result<usize> {
    conn.execute("DELETE FROM tags WHERE source_file_id = ?1", [id])?;
    conn.execute("DELETE FROM full_text WHERE rowid = ?1", [id])?;
    Ok(conn.execute("DELETE FROM source_files WHERE id = ?1", [id])?)
}

fn delete_folder_rows(conn: &Connection, prefix: &str) -> Result<usize> {
    conn.execute(
        "DELETE FROM tags WHERE source_file_id IN (
            SELECT id FROM source_files WHERE substr(path, 1, length(?1)) = ?1
        )",
        [prefix],
    )?;
    conn.execute(
        "DELETE FROM full_text WHERE rowid IN (
            SELECT id FROM source_files WHERE substr(path, 1, length(?1)) = ?1
        )",
        [prefix],
    )?;
    Ok(conn.execute(
        "DELETE FROM source_files WHERE substr(path, 1, length(?1)) = ?1",
        [prefix],
    )?)
}

fn count(conn: &Connection, table: &str) -> Result<i64> {
    Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?)
}

struct MemoTables {
    source_files: Memo<i64>,
    kinds: Memo<i64>,
    contexts: Memo<i64>,
    languages: Memo<i64>,
}

impl MemoTables {
    fn new(capacity: usize) -> Self {
        Self {
            source_files: Memo::new(capacity),
            kinds: Memo::new(capacity),
            contexts: Memo::new(capacity),
            languages: Memo::new(capacity),
        }
    }

    fn table(&self, table: Interned) -> &Memo<i64> {
        match table {
            Interned::SourceFile => &self.source_files,
            Interned::Kind => &self.kinds,
            Interned::Context => &self.contexts,
            Interned::Language => &self.languages,
        }
    }

    fn flush(&self) {
        self.source_files.flush();
        self.kinds.flush();
        self.contexts.flush();
        self.languages.flush();
    }
}

struct StoreInner {
    scheduler: Scheduler,
    writer: DbConnection,
    reader: DbConnection,
    memos: Rc<MemoTables>,
    preferences: Rc<RefCell<HashMap<String, Option<String>>>>,
}

/// Persistent tag database.
///
/// Owns the single writer connection (every mutation is a job on its thread) and one read-only
/// connection used for row streams. Interned-id lookups go through per-table LRU memos that
/// are flushed whenever source files are deleted or the database is compacted.
#[derive(Clone)]
pub struct TagStore {
    inner: Rc<StoreInner>,
}

impl TagStore {
    pub fn open(scheduler: &Scheduler, path: &Path) -> Result<Self> {
        Self::open_with_capacity(scheduler, path, DEFAULT_MEMO_CAPACITY)
    }

    pub fn open_with_capacity(
        scheduler: &Scheduler,
        path: &Path,
        memo_capacity: usize,
    ) -> Result<Self> {
        let writer = DbConnection::open(scheduler, path)?;
        let reader = DbConnection::open_read_only(scheduler, path)?;
        log::debug!("Opened tag database {}", path.display());

        Ok(Self {
            inner: Rc::new(StoreInner {
                scheduler: scheduler.clone(),
                writer,
                reader,
                memos: Rc::new(MemoTables::new(memo_capacity)),
                preferences: Rc::new(RefCell::new(HashMap::new())),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        self.inner.writer.path()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// A new read-only connection on its own thread (one per search session).
    pub fn open_read_connection(&self) -> Result<DbConnection> {
        DbConnection::open_read_only(&self.inner.scheduler, self.path())
    }

    pub fn get_source_file_id(&self, path: &Path) -> Promise<i64> {
        self.memoized(Interned::SourceFile, &path_key(path))
    }

    pub fn get_kind_id(&self, kind: &str) -> Promise<i64> {
        self.optional_id(Interned::Kind, Some(kind))
    }

    pub fn get_context_id(&self, context: &str) -> Promise<i64> {
        self.optional_id(Interned::Context, Some(context))
    }

    pub fn get_language_id(&self, language: &str) -> Promise<i64> {
        self.optional_id(Interned::Language, Some(language))
    }

    /// Absent or empty text maps to id 0 and is never interned.
    fn optional_id(&self, table: Interned, text: Option<&str>) -> Promise<i64> {
        match text {
            Some(text) if !text.is_empty() => self.memoized(table, text),
            _ => Promise::completed(0),
        }
    }

    fn memoized(&self, table: Interned, text: &str) -> Promise<i64> {
        let memos = Rc::clone(&self.inner.memos);
        let memo = memos.table(table);
        if let Some(id) = memo.get(text) {
            return Promise::completed(id);
        }

        let generation = memo.generation();
        let key = text.to_string();
        let query = key.clone();
        let lookup = self
            .inner
            .writer
            .call(move |conn| intern(conn, table, &query));
        lookup.on_complete(move |outcome| {
            if let Outcome::Completed(id) = outcome {
                memos.table(table).insert(key, *id, generation);
            }
        });
        lookup
    }

    /// Clear every memoized id; lookups already in flight will not repopulate the memos.
    pub fn flush_memoized_ids(&self) {
        self.inner.memos.flush();
    }

    /// Insert one tag and return its row id. Nothing is written if an id lookup fails.
    pub fn add_tag(&self, tag: &Tag) -> Promise<i64> {
        let file = self.get_source_file_id(&tag.path);
        let kind = self.optional_id(Interned::Kind, tag.kind.as_deref());
        let context = self.optional_id(Interned::Context, tag.context.as_deref());
        let language = self.optional_id(Interned::Language, tag.language.as_deref());
        let writer = self.inner.writer.clone();
        let name = tag.name.clone();
        let line = tag.line;

        self.inner
            .scheduler
            .start_with(TaskPolicy::WhileFutureLives, async move {
                let file_id = file.await?;
                let kind_id = kind.await?;
                let context_id = context.await?;
                let language_id = language.await?;
                writer
                    .call(move |conn| {
                        conn.prepare_cached(
                            "INSERT INTO tags
                                (name, source_file_id, line_number, kind_id, context_id, language_id)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        )?
                        .execute(params![name, file_id, line, kind_id, context_id, language_id])?;
                        Ok(conn.last_insert_rowid())
                    })
                    .await
            })
    }

    pub fn delete_source_file(&self, path: &Path) -> Promise<usize> {
        self.delete_paths(path, false)
    }

    /// Delete `path` as a file, or, when no such file is tracked, every file under it.
    /// Resolves to the number of source files removed.
    pub fn delete_source_file_or_folder(&self, path: &Path) -> Promise<usize> {
        self.delete_paths(path, true)
    }

    fn delete_paths(&self, path: &Path, include_folder: bool) -> Promise<usize> {
        self.flush_memoized_ids();
        let key = path_key(path);
        let prefix = folder_prefix(path);

        let deletion = self.inner.writer.call(move |conn| {
            let tx = conn.transaction()?;
            let id: Option<i64> = tx
                .query_row("SELECT id FROM source_files WHERE path = ?1", [&key], |row| {
                    row.get(0)
                })
                .optional()?;
            let removed = match id {
                Some(id) => delete_file_rows(&tx, id)?,
                None if include_folder => delete_folder_rows(&tx, &prefix)?,
                None => 0,
            };
            tx.commit()?;
            Ok(removed)
        });

        // Lookups issued between the flush and the deletion job may have cached doomed ids.
        let memos = Rc::clone(&self.inner.memos);
        deletion.on_complete(move |_| memos.flush());
        deletion
    }

    pub fn delete_tags_for_file(&self, path: &Path) -> Promise<usize> {
        let key = path_key(path);
        self.inner.writer.call(move |conn| {
            Ok(conn.execute(
                "DELETE FROM tags WHERE source_file_id = (SELECT id FROM source_files WHERE path = ?1)",
                [&key],
            )?)
        })
    }

    /// Remove every tag and file text, and reset timestamps so the next run re-tags everything.
    pub fn clear_tags(&self) -> Promise<usize> {
        self.inner.writer.call(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM tags", [])?;
            tx.execute("DELETE FROM full_text", [])?;
            tx.execute("UPDATE source_files SET timestamp = 0", [])?;
            tx.commit()?;
            Ok(removed)
        })
    }

    pub fn source_file_timestamp(&self, path: &Path) -> Promise<Option<i64>> {
        let key = path_key(path);
        self.inner.writer.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT timestamp FROM source_files WHERE path = ?1",
                    [&key],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Record the modification time a file was tagged at; an existing row keeps its id.
    pub fn set_source_file_timestamp(&self, path: &Path, timestamp: i64) -> Promise<()> {
        let key = path_key(path);
        self.inner.writer.call(move |conn| {
            conn.execute(
                "INSERT INTO source_files (path, timestamp) VALUES (?1, ?2)
                 ON CONFLICT(path) DO UPDATE SET timestamp = excluded.timestamp",
                params![key, timestamp],
            )?;
            Ok(())
        })
    }

    /// Record several timestamps in one transaction.
    pub fn set_source_file_timestamps(&self, entries: Vec<(PathBuf, i64)>) -> Promise<usize> {
        self.inner.writer.call(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut upsert = tx.prepare_cached(
                    "INSERT INTO source_files (path, timestamp) VALUES (?1, ?2)
                     ON CONFLICT(path) DO UPDATE SET timestamp = excluded.timestamp",
                )?;
                for (path, timestamp) in &entries {
                    upsert.execute(params![path_key(path), timestamp])?;
                }
            }
            tx.commit()?;
            Ok(entries.len())
        })
    }

    /// Replace the full-text row of `path`, creating its source file row if needed.
    pub fn set_file_text(&self, path: &Path, text: String) -> Promise<i64> {
        let key = path_key(path);
        self.inner.writer.call(move |conn| {
            let tx = conn.transaction()?;
            let id = intern(&tx, Interned::SourceFile, &key)?;
            tx.execute("DELETE FROM full_text WHERE rowid = ?1", [id])?;
            tx.execute(
                "INSERT INTO full_text (rowid, file_text) VALUES (?1, ?2)",
                params![id, text],
            )?;
            tx.commit()?;
            Ok(id)
        })
    }

    pub fn get_preference(&self, name: &str) -> Promise<Option<String>> {
        if let Some(value) = self.inner.preferences.borrow().get(name) {
            return Promise::completed(value.clone());
        }

        let cache = Rc::clone(&self.inner.preferences);
        let key = name.to_string();
        let query = key.clone();
        let read = self.inner.writer.call(move |conn| {
            let value: Option<Option<String>> = conn
                .query_row(
                    "SELECT value FROM preferences WHERE name = ?1",
                    [&query],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.flatten())
        });
        read.on_complete(move |outcome| {
            if let Outcome::Completed(value) = outcome {
                cache.borrow_mut().entry(key).or_insert_with(|| value.clone());
            }
        });
        read
    }

    pub fn set_preference(&self, name: &str, value: &str) -> Promise<()> {
        let cache = Rc::clone(&self.inner.preferences);
        let key = name.to_string();
        let stored = value.to_string();
        let row = (key.clone(), stored.clone());
        let write = self.inner.writer.call(move |conn| {
            conn.execute(
                "INSERT INTO preferences (name, value) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value",
                params![row.0, row.1],
            )?;
            Ok(())
        });
        write.on_complete(move |outcome| {
            if outcome.is_completed() {
                cache.borrow_mut().insert(key, Some(stored));
            }
        });
        write
    }

    /// Drop contexts no tag references and reclaim file space. Resolves to the contexts removed.
    pub fn compact(&self) -> Promise<usize> {
        self.flush_memoized_ids();
        let compaction = self.inner.writer.call(|conn| {
            let removed = conn.execute(
                "DELETE FROM tag_contexts WHERE NOT EXISTS (
                    SELECT 1 FROM tags WHERE tags.context_id = tag_contexts.id
                )",
                [],
            )?;
            conn.execute_batch("VACUUM")?;
            Ok(removed)
        });
        let memos = Rc::clone(&self.inner.memos);
        compaction.on_complete(move |_| memos.flush());
        compaction
    }

    pub fn source_files(&self) -> RowStream<SourceFile> {
        self.inner.reader.stream(
            "SELECT id, path, timestamp FROM source_files ORDER BY id",
            Vec::new(),
            |row| {
                Ok(SourceFile {
                    id: row.get(0)?,
                    path: PathBuf::from(row.get::<_, String>(1)?),
                    timestamp: row.get(2)?,
                })
            },
        )
    }

    pub fn folders(&self) -> RowStream<Folder> {
        self.inner
            .reader
            .stream("SELECT id, path FROM folders ORDER BY id", Vec::new(), |row| {
                Ok(Folder {
                    id: row.get(0)?,
                    path: PathBuf::from(row.get::<_, String>(1)?),
                })
            })
    }

    pub fn filters(&self) -> RowStream<Filter> {
        self.inner.reader.stream(
            "SELECT id, pattern, language FROM filters ORDER BY id",
            Vec::new(),
            |row| {
                Ok(Filter {
                    id: row.get(0)?,
                    pattern: row.get(1)?,
                    language: row.get(2)?,
                })
            },
        )
    }

    /// Tags recorded for one file, in insertion order.
    pub fn tags_for_file(&self, path: &Path) -> RowStream<Tag> {
        self.inner.reader.stream(
            "SELECT tags.name, source_files.path, tags.line_number,
                    tag_kinds.name, tag_contexts.text, tag_languages.name
             FROM tags
             JOIN source_files ON source_files.id = tags.source_file_id
             LEFT JOIN tag_kinds ON tag_kinds.id = tags.kind_id
             LEFT JOIN tag_contexts ON tag_contexts.id = tags.context_id
             LEFT JOIN tag_languages ON tag_languages.id = tags.language_id
             WHERE source_files.path = ?1
             ORDER BY tags.id",
            vec![path_key(path).into()],
            |row| {
                Ok(Tag {
                    name: row.get(0)?,
                    path: PathBuf::from(row.get::<_, String>(1)?),
                    line: row.get(2)?,
                    kind: row.get(3)?,
                    context: row.get(4)?,
                    language: row.get(5)?,
                })
            },
        )
    }

    pub fn add_folder(&self, path: &Path) -> Promise<i64> {
        let key = path_key(path);
        self.inner.writer.call(move |conn| {
            conn.execute("INSERT OR IGNORE INTO folders (path) VALUES (?1)", [&key])?;
            Ok(conn.query_row("SELECT id FROM folders WHERE path = ?1", [&key], |row| {
                row.get(0)
            })?)
        })
    }

    /// Forget a folder root and everything indexed under it.
    /// Resolves to the number of source files removed.
    pub fn remove_folder(&self, path: &Path) -> Promise<usize> {
        let key = path_key(path);
        let store = self.clone();
        let folder = path.to_path_buf();
        self.inner
            .scheduler
            .start_with(TaskPolicy::WhileFutureLives, async move {
                let removed = store
                    .inner
                    .writer
                    .call(move |conn| Ok(conn.execute("DELETE FROM folders WHERE path = ?1", [&key])?))
                    .await?;
                if removed == 0 {
                    log::debug!("Folder {} was not configured", folder.display());
                }
                store.delete_source_file_or_folder(&folder).await
            })
    }

    pub fn add_filter(&self, pattern: &str, language: Option<&str>) -> Promise<i64> {
        let pattern = pattern.to_string();
        let language = language.map(str::to_string);
        self.inner.writer.call(move |conn| {
            conn.execute(
                "INSERT INTO filters (pattern, language) VALUES (?1, ?2)
                 ON CONFLICT(pattern) DO UPDATE SET language = excluded.language",
                params![pattern, language],
            )?;
            Ok(conn.query_row(
                "SELECT id FROM filters WHERE pattern = ?1",
                [&pattern],
                |row| row.get(0),
            )?)
        })
    }

    pub fn remove_filter(&self, pattern: &str) -> Promise<usize> {
        let pattern = pattern.to_string();
        self.inner.writer.call(move |conn| {
            Ok(conn.execute("DELETE FROM filters WHERE pattern = ?1", [&pattern])?)
        })
    }

    pub fn stats(&self) -> Promise<StoreStats> {
        self.inner.writer.call(|conn| {
            Ok(StoreStats {
                folders: count(conn, "folders")?,
                filters: count(conn, "filters")?,
                source_files: count(conn, "source_files")?,
                tags: count(conn, "tags")?,
                kinds: count(conn, "tag_kinds")?,
                contexts: count(conn, "tag_contexts")?,
                languages: count(conn, "tag_languages")?,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_prefix_has_single_trailing_separator() {
        let sep = MAIN_SEPARATOR;
        assert_eq!(
            folder_prefix(Path::new(&format!("{sep}proj"))),
            format!("{sep}proj{sep}")
        );
        assert_eq!(
            folder_prefix(Path::new(&format!("{sep}proj{sep}{sep}"))),
            format!("{sep}proj{sep}")
        );
        assert_eq!(folder_prefix(Path::new(&format!("{sep}"))), format!("{sep}"));
    }
}
