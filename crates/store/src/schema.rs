//! Database schema and migrations for the tag database.
//!
//! Migrations are append-only and tracked in `schema_meta`; never edit an existing entry.
//! `open_db` opens (or creates) the database with WAL and foreign keys and applies pending
//! migrations. Readers use `open_read_only` and never migrate.

use rusqlite::{Connection, OpenFlags, Result as SqlResult};
use std::path::Path;

struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: "
            CREATE TABLE folders (
                id   INTEGER PRIMARY KEY,
                path TEXT    NOT NULL UNIQUE
            );

            CREATE TABLE filters (
                id       INTEGER PRIMARY KEY,
                pattern  TEXT    NOT NULL UNIQUE,
                language TEXT
            );

            CREATE TABLE preferences (
                name  TEXT PRIMARY KEY,
                value TEXT
            );

            CREATE TABLE source_files (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                path      TEXT    NOT NULL UNIQUE,
                timestamp INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE tag_kinds (
                id   INTEGER PRIMARY KEY,
                name TEXT    NOT NULL UNIQUE
            );

            CREATE TABLE tag_contexts (
                id   INTEGER PRIMARY KEY,
                text TEXT    NOT NULL UNIQUE
            );

            CREATE TABLE tag_languages (
                id   INTEGER PRIMARY KEY,
                name TEXT    NOT NULL UNIQUE
            );

            CREATE TABLE tags (
                id             INTEGER PRIMARY KEY,
                name           TEXT    NOT NULL,
                source_file_id INTEGER NOT NULL REFERENCES source_files(id),
                line_number    INTEGER NOT NULL,
                kind_id        INTEGER NOT NULL DEFAULT 0,
                context_id     INTEGER NOT NULL DEFAULT 0,
                language_id    INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_tags_name           ON tags(name);
            CREATE INDEX idx_tags_source_file_id ON tags(source_file_id);
            CREATE INDEX idx_tags_context_id     ON tags(context_id);

            CREATE VIEW tags_and_source_files AS
                SELECT tags.name         AS tag_name,
                       source_files.path AS path,
                       tags.line_number  AS line_number
                FROM tags
                JOIN source_files ON source_files.id = tags.source_file_id;
        ",
    },
    Migration {
        version: 2,
        sql: "
            CREATE VIRTUAL TABLE full_text USING fts5(
                file_text,
                tokenize = 'trigram'
            );
        ",
    },
];

/// Open (or create) the writer connection at `path` and bring the schema up to date.
pub fn open_db(path: &Path) -> SqlResult<Connection> {
    let conn = Connection::open(path)?;

    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "synchronous", "normal")?;
    conn.pragma_update(None, "foreign_keys", "on")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_meta (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    apply_migrations(&conn)?;
    Ok(conn)
}

/// Open an existing database for reading only.
pub fn open_read_only(path: &Path) -> SqlResult<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.pragma_update(None, "foreign_keys", "on")?;
    Ok(conn)
}

pub fn schema_version(conn: &Connection) -> SqlResult<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_meta",
        [],
        |row| row.get(0),
    )
}

fn apply_migrations(conn: &Connection) -> SqlResult<()> {
    let max_applied = schema_version(conn)?;

    for m in MIGRATIONS {
        if m.version > max_applied {
            log::debug!("Applying schema migration {}", m.version);
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(m.sql)?;
            tx.execute("INSERT INTO schema_meta (version) VALUES (?1)", [m.version])?;
            tx.commit()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp_db() -> (Connection, TempDir) {
        let dir = TempDir::new().unwrap();
        let conn = open_db(&dir.path().join("tags.db")).unwrap();
        (conn, dir)
    }

    fn names(conn: &Connection, kind: &str) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type = ?1 ORDER BY name")
            .unwrap()
            .query_map([kind], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn open_db_creates_tables_and_view() {
        let (conn, _dir) = open_temp_db();
        let tables = names(&conn, "table");
        for expected in [
            "filters",
            "folders",
            "full_text",
            "preferences",
            "schema_meta",
            "source_files",
            "tag_contexts",
            "tag_kinds",
            "tag_languages",
            "tags",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
        assert_eq!(names(&conn, "view"), vec!["tags_and_source_files".to_string()]);
    }

    #[test]
    fn wal_and_foreign_keys_enabled() {
        let (conn, _dir) = open_temp_db();
        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let fk: i32 = conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn migrations_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tags.db");
        drop(open_db(&path).unwrap());
        let conn = open_db(&path).unwrap();
        let applied: u32 = conn
            .query_row("SELECT COUNT(*) FROM schema_meta", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, MIGRATIONS.len() as u32);
        assert_eq!(schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn tag_requires_existing_source_file() {
        let (conn, _dir) = open_temp_db();
        let result = conn.execute(
            "INSERT INTO tags (name, source_file_id, line_number) VALUES ('main', 42, 1)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn trigram_full_text_matches_substrings() {
        let (conn, _dir) = open_temp_db();
        conn.execute(
            "INSERT INTO full_text (rowid, file_text) VALUES (7, 'fn parse_header() {}')",
            [],
        )
        .unwrap();
        let rowid: i64 = conn
            .query_row(
                "SELECT rowid FROM full_text WHERE full_text MATCH '\"arse_he\"'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(rowid, 7);
    }

    #[test]
    fn read_only_connection_rejects_writes() {
        let (_writer, dir) = open_temp_db();
        let reader = open_read_only(&dir.path().join("tags.db")).unwrap();
        let result = reader.execute("INSERT INTO folders (path) VALUES ('/tmp')", []);
        assert!(result.is_err());
    }
}
