use pretty_assertions::assert_eq;
use std::fs;
use std::path::{Path, PathBuf};
use tagdex_indexer::{Change, ChangeDetector};
use tagdex_runtime::Scheduler;
use tagdex_store::TagStore;
use tempfile::TempDir;

fn write(path: &Path, text: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, text).expect("write file");
}

#[test]
fn change_set_lists_stale_tracked_files_then_modified_files() {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path().join("proj");
    let outside = dir.path().join("outside");
    write(&root.join("a.c"), "int a;");
    write(&root.join("b.h"), "int b;");
    write(&root.join("notes.txt"), "not source");
    write(&root.join("sub").join("c.c"), "int c;");
    write(&outside.join("o.c"), "int o;");

    let scheduler = Scheduler::with_workers(2);
    let store = TagStore::open(&scheduler, &dir.path().join("tags.db")).expect("open store");

    let setup_store = store.clone();
    let (unchanged, gone, stray) = (
        root.join("a.c"),
        root.join("gone.c"),
        outside.join("o.c"),
    );
    let (gone_key, stray_key) = (gone.clone(), stray.clone());
    let setup_root = root.clone();
    scheduler
        .block_on(async move {
            setup_store.add_folder(&setup_root).await?;
            setup_store.add_filter("*.c", Some("C")).await?;
            setup_store.add_filter("*.h", None).await?;
            setup_store
                .set_source_file_timestamp(&unchanged, i64::MAX)
                .await?;
            setup_store.set_source_file_timestamp(&gone_key, 1).await?;
            setup_store.set_source_file_timestamp(&stray_key, 1).await?;
            Ok(())
        })
        .expect("seed store");

    let detector = ChangeDetector::new(&store).with_capacity(2);
    let changes = scheduler
        .block_on(async move { detector.change_set().collect().await })
        .expect("change set");

    assert_eq!(
        changes,
        vec![
            Change::deleted(gone),
            Change::deleted(stray),
            Change::updated(root.join("b.h")),
            Change::updated(root.join("sub").join("c.c")),
        ]
    );
}

#[test]
fn empty_store_yields_an_empty_change_set() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = Scheduler::with_workers(1);
    let store = TagStore::open(&scheduler, &dir.path().join("tags.db")).expect("open store");

    let detector = ChangeDetector::new(&store);
    let changes = scheduler
        .block_on(async move { detector.change_set().collect().await })
        .expect("change set");
    assert_eq!(changes, Vec::<Change>::new());
}

#[test]
fn files_outside_every_folder_are_not_walked() {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path().join("proj");
    write(&root.join("main.c"), "int main;");
    write(&dir.path().join("project2").join("other.c"), "int other;");

    let scheduler = Scheduler::with_workers(1);
    let store = TagStore::open(&scheduler, &dir.path().join("tags.db")).expect("open store");
    let setup_store = store.clone();
    let setup_root = root.clone();
    scheduler
        .block_on(async move {
            setup_store.add_folder(&setup_root).await?;
            setup_store.add_filter("*.c", None).await?;
            Ok(())
        })
        .expect("seed store");

    let detector = ChangeDetector::new(&store);
    let changes = scheduler
        .block_on(async move { detector.change_set().collect().await })
        .expect("change set");
    let paths: Vec<PathBuf> = changes.into_iter().map(|change| change.path).collect();
    assert_eq!(paths, vec![root.join("main.c")]);
}
