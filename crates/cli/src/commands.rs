use crate::output;
use crate::Context;
use anyhow::{bail, Context as AnyhowContext, Result};
use std::path::{Path, PathBuf};
use tagdex_indexer::{build_filter_set, ProjectIndexer};
use tagdex_search::{SearchEvent, SearchMode, SearchSession, SearchStatus};
use tagdex_store::Filter;

/// Folder roots are stored absolute so change detection matches walked paths.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return path
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", path.display()));
    }
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    Ok(cwd.join(path))
}

pub(crate) fn add_folder(ctx: &Context, path: &Path) -> Result<()> {
    if !path.is_dir() {
        bail!("{} is not a directory", path.display());
    }
    let folder = absolute(path)?;
    let id = ctx
        .scheduler
        .wait(&ctx.store.add_folder(&folder))
        .context("Failed to add folder")?;
    log::debug!("Folder {} has id {id}", folder.display());
    println!("Added folder {}", folder.display());
    Ok(())
}

pub(crate) fn remove_folder(ctx: &Context, path: &Path) -> Result<()> {
    let folder = absolute(path)?;
    let removed = ctx
        .scheduler
        .wait(&ctx.store.remove_folder(&folder))
        .context("Failed to remove folder")?;
    println!(
        "Removed folder {} ({removed} indexed files dropped)",
        folder.display()
    );
    Ok(())
}

pub(crate) fn list_folders(ctx: &Context, json: bool) -> Result<()> {
    let store = ctx.store.clone();
    let folders = ctx
        .scheduler
        .block_on(async move { Ok(store.folders().collect().await?) })
        .context("Failed to list folders")?;
    if json {
        return output::print_json(&folders);
    }
    for folder in &folders {
        println!("{}", folder.path.display());
    }
    Ok(())
}

pub(crate) fn add_filter(ctx: &Context, pattern: &str, language: Option<&str>) -> Result<()> {
    let candidate = Filter {
        id: 0,
        pattern: pattern.to_string(),
        language: language.map(str::to_string),
    };
    build_filter_set(std::slice::from_ref(&candidate))?;
    ctx.scheduler
        .wait(&ctx.store.add_filter(pattern, language))
        .context("Failed to add filter")?;
    println!("Added filter {pattern}");
    Ok(())
}

pub(crate) fn remove_filter(ctx: &Context, pattern: &str) -> Result<()> {
    let removed = ctx
        .scheduler
        .wait(&ctx.store.remove_filter(pattern))
        .context("Failed to remove filter")?;
    if removed == 0 {
        bail!("No filter {pattern:?}");
    }
    println!("Removed filter {pattern}");
    Ok(())
}

pub(crate) fn list_filters(ctx: &Context, json: bool) -> Result<()> {
    let store = ctx.store.clone();
    let filters = ctx
        .scheduler
        .block_on(async move { Ok(store.filters().collect().await?) })
        .context("Failed to list filters")?;
    if json {
        return output::print_json(&filters);
    }
    for filter in &filters {
        match &filter.language {
            Some(language) => println!("{}\t{language}", filter.pattern),
            None => println!("{}", filter.pattern),
        }
    }
    Ok(())
}

pub(crate) fn index(ctx: &Context, json: bool) -> Result<()> {
    let indexer = ProjectIndexer::new(&ctx.store, ctx.config.clone());
    let stats = ctx
        .scheduler
        .wait(&indexer.run())
        .context("Indexing failed")?;
    if json {
        return output::print_json(&stats);
    }
    println!(
        "{} changed, {} deleted, {} tagged, {} skipped, {} tags in {} ms",
        stats.files_changed,
        stats.files_deleted,
        stats.files_tagged,
        stats.files_skipped,
        stats.tags_added,
        stats.time_ms
    );
    if stats.malformed_lines > 0 {
        println!("{} malformed tagger lines ignored", stats.malformed_lines);
    }
    Ok(())
}

pub(crate) fn search(
    ctx: &Context,
    mode: SearchMode,
    text: &str,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let mut session = SearchSession::new(&ctx.store).context("Failed to open search session")?;
    if let Some(limit) = limit {
        session = session.with_max_hits(limit);
    }
    let promise = session.search(text, mode, |event| {
        if let SearchEvent::Partial(hits) = event {
            log::debug!("{} results so far", hits.len());
        }
    });
    let report = ctx.scheduler.wait(&promise).context("Search failed")?;

    if json {
        return output::print_json(&report);
    }
    if let SearchStatus::InvalidInput(message) = &report.status {
        bail!("Invalid {mode} query {text:?}: {message}");
    }
    for hit in &report.hits {
        println!("{}", output::format_hit(mode, hit));
    }
    log::info!(
        "{} result(s) found{}",
        report.hits.len(),
        if report.truncated { " (limit reached)" } else { "" }
    );
    Ok(())
}

pub(crate) fn compact(ctx: &Context) -> Result<()> {
    let removed = ctx
        .scheduler
        .wait(&ctx.store.compact())
        .context("Failed to compact database")?;
    println!("Compacted database ({removed} unused contexts removed)");
    Ok(())
}

pub(crate) fn clear(ctx: &Context) -> Result<()> {
    let removed = ctx
        .scheduler
        .wait(&ctx.store.clear_tags())
        .context("Failed to clear tags")?;
    println!("Cleared {removed} tags");
    Ok(())
}

pub(crate) fn get_preference(ctx: &Context, name: &str) -> Result<()> {
    let value = ctx
        .scheduler
        .wait(&ctx.store.get_preference(name))
        .context("Failed to read preference")?;
    match value {
        Some(value) => println!("{value}"),
        None => bail!("Preference {name:?} is not set"),
    }
    Ok(())
}

pub(crate) fn set_preference(ctx: &Context, name: &str, value: &str) -> Result<()> {
    ctx.scheduler
        .wait(&ctx.store.set_preference(name, value))
        .context("Failed to store preference")?;
    Ok(())
}

pub(crate) fn stats(ctx: &Context, json: bool) -> Result<()> {
    let stats = ctx
        .scheduler
        .wait(&ctx.store.stats())
        .context("Failed to read database statistics")?;
    if json {
        return output::print_json(&stats);
    }
    println!("folders:      {}", stats.folders);
    println!("filters:      {}", stats.filters);
    println!("source files: {}", stats.source_files);
    println!("tags:         {}", stats.tags);
    println!("kinds:        {}", stats.kinds);
    println!("contexts:     {}", stats.contexts);
    println!("languages:    {}", stats.languages);
    Ok(())
}
