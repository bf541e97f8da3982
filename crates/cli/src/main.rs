use anyhow::{Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tagdex_indexer::IndexerConfig;
use tagdex_runtime::Scheduler;
use tagdex_search::SearchMode;
use tagdex_store::TagStore;

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "tagdex")]
#[command(about = "Incremental symbol tag index and search for source trees", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file (default: tagdex.toml in the working directory, when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tag database (overrides TAGDEX_DB and the configured path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage indexed folders
    #[command(subcommand)]
    Folder(FolderCommand),

    /// Manage file filters
    #[command(subcommand)]
    Filter(FilterCommand),

    /// Bring the index up to date with the configured folders
    Index(IndexArgs),

    /// Search tags, file names or file contents
    Search(SearchArgs),

    /// Remove unused contexts and reclaim database space
    Compact,

    /// Drop every tag so the next index run re-tags all files
    Clear,

    /// Read or write stored preferences
    #[command(subcommand)]
    Pref(PrefCommand),

    /// Show row counts of the database
    Stats(JsonArgs),
}

#[derive(Subcommand)]
enum FolderCommand {
    /// Add a folder root
    Add { path: PathBuf },
    /// Remove a folder root and every file indexed under it
    Remove { path: PathBuf },
    /// List folder roots
    List(JsonArgs),
}

#[derive(Subcommand)]
enum FilterCommand {
    /// Add a file-name glob, e.g. "*.c"
    Add {
        pattern: String,
        /// Language hint recorded with the filter
        #[arg(long)]
        language: Option<String>,
    },
    /// Remove a filter
    Remove { pattern: String },
    /// List filters
    List(JsonArgs),
}

#[derive(Subcommand)]
enum PrefCommand {
    /// Print a preference value
    Get { name: String },
    /// Store a preference value
    Set { name: String, value: String },
}

#[derive(Args)]
struct JsonArgs {
    /// Output JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct IndexArgs {
    /// Output run statistics as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Tags,
    Files,
    Content,
}

impl From<ModeArg> for SearchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Tags => SearchMode::Tags,
            ModeArg::Files => SearchMode::Files,
            ModeArg::Content => SearchMode::Content,
        }
    }
}

#[derive(Args)]
struct SearchArgs {
    /// What to search
    #[arg(value_enum)]
    mode: ModeArg,

    /// Tag name, file name or regular expression
    text: String,

    /// Output the report as JSON
    #[arg(long)]
    json: bool,

    /// Stop after this many hits
    #[arg(short, long)]
    limit: Option<usize>,
}

/// Everything a subcommand needs: the loop, the store and the loaded configuration.
pub(crate) struct Context {
    pub scheduler: Scheduler,
    pub store: TagStore,
    pub config: IndexerConfig,
}

fn load_config(explicit: Option<&PathBuf>) -> Result<IndexerConfig> {
    match explicit {
        Some(path) => IndexerConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => {
            let cwd = std::env::current_dir().context("Failed to read working directory")?;
            IndexerConfig::discover(&cwd).context("Failed to load tagdex.toml")
        }
    }
}

fn open_context(cli: &Cli) -> Result<Context> {
    let config = load_config(cli.config.as_ref())?;
    let database = config.database_path(cli.db.as_deref());
    let scheduler = Scheduler::new();
    scheduler.set_error_handler(|err| log::error!("Background task failed: {err}"));
    let store = TagStore::open_with_capacity(&scheduler, &database, config.memo_capacity)
        .with_context(|| format!("Failed to open tag database {}", database.display()))?;
    Ok(Context {
        scheduler,
        store,
        config,
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    let ctx = open_context(&cli)?;

    match cli.command {
        Commands::Folder(FolderCommand::Add { path }) => commands::add_folder(&ctx, &path)?,
        Commands::Folder(FolderCommand::Remove { path }) => commands::remove_folder(&ctx, &path)?,
        Commands::Folder(FolderCommand::List(args)) => commands::list_folders(&ctx, args.json)?,
        Commands::Filter(FilterCommand::Add { pattern, language }) => {
            commands::add_filter(&ctx, &pattern, language.as_deref())?
        }
        Commands::Filter(FilterCommand::Remove { pattern }) => {
            commands::remove_filter(&ctx, &pattern)?
        }
        Commands::Filter(FilterCommand::List(args)) => commands::list_filters(&ctx, args.json)?,
        Commands::Index(args) => commands::index(&ctx, args.json)?,
        Commands::Search(args) => {
            commands::search(&ctx, args.mode.into(), &args.text, args.limit, args.json)?
        }
        Commands::Compact => commands::compact(&ctx)?,
        Commands::Clear => commands::clear(&ctx)?,
        Commands::Pref(PrefCommand::Get { name }) => commands::get_preference(&ctx, &name)?,
        Commands::Pref(PrefCommand::Set { name, value }) => {
            commands::set_preference(&ctx, &name, &value)?
        }
        Commands::Stats(args) => commands::stats(&ctx, args.json)?,
    }

    Ok(())
}
