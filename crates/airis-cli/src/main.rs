//! Airis CLI
//!
//! Command-line interface for the Airis offline reading library.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use airis_core::{Config, SharedStore, StorageError, Store, StoreError};

mod commands;
mod editor;
mod output;

use commands::book::AddBook;
use commands::bookmark::AddBookmark;
use commands::note::AddNote;
use commands::position::SetPosition;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "airis")]
#[command(about = "Airis - Offline-first reading library")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage books
    Book {
        #[command(subcommand)]
        command: BookCommands,
    },
    /// Manage notes
    Note {
        #[command(subcommand)]
        command: NoteCommands,
    },
    /// Manage bookmarks
    Bookmark {
        #[command(subcommand)]
        command: BookmarkCommands,
    },
    /// Save or show reading progress
    Position {
        #[command(subcommand)]
        command: PositionCommands,
    },
    /// Show or change preferences
    Prefs {
        #[command(subcommand)]
        command: Option<PrefsCommands>,
    },
    /// Inspect or clean the summary cache
    Cache {
        #[command(subcommand)]
        command: Option<CacheCommands>,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show storage and sync status
    Status,
    /// Sync with remote server
    Sync,
    /// Export the library as JSON
    Export {
        /// Output file (stdout if omitted)
        path: Option<PathBuf>,
    },
    /// Import a library exported with `airis export`
    Import {
        /// Snapshot file
        path: PathBuf,
    },
    /// Run background sync and print events until interrupted
    Watch,
}

#[derive(Subcommand)]
enum BookCommands {
    /// Add a book
    #[command(alias = "create")]
    Add {
        /// Book title
        title: String,
        /// Format (pdf, epub, txt); inferred from --file when omitted
        #[arg(short, long)]
        format: Option<String>,
        /// Author name
        #[arg(short, long)]
        author: Option<String>,
        /// Local file holding the book
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// List books
    #[command(alias = "ls")]
    List {
        /// Maximum number of books to show
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show book details (notes and progress included)
    Show {
        /// Book ID (full UUID or prefix)
        id: String,
    },
    /// Delete a book with its notes and progress
    #[command(alias = "rm")]
    Delete {
        /// Book ID (full UUID or prefix)
        id: String,
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Search books by title or author
    Search {
        /// Search query
        query: String,
    },
}

#[derive(Subcommand)]
enum NoteCommands {
    /// Add a note to a book
    #[command(alias = "create")]
    Add {
        /// Book ID (full UUID or prefix)
        book: String,
        /// Note content (opens editor if not provided)
        #[arg(short, long)]
        content: Option<String>,
        /// Tags to add
        #[arg(short, long)]
        tag: Vec<String>,
        /// Character offset the note refers to
        #[arg(long)]
        offset: Option<u64>,
        /// Progress (0.0 - 1.0) the note refers to
        #[arg(long)]
        percentage: Option<f64>,
    },
    /// List notes on a book
    #[command(alias = "ls")]
    List {
        /// Book ID (full UUID or prefix)
        book: String,
    },
    /// Delete a note
    #[command(alias = "rm")]
    Delete {
        /// Note ID (full UUID or prefix)
        id: String,
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Search note contents
    Search {
        /// Search query
        query: String,
        /// Only search notes on this book (full UUID or prefix)
        #[arg(short, long)]
        book: Option<String>,
    },
}

#[derive(Subcommand)]
enum BookmarkCommands {
    /// Bookmark a location in a book
    #[command(alias = "create")]
    Add {
        /// Book ID (full UUID or prefix)
        book: String,
        /// Bookmark name
        name: String,
        /// Character offset
        offset: u64,
        /// Progress (0.0 - 1.0)
        percentage: f64,
        #[arg(long)]
        chapter: Option<u32>,
    },
    /// List bookmarks in a book
    #[command(alias = "ls")]
    List {
        /// Book ID (full UUID or prefix)
        book: String,
    },
    /// Delete a bookmark
    #[command(alias = "rm")]
    Delete {
        /// Bookmark ID (full UUID or prefix)
        id: String,
    },
}

#[derive(Subcommand)]
enum PositionCommands {
    /// Save the reading position in a book
    Set {
        /// Book ID (full UUID or prefix)
        book: String,
        /// Character offset
        offset: u64,
        /// Progress (0.0 - 1.0)
        percentage: f64,
        #[arg(long)]
        chapter: Option<u32>,
        #[arg(long)]
        page: Option<u32>,
    },
    /// Show the latest reading position in a book
    Show {
        /// Book ID (full UUID or prefix)
        book: String,
    },
}

#[derive(Subcommand)]
enum PrefsCommands {
    /// Show preferences
    Show,
    /// Set a preference
    Set {
        /// Preference key (language, theme, voice.rate, voice.volume,
        /// voice.pitch, voice.id, summary.length, summary.style)
        key: String,
        /// Preference value
        value: String,
    },
    /// Restore default preferences
    Reset,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show cache statistics
    Stats,
    /// Remove expired summaries
    Sweep,
    /// Remove every cached summary
    Clear,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, sync_url, sync_enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            if let Some(hint) = recovery_hint(&e) {
                eprintln!("Hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Commands that don't need the store
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), &output);
    }

    let config = Config::load().context("Failed to load configuration")?;
    let mut store = Store::open(config.clone()).context("Failed to open local store")?;

    let is_write = matches!(
        &cli.command,
        Commands::Book {
            command: BookCommands::Add { .. } | BookCommands::Delete { .. }
        } | Commands::Note {
            command: NoteCommands::Add { .. } | NoteCommands::Delete { .. }
        } | Commands::Bookmark {
            command: BookmarkCommands::Add { .. } | BookmarkCommands::Delete { .. }
        } | Commands::Position {
            command: PositionCommands::Set { .. }
        } | Commands::Prefs {
            command: Some(PrefsCommands::Set { .. } | PrefsCommands::Reset)
        } | Commands::Import { .. }
    );

    let result = match cli.command {
        Commands::Book { command } => handle_book_command(command, &mut store, &output),
        Commands::Note { command } => handle_note_command(command, &mut store, &output),
        Commands::Bookmark { command } => handle_bookmark_command(command, &mut store, &output),
        Commands::Position { command } => handle_position_command(command, &mut store, &output),
        Commands::Prefs { command } => handle_prefs_command(command, &mut store, &output),
        Commands::Cache { command } => handle_cache_command(command, &mut store, &output),
        Commands::Config { .. } => unreachable!(), // Handled above
        Commands::Status => commands::status::show(&store, &output),
        Commands::Export { path } => commands::snapshot::export(&store, path, &output),
        Commands::Import { path } => commands::snapshot::import(&mut store, path, &output),
        Commands::Sync => {
            return commands::sync::sync(&store.into_shared(), &config, &output).await;
        }
        Commands::Watch => return commands::watch::run(store.into_shared(), &output).await,
    };

    // Push local writes right away when a server is configured
    if is_write && result.is_ok() {
        auto_sync(&store.into_shared(), &config, &output).await;
    }

    result
}

fn handle_book_command(command: BookCommands, store: &mut Store, output: &Output) -> Result<()> {
    match command {
        BookCommands::Add {
            title,
            format,
            author,
            file,
        } => commands::book::add(
            store,
            AddBook {
                title,
                format,
                author,
                file,
            },
            output,
        ),
        BookCommands::List { limit } => commands::book::list(store, limit, output),
        BookCommands::Show { id } => commands::book::show(store, id, output),
        BookCommands::Delete { id, yes } => commands::book::delete(store, id, yes, output),
        BookCommands::Search { query } => commands::book::search(store, query, output),
    }
}

fn handle_note_command(command: NoteCommands, store: &mut Store, output: &Output) -> Result<()> {
    match command {
        NoteCommands::Add {
            book,
            content,
            tag,
            offset,
            percentage,
        } => commands::note::add(
            store,
            AddNote {
                book,
                content,
                tags: tag,
                offset,
                percentage,
            },
            output,
        ),
        NoteCommands::List { book } => commands::note::list(store, book, output),
        NoteCommands::Delete { id, yes } => commands::note::delete(store, id, yes, output),
        NoteCommands::Search { query, book } => commands::note::search(store, query, book, output),
    }
}

fn handle_bookmark_command(
    command: BookmarkCommands,
    store: &mut Store,
    output: &Output,
) -> Result<()> {
    match command {
        BookmarkCommands::Add {
            book,
            name,
            offset,
            percentage,
            chapter,
        } => commands::bookmark::add(
            store,
            AddBookmark {
                book,
                name,
                offset,
                percentage,
                chapter,
            },
            output,
        ),
        BookmarkCommands::List { book } => commands::bookmark::list(store, book, output),
        BookmarkCommands::Delete { id } => commands::bookmark::delete(store, id, output),
    }
}

fn handle_position_command(
    command: PositionCommands,
    store: &mut Store,
    output: &Output,
) -> Result<()> {
    match command {
        PositionCommands::Set {
            book,
            offset,
            percentage,
            chapter,
            page,
        } => commands::position::set(
            store,
            SetPosition {
                book,
                offset,
                percentage,
                chapter,
                page,
            },
            output,
        ),
        PositionCommands::Show { book } => commands::position::show(store, book, output),
    }
}

fn handle_prefs_command(
    command: Option<PrefsCommands>,
    store: &mut Store,
    output: &Output,
) -> Result<()> {
    match command {
        Some(PrefsCommands::Show) | None => commands::prefs::show(store, output),
        Some(PrefsCommands::Set { key, value }) => commands::prefs::set(store, key, value, output),
        Some(PrefsCommands::Reset) => commands::prefs::reset(store, output),
    }
}

fn handle_cache_command(
    command: Option<CacheCommands>,
    store: &mut Store,
    output: &Output,
) -> Result<()> {
    match command {
        Some(CacheCommands::Stats) | None => commands::cache::stats(store, output),
        Some(CacheCommands::Sweep) => commands::cache::sweep(store, output),
        Some(CacheCommands::Clear) => commands::cache::clear(store, output),
    }
}

fn handle_config_command(command: Option<ConfigCommands>, output: &Output) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(output),
        Some(ConfigCommands::Set { key, value }) => commands::config::set(key, value, output),
    }
}

/// Log to stderr, only if AIRIS_LOG is set (e.g. `AIRIS_LOG=debug`)
fn init_logging() {
    let Ok(log_level) = std::env::var("AIRIS_LOG") else {
        return;
    };

    let env_filter = EnvFilter::new(format!("airis_core={},airis_cli={}", log_level, log_level));

    // Ignore the error if a subscriber is already installed
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Auto-sync if sync is enabled, silently handles errors
async fn auto_sync(store: &SharedStore, config: &Config, output: &Output) {
    if let Err(e) = commands::sync::sync_quiet(store, config).await {
        tracing::warn!(error = %e, "Auto-sync failed");
        if !output.is_quiet() {
            eprintln!("⚠ Auto-sync failed: {}", e);
        }
    }
}

/// Recovery advice for a failed command, taken from the first store error in the chain
fn recovery_hint(error: &anyhow::Error) -> Option<&'static str> {
    error.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            return e.recovery_suggestion();
        }
        cause
            .downcast_ref::<StorageError>()
            .and_then(StorageError::recovery_suggestion)
    })
}
