//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use airis_core::{Book, Bookmark, Note, ReadingPosition, UserPreferences};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any serializable value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to encode output: {}", e),
        }
    }

    /// Print a single book with its notes and reading progress
    pub fn print_book(&self, book: &Book, notes: &[Note], position: Option<&ReadingPosition>) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:       {}", book.id);
                println!("Title:    {}", book.title);
                if let Some(ref author) = book.author {
                    println!("Author:   {}", author);
                }
                println!("Format:   {}", book.format);
                if !book.file_url.is_empty() {
                    println!("File:     {} ({})", book.file_url, human_bytes(book.file_size));
                }
                if let Some(position) = position {
                    println!(
                        "Progress: {:.0}% (offset {})",
                        position.location.percentage * 100.0,
                        position.location.offset
                    );
                }
                println!("Added:    {}", book.created_at.format("%Y-%m-%d %H:%M"));
                println!("Updated:  {}", book.updated_at.format("%Y-%m-%d %H:%M"));

                if !notes.is_empty() {
                    println!();
                    println!("── Notes ({}) ──", notes.len());
                    for note in notes {
                        println!(
                            "[{}] {}",
                            note.created_at.format("%Y-%m-%d"),
                            truncate_line(&note.content, 60)
                        );
                    }
                }
            }
            OutputFormat::Json => {
                self.json(&serde_json::json!({
                    "book": book,
                    "notes": notes,
                    "position": position,
                }));
            }
            OutputFormat::Quiet => println!("{}", book.id),
        }
    }

    pub fn print_books(&self, books: &[Book]) {
        match self.format {
            OutputFormat::Human => {
                if books.is_empty() {
                    println!("No books found.");
                    return;
                }
                for book in books {
                    println!(
                        "{} | {} | {} | {}",
                        short_id(&book.id),
                        truncate(&book.title, 40),
                        book.format,
                        truncate(book.author.as_deref().unwrap_or("-"), 25)
                    );
                }
                println!("\n{} book(s)", books.len());
            }
            OutputFormat::Json => self.json(books),
            OutputFormat::Quiet => {
                for book in books {
                    println!("{}", book.id);
                }
            }
        }
    }

    pub fn print_notes(&self, notes: &[Note]) {
        match self.format {
            OutputFormat::Human => {
                if notes.is_empty() {
                    println!("No notes found.");
                    return;
                }
                for note in notes {
                    println!("────────────────────────────────────────");
                    println!(
                        "ID: {}  Book: {}  Created: {}",
                        short_id(&note.id),
                        short_id(&note.book_id),
                        note.created_at.format("%Y-%m-%d %H:%M")
                    );
                    if !note.tags.is_empty() {
                        println!("Tags: {}", note.tags.join(", "));
                    }
                    println!();
                    println!("{}", note.content);
                    println!();
                }
                println!("{} note(s)", notes.len());
            }
            OutputFormat::Json => self.json(notes),
            OutputFormat::Quiet => {
                for note in notes {
                    println!("{}", note.id);
                }
            }
        }
    }

    pub fn print_bookmarks(&self, bookmarks: &[Bookmark]) {
        match self.format {
            OutputFormat::Human => {
                if bookmarks.is_empty() {
                    println!("No bookmarks found.");
                    return;
                }
                for bookmark in bookmarks {
                    let chapter = bookmark
                        .location
                        .chapter
                        .map(|c| format!("ch. {c}, "))
                        .unwrap_or_default();
                    println!(
                        "{}  {:<30}  {}{:.1}%",
                        short_id(&bookmark.id),
                        truncate(&bookmark.name, 30),
                        chapter,
                        bookmark.location.percentage * 100.0
                    );
                }
            }
            OutputFormat::Json => self.json(bookmarks),
            OutputFormat::Quiet => {
                for bookmark in bookmarks {
                    println!("{}", bookmark.id);
                }
            }
        }
    }

    pub fn print_position(&self, position: &ReadingPosition) {
        match self.format {
            OutputFormat::Human => {
                println!("Book:     {}", position.book_id);
                println!("Offset:   {}", position.location.offset);
                println!("Progress: {:.1}%", position.location.percentage * 100.0);
                if let Some(chapter) = position.location.chapter {
                    println!("Chapter:  {}", chapter);
                }
                if let Some(page) = position.location.page {
                    println!("Page:     {}", page);
                }
                println!("Saved:    {}", position.timestamp.format("%Y-%m-%d %H:%M:%S"));
            }
            OutputFormat::Json => self.json(position),
            OutputFormat::Quiet => println!("{}", position.location.offset),
        }
    }

    pub fn print_preferences(&self, prefs: &UserPreferences) {
        match self.format {
            OutputFormat::Human => {
                println!("Preferences:");
                println!("  language:       {}", prefs.language.as_str());
                println!("  theme:          {:?}", prefs.theme);
                println!("  voice.rate:     {}", prefs.voice.rate);
                println!("  voice.volume:   {}", prefs.voice.volume);
                println!("  voice.pitch:    {}", prefs.voice.pitch);
                println!(
                    "  voice.id:       {}",
                    prefs.voice.voice_id.as_deref().unwrap_or("(default)")
                );
                println!("  summary.length: {}", prefs.ai.summary_length.as_str());
                println!("  summary.style:  {}", prefs.ai.summary_style.as_str());
            }
            OutputFormat::Json => self.json(prefs),
            OutputFormat::Quiet => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// First eight characters of an id
pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format a byte count with a binary unit
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Truncate to first line and max length
fn truncate_line(s: &str, max_len: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    truncate(first_line, max_len)
}
