//! Command handlers

pub mod book;
pub mod bookmark;
pub mod cache;
pub mod config;
pub mod note;
pub mod position;
pub mod prefs;
pub mod snapshot;
pub mod status;
pub mod sync;
pub mod watch;

use anyhow::{bail, Result};
use uuid::Uuid;

use airis_core::store::ListFilter;
use airis_core::{Book, Bookmark, Note, Store};

/// Resolve a book id given in full or as a unique prefix
pub fn parse_book_id(store: &Store, id: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return Ok(uuid);
    }

    let books: Vec<Book> = store.list(&ListFilter::default())?;
    let matches: Vec<_> = books
        .iter()
        .filter(|b| b.id.to_string().starts_with(id))
        .collect();

    match matches.len() {
        0 => bail!("No book found matching: {}", id),
        1 => Ok(matches[0].id),
        _ => {
            eprintln!("Multiple books match '{}':", id);
            for book in &matches {
                eprintln!("  {} - {}", book.id, book.title);
            }
            bail!("Ambiguous ID. Please provide more characters.");
        }
    }
}

/// Resolve a note id given in full or as a unique prefix
pub fn parse_note_id(store: &Store, id: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return Ok(uuid);
    }

    let notes: Vec<Note> = store.list(&ListFilter::default())?;
    let matches: Vec<_> = notes
        .iter()
        .filter(|n| n.id.to_string().starts_with(id))
        .collect();

    match matches.len() {
        0 => bail!("No note found matching: {}", id),
        1 => Ok(matches[0].id),
        _ => bail!("Ambiguous note ID '{}'. Please provide more characters.", id),
    }
}

/// Resolve a bookmark id given in full or as a unique prefix
pub fn parse_bookmark_id(store: &Store, id: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return Ok(uuid);
    }

    let bookmarks: Vec<Bookmark> = store.list(&ListFilter::default())?;
    let matches: Vec<_> = bookmarks
        .iter()
        .filter(|b| b.id.to_string().starts_with(id))
        .collect();

    match matches.len() {
        0 => bail!("No bookmark found matching: {}", id),
        1 => Ok(matches[0].id),
        _ => bail!("Ambiguous bookmark ID '{}'. Please provide more characters.", id),
    }
}
