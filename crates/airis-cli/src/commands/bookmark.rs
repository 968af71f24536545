//! Bookmark command handlers

use anyhow::{Context, Result};

use airis_core::{Bookmark, Location, Store};

use super::{parse_book_id, parse_bookmark_id};
use crate::output::{short_id, Output};

/// Arguments for `bookmark add`
pub struct AddBookmark {
    pub book: String,
    pub name: String,
    pub offset: u64,
    pub percentage: f64,
    pub chapter: Option<u32>,
}

pub fn add(store: &mut Store, args: AddBookmark, output: &Output) -> Result<()> {
    let book_id = parse_book_id(store, &args.book)?;
    let location = Location {
        chapter: args.chapter,
        ..Location::at(args.offset, args.percentage)
    };

    let bookmark = store
        .add_bookmark(book_id, &args.name, location)
        .context("Failed to add bookmark")?;
    output.success(&format!(
        "Added bookmark {} to book {}",
        short_id(&bookmark.id),
        short_id(&book_id)
    ));
    Ok(())
}

pub fn list(store: &Store, book: String, output: &Output) -> Result<()> {
    let book_id = parse_book_id(store, &book)?;
    let bookmarks = store.bookmarks_for_book(book_id)?;
    output.print_bookmarks(&bookmarks);
    Ok(())
}

pub fn delete(store: &mut Store, id: String, output: &Output) -> Result<()> {
    let bookmark_id = parse_bookmark_id(store, &id)?;
    store
        .delete::<Bookmark>(bookmark_id)
        .context("Failed to delete bookmark")?;
    output.success(&format!("Deleted bookmark: {}", bookmark_id));
    Ok(())
}
