//! Note command handlers
//!
//! Notes belong to a book and may be pinned to a location in it.

use anyhow::{bail, Context, Result};

use airis_core::{Book, Location, Note, Store};

use super::{parse_book_id, parse_note_id};
use crate::editor::{confirm, edit_text};
use crate::output::{short_id, Output};

/// Arguments for `note add`
pub struct AddNote {
    pub book: String,
    pub content: Option<String>,
    pub tags: Vec<String>,
    pub offset: Option<u64>,
    pub percentage: Option<f64>,
}

pub fn add(store: &mut Store, args: AddNote, output: &Output) -> Result<()> {
    let book_id = parse_book_id(store, &args.book)?;
    let book: Book = store.get(book_id)?;

    let content = match args.content {
        Some(content) => content,
        None => {
            let initial = format!("<!-- Note for: {} -->\n\n", book.title);
            edit_text(&initial).context("Failed to edit note")?
        }
    };
    if content.trim().is_empty() {
        bail!("Note content cannot be empty");
    }

    let mut note = Note::new(book_id, content);
    for tag in args.tags {
        note.add_tag(tag);
    }
    if let Some(offset) = args.offset {
        note = note.at(Location::at(offset, args.percentage.unwrap_or(0.0)));
    }

    let note = store.put(note).context("Failed to add note")?;
    output.success(&format!(
        "Added note {} to book {}",
        short_id(&note.id),
        short_id(&book_id)
    ));
    Ok(())
}

pub fn list(store: &Store, book: String, output: &Output) -> Result<()> {
    let book_id = parse_book_id(store, &book)?;
    let notes = store.notes_for_book(book_id)?;
    output.print_notes(&notes);
    Ok(())
}

pub fn delete(store: &mut Store, id: String, yes: bool, output: &Output) -> Result<()> {
    let note_id = parse_note_id(store, &id)?;
    let note: Note = store.get(note_id)?;

    if !yes && output.should_prompt() {
        println!("Delete note: {}", short_id(&note.id));
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    store.delete::<Note>(note_id).context("Failed to delete note")?;
    output.success(&format!("Deleted note: {}", note_id));
    Ok(())
}

pub fn search(store: &Store, query: String, book: Option<String>, output: &Output) -> Result<()> {
    let book_id = book.map(|b| parse_book_id(store, &b)).transpose()?;
    let notes = store.search_notes(&query, book_id)?;
    output.print_notes(&notes);
    Ok(())
}
