//! Book command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use airis_core::store::ListFilter;
use airis_core::{Book, BookFormat, Note, Store};

use super::parse_book_id;
use crate::editor::confirm;
use crate::output::{short_id, Output};

/// Arguments for `book add`
pub struct AddBook {
    pub title: String,
    pub format: Option<String>,
    pub author: Option<String>,
    pub file: Option<PathBuf>,
}

/// Add a book to the library
///
/// With `--file`, the size is read from disk and the format defaults to the
/// file extension. A plain text file also becomes the book's text content.
pub fn add(store: &mut Store, args: AddBook, output: &Output) -> Result<()> {
    let format = match (&args.format, &args.file) {
        (Some(format), _) => format.parse::<BookFormat>()?,
        (None, Some(path)) => format_from_extension(path)?,
        (None, None) => bail!("Specify --format (pdf, epub, txt) or --file"),
    };

    let mut book = Book::new(args.title, format);
    if let Some(author) = args.author {
        book = book.with_author(author);
    }
    if let Some(ref path) = args.file {
        let path = path
            .canonicalize()
            .with_context(|| format!("Book file not found: {}", path.display()))?;
        let size = std::fs::metadata(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?
            .len();
        book = book.with_file(format!("file://{}", path.display()), size);

        if format == BookFormat::Txt {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            book = book.with_text(text);
        }
    }

    let book = store.put(book).context("Failed to add book")?;

    output.success(&format!("Added book: {}", book.id));
    output.print_book(&book, &[], None);
    Ok(())
}

pub fn list(store: &Store, limit: Option<usize>, output: &Output) -> Result<()> {
    let mut filter = ListFilter::default();
    if let Some(limit) = limit {
        filter = filter.limit(limit);
    }
    let books: Vec<Book> = store.list(&filter)?;
    output.print_books(&books);
    Ok(())
}

pub fn show(store: &Store, id: String, output: &Output) -> Result<()> {
    let book_id = parse_book_id(store, &id)?;
    let book: Book = store.get(book_id)?;
    let notes: Vec<Note> = store.notes_for_book(book_id)?;
    let position = store.latest_position(book_id)?;

    output.print_book(&book, &notes, position.as_ref());
    Ok(())
}

/// Delete a book along with its notes, positions and cached summaries
pub fn delete(store: &mut Store, id: String, yes: bool, output: &Output) -> Result<()> {
    let book_id = parse_book_id(store, &id)?;
    let book: Book = store.get(book_id)?;

    if !yes && output.should_prompt() {
        let notes = store.notes_for_book(book_id)?.len();
        println!(
            "Delete book: {} - {} ({} note(s))",
            short_id(&book.id),
            book.title,
            notes
        );
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    store.delete::<Book>(book_id).context("Failed to delete book")?;
    output.success(&format!("Deleted book: {}", book_id));
    Ok(())
}

pub fn search(store: &Store, query: String, output: &Output) -> Result<()> {
    let books = store.search_books(&query)?;
    output.print_books(&books);
    Ok(())
}

fn format_from_extension(path: &std::path::Path) -> Result<BookFormat> {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        bail!(
            "Cannot infer format of {}; pass --format",
            path.display()
        );
    };
    Ok(ext.parse::<BookFormat>()?)
}
