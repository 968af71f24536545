//! Reading position command handlers

use anyhow::{Context, Result};

use airis_core::{Location, Store};

use super::parse_book_id;
use crate::output::Output;

/// Arguments for `position set`
pub struct SetPosition {
    pub book: String,
    pub offset: u64,
    pub percentage: f64,
    pub chapter: Option<u32>,
    pub page: Option<u32>,
}

pub fn set(store: &mut Store, args: SetPosition, output: &Output) -> Result<()> {
    let book_id = parse_book_id(store, &args.book)?;
    let location = Location {
        chapter: args.chapter,
        page: args.page,
        ..Location::at(args.offset, args.percentage)
    };

    let position = store
        .set_position(book_id, location)
        .context("Failed to save reading position")?;
    output.success("Reading position saved");
    output.print_position(&position);
    Ok(())
}

pub fn show(store: &Store, book: String, output: &Output) -> Result<()> {
    let book_id = parse_book_id(store, &book)?;
    match store.latest_position(book_id)? {
        Some(position) => output.print_position(&position),
        None => output.message("No reading position saved for this book."),
    }
    Ok(())
}
