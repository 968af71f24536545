//! Long-running mode: background sync, quota monitoring and cache sweeping
//!
//! Prints every store event until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};

use airis_core::quota::QuotaMonitor;
use airis_core::sync::spawn_sync_task;
use airis_core::{spawn_sweeper, SharedStore, StoreEvent};

use crate::output::{human_bytes, Output, OutputFormat};

pub async fn run(store: SharedStore, output: &Output) -> Result<()> {
    let (config, estimator, events, mut rx) = {
        let store = store.lock().await;
        (
            store.config().clone(),
            store.estimator(),
            store.events().clone(),
            store.subscribe(),
        )
    };

    let quota = QuotaMonitor::new(estimator, events, config.quota.warning_threshold)
        .spawn(config.quota.check_interval());
    let sweeper = spawn_sweeper(store.clone(), config.cache.sweep_interval());

    let sync = if config.sync_enabled && config.sync_url.is_some() {
        let engine = super::sync::engine(&store, &config).await?;
        Some(spawn_sync_task(Arc::new(engine), config.sync.interval()))
    } else {
        output.message("Sync not configured, watching local changes only");
        None
    };

    output.message("Watching for changes (Ctrl-C to stop)...");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                print_event(&event, output);
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    if let Some(sync) = sync {
        sync.shutdown().await;
    }
    sweeper.shutdown().await;
    quota.shutdown().await;
    output.message("Stopped");

    Ok(())
}

fn print_event(event: &StoreEvent, output: &Output) {
    match output.format {
        OutputFormat::Json => match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Failed to encode event: {}", e),
        },
        OutputFormat::Quiet => {}
        OutputFormat::Human => println!("{}", describe(event)),
    }
}

fn describe(event: &StoreEvent) -> String {
    let topic = event.topic();
    match event {
        StoreEvent::BookAdded(book) | StoreEvent::BookUpdated(book) => {
            format!("{topic}: {}", book.title)
        }
        StoreEvent::BookDeleted { id } => format!("{topic}: {id}"),
        StoreEvent::NoteAdded(note) | StoreEvent::NoteUpdated(note) => {
            format!("{topic}: {} (book {})", note.id, note.book_id)
        }
        StoreEvent::BookmarkAdded(bookmark) | StoreEvent::BookmarkUpdated(bookmark) => {
            format!("{topic}: {} (book {})", bookmark.name, bookmark.book_id)
        }
        StoreEvent::NoteDeleted { id, .. }
        | StoreEvent::PositionDeleted { id, .. }
        | StoreEvent::BookmarkDeleted { id, .. } => format!("{topic}: {id}"),
        StoreEvent::PositionUpdated(position) => format!(
            "{topic}: book {} at {:.1}%",
            position.book_id,
            position.location.percentage * 100.0
        ),
        StoreEvent::PreferencesUpdated(_) | StoreEvent::SyncStarted => topic.to_string(),
        StoreEvent::StorageQuotaWarning(estimate) => match (estimate.usage, estimate.quota) {
            (Some(usage), Some(quota)) => format!(
                "⚠ {topic}: {} of {} used",
                human_bytes(usage),
                human_bytes(quota)
            ),
            _ => format!("⚠ {topic}"),
        },
        StoreEvent::StorageError { message } | StoreEvent::SyncFailed { message } => {
            format!("✗ {topic}: {message}")
        }
        StoreEvent::SyncSucceeded {
            pulled,
            pushed,
            conflicts,
        } => format!("✓ {topic}: pulled {pulled}, pushed {pushed}, {conflicts} conflict(s)"),
    }
}
