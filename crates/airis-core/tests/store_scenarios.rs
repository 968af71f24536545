//! Local store scenarios: quota warnings, cascades and the summary cache

mod common;

use std::sync::Arc;

use airis_core::clock::{Clock, ManualClock};
use airis_core::config::Config;
use airis_core::quota::{ManualEstimator, QuotaMonitor, StorageEstimate};
use airis_core::{
    Book, BookFormat, Location, Note, PreferencesPatch, Store, StoreEvent, Summary, SummaryOptions,
};
use chrono::Duration;
use tempfile::TempDir;

use common::{at, count_topic, drain, open_store, EPOCH};

const MB: u64 = 1024 * 1024;

#[test]
fn crossing_the_quota_threshold_warns_once() {
    let clock = ManualClock::at_secs(EPOCH);
    let estimator = ManualEstimator::new(StorageEstimate::new(100 * MB, 40 * MB));
    let mut store = open_store(&clock, &estimator);
    let mut rx = store.subscribe();
    let mut monitor = QuotaMonitor::new(Arc::new(estimator.clone()), store.events().clone(), 0.9);

    store
        .put(Book::new("Large", BookFormat::Pdf).with_file("file:///large.pdf", MB))
        .unwrap();
    monitor.check();
    store
        .update_preferences(&PreferencesPatch::voice_rate(1.5))
        .unwrap();
    monitor.check();

    estimator.set(StorageEstimate::new(100 * MB, 95 * MB));
    monitor.check();
    monitor.check();

    let events = drain(&mut rx);
    assert_eq!(count_topic(&events, "book-added"), 1);
    assert_eq!(count_topic(&events, "preferences-updated"), 1);
    assert_eq!(count_topic(&events, "storage-quota-warning"), 1);
    assert!(monitor.is_above_threshold());

    let warning = events
        .iter()
        .find_map(|e| match e {
            StoreEvent::StorageQuotaWarning(estimate) => Some(*estimate),
            _ => None,
        })
        .unwrap();
    assert_eq!(warning.usage, Some(95 * MB));
}

#[test]
fn write_beyond_hard_quota_is_rejected() {
    let clock = ManualClock::at_secs(EPOCH);
    let estimator = ManualEstimator::new(StorageEstimate::new(MB, MB));
    let mut store = open_store(&clock, &estimator);
    let mut rx = store.subscribe();

    let err = store.put(Book::new("No room", BookFormat::Txt)).unwrap_err();
    assert!(err.is_quota_exceeded());
    assert!(store.list::<Book>(&Default::default()).unwrap().is_empty());

    let events = drain(&mut rx);
    assert_eq!(count_topic(&events, "storage-quota-warning"), 1);
    assert_eq!(count_topic(&events, "book-added"), 0);
}

#[test]
fn deleting_a_book_removes_everything_attached() {
    let clock = ManualClock::at_secs(EPOCH);
    let estimator = ManualEstimator::default();
    let mut store = open_store(&clock, &estimator);

    let book = store.put(Book::new("Lão Hạc", BookFormat::Epub)).unwrap();
    let other = store.put(Book::new("Other", BookFormat::Txt)).unwrap();
    store.put(Note::new(book.id, "one")).unwrap();
    store.put(Note::new(book.id, "two")).unwrap();
    let kept = store.put(Note::new(other.id, "kept")).unwrap();
    store.set_position(book.id, Location::at(100, 0.2)).unwrap();
    store
        .admit_summary(Summary::new(Summary::hash_content("chapter"), "tóm tắt").for_book(book.id))
        .unwrap();

    let mut rx = store.subscribe();
    store.delete::<Book>(book.id).unwrap();

    assert!(store.find::<Book>(book.id).unwrap().is_none());
    assert!(store.notes_for_book(book.id).unwrap().is_empty());
    assert!(store.latest_position(book.id).unwrap().is_none());
    assert_eq!(store.cache_stats().unwrap().entries, 0);
    assert!(store.find::<Note>(kept.id).unwrap().is_some());

    let events = drain(&mut rx);
    assert_eq!(count_topic(&events, "note-deleted"), 2);
    assert_eq!(count_topic(&events, "position-deleted"), 1);
    assert_eq!(events.last().map(|e| e.topic()), Some("book-deleted"));

    // only the book itself awaits sync as a deletion
    let pending = store.pending_changes(100).unwrap();
    let deletions: Vec<_> = pending.iter().filter(|c| c.is_deletion()).collect();
    assert_eq!(deletions.len(), 1);
    assert_eq!(deletions[0].id, book.id.to_string());
}

#[test]
fn expired_summary_is_a_miss_and_is_removed() {
    let clock = ManualClock::at_secs(EPOCH);
    let mut store = open_store(&clock, &ManualEstimator::default());

    let mut summary = Summary::new(Summary::hash_content("body"), "short");
    summary.created_at = clock.now();
    let summary = summary.expiring_at(at(EPOCH + 60));
    let hash = summary.content_hash.clone();
    store.admit_summary(summary).unwrap();

    let options = SummaryOptions::default();
    clock.advance_secs(60);
    assert!(store.lookup_summary(&hash, &options).unwrap().is_some());

    clock.advance_secs(1);
    assert!(store.lookup_summary(&hash, &options).unwrap().is_none());
    assert_eq!(store.cache_stats().unwrap().entries, 0);
    assert_eq!(store.cache_stats().unwrap().expired, 1);
}

#[test]
fn cache_never_exceeds_capacity() {
    let clock = ManualClock::at_secs(EPOCH);
    let mut config = Config::with_data_dir("/nonexistent/airis");
    config.cache.capacity = 3;
    let mut store = Store::builder(config)
        .clock(clock.clone())
        .estimator(ManualEstimator::default())
        .in_memory()
        .open()
        .unwrap();

    let mut hashes = Vec::new();
    for i in 0..5 {
        clock.advance_secs(1);
        let text = format!("chapter {i}");
        let mut summary = Summary::new(Summary::hash_content(&text), text.clone());
        summary.created_at = clock.now();
        hashes.push(summary.content_hash.clone());
        store.admit_summary(summary).unwrap();
        assert!(store.cache_stats().unwrap().entries <= 3);
    }

    let stats = store.cache_stats().unwrap();
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.evicted, 2);

    // the oldest entries expire soonest and were evicted first
    let options = SummaryOptions::default();
    assert!(store.lookup_summary(&hashes[0], &options).unwrap().is_none());
    assert!(store.lookup_summary(&hashes[1], &options).unwrap().is_none());
    assert!(store.lookup_summary(&hashes[4], &options).unwrap().is_some());
}

#[test]
fn expired_entries_are_evicted_before_live_ones() {
    let clock = ManualClock::at_secs(EPOCH);
    let mut config = Config::with_data_dir("/nonexistent/airis");
    config.cache.capacity = 2;
    let mut store = Store::builder(config)
        .clock(clock.clone())
        .estimator(ManualEstimator::default())
        .in_memory()
        .open()
        .unwrap();

    let mut short = Summary::new(Summary::hash_content("short"), "s");
    short.created_at = clock.now();
    let short = short.expiring_at(clock.now() + Duration::seconds(5));
    let mut long = Summary::new(Summary::hash_content("long"), "l");
    long.created_at = clock.now();
    let long_hash = long.content_hash.clone();
    store.admit_summary(short).unwrap();
    store.admit_summary(long).unwrap();

    clock.advance_secs(10);
    let mut fresh = Summary::new(Summary::hash_content("fresh"), "f");
    fresh.created_at = clock.now();
    let fresh_hash = fresh.content_hash.clone();
    store.admit_summary(fresh).unwrap();

    let options = SummaryOptions::default();
    assert!(store.lookup_summary(&long_hash, &options).unwrap().is_some());
    assert!(store.lookup_summary(&fresh_hash, &options).unwrap().is_some());
    assert_eq!(store.cache_stats().unwrap().evicted, 0);
    assert_eq!(store.cache_stats().unwrap().expired, 1);
}

#[test]
fn snapshot_moves_library_between_stores() {
    let dir = TempDir::new().unwrap();
    let source_config = Config::with_data_dir(dir.path().join("source"));
    let target_config = Config::with_data_dir(dir.path().join("target"));

    let snapshot = {
        let mut store = Store::open(source_config).unwrap();
        let book = store.put(Book::new("Exported", BookFormat::Epub)).unwrap();
        store.put(Note::new(book.id, "travels along")).unwrap();
        store.set_position(book.id, Location::at(5, 0.5)).unwrap();
        store.export_snapshot().unwrap()
    };
    let json = serde_json::to_string(&snapshot).unwrap();

    let mut target = Store::open(target_config).unwrap();
    let report = target.import_snapshot(serde_json::from_str(&json).unwrap()).unwrap();
    assert_eq!((report.books, report.notes, report.positions), (1, 1, 1));

    let books = target.search_books("export").unwrap();
    assert_eq!(books.len(), 1);
    assert_eq!(target.notes_for_book(books[0].id).unwrap().len(), 1);
    assert_eq!(target.pending_count().unwrap(), 4);
}
