//! AI summary cache
//!
//! Summaries are admitted with a TTL and looked up by content hash and
//! generation options. Expired entries are never returned: a lookup that hits
//! one deletes it, and a background sweeper removes the rest on an interval.
//! When the cache grows past its capacity the [`EvictionPolicy`] picks the
//! entries to drop.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{StoreError, StoreResult};
use crate::models::{EntityKind, Summary, SummaryOptions};
use crate::storage::collections::{self as rows, from_micros, keys, to_micros, SummaryRow};
use crate::storage::StorageError;
use crate::store::{SharedStore, Store};

/// The eviction-relevant view of a cached summary
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Expired,
    Capacity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub key: String,
    pub reason: EvictionReason,
}

/// Decides which summaries leave an over-full cache
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    capacity: usize,
    ttl: chrono::Duration,
}

impl EvictionPolicy {
    pub fn new(capacity: usize, ttl: chrono::Duration) -> Self {
        Self { capacity, ttl }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Expiry for an entry admitted without one
    pub fn default_expiry(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at + self.ttl
    }

    /// Entries to evict so that the rest fit within capacity
    ///
    /// Nothing is evicted while the cache is within capacity. Otherwise every
    /// expired entry goes first (oldest `created_at` first), then live entries
    /// with the soonest `expires_at` until the cache fits. Entries that never
    /// expire are evicted last.
    pub fn select_victims(&self, entries: &[CacheEntry], now: DateTime<Utc>) -> Vec<Eviction> {
        if entries.len() <= self.capacity {
            return Vec::new();
        }

        let (mut expired, mut live): (Vec<&CacheEntry>, Vec<&CacheEntry>) =
            entries.iter().partition(|e| e.is_expired(now));

        expired.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        let mut victims: Vec<Eviction> = expired
            .into_iter()
            .map(|e| Eviction {
                key: e.key.clone(),
                reason: EvictionReason::Expired,
            })
            .collect();

        let overflow = live.len().saturating_sub(self.capacity);
        if overflow > 0 {
            live.sort_by(|a, b| {
                let expiry = match (a.expires_at, b.expires_at) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                expiry
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.key.cmp(&b.key))
            });
            victims.extend(live.into_iter().take(overflow).map(|e| Eviction {
                key: e.key.clone(),
                reason: EvictionReason::Capacity,
            }));
        }

        victims
    }
}

/// Cache occupancy and lifetime counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    /// Entries dropped to stay within capacity
    pub evicted: u64,
    /// Entries dropped because they expired
    pub expired: u64,
}

impl SummaryRow {
    fn entry(&self) -> CacheEntry {
        CacheEntry {
            key: self.cache_key.clone(),
            created_at: from_micros(self.created_at),
            expires_at: self.expires_at.map(from_micros),
        }
    }
}

fn decode_summary(row: &SummaryRow) -> StoreResult<Summary> {
    serde_json::from_str(&row.payload).map_err(|e| {
        StoreError::Storage(StorageError::CorruptRecord {
            collection: "summaries",
            id: row.cache_key.clone(),
            details: e.to_string(),
        })
    })
}

/// Insert a summary and evict what no longer fits, in one transaction
fn insert_and_evict(
    conn: &mut Connection,
    row: &SummaryRow,
    policy: &EvictionPolicy,
    now: DateTime<Utc>,
) -> rusqlite::Result<Vec<Eviction>> {
    let tx = conn.transaction()?;
    rows::put_summary(&tx, row)?;

    let entries: Vec<CacheEntry> = rows::all_summaries(&tx)?
        .iter()
        .map(SummaryRow::entry)
        .collect();
    let victims = policy.select_victims(&entries, now);

    let mut expired = 0;
    let mut evicted = 0;
    for victim in &victims {
        rows::delete_summary(&tx, &victim.key)?;
        match victim.reason {
            EvictionReason::Expired => expired += 1,
            EvictionReason::Capacity => evicted += 1,
        }
    }
    if expired > 0 {
        rows::add_meta_i64(&tx, keys::CACHE_EXPIRED, expired)?;
    }
    if evicted > 0 {
        rows::add_meta_i64(&tx, keys::CACHE_EVICTED, evicted)?;
    }

    tx.commit()?;
    Ok(victims)
}

impl Store {
    /// Insert a summary into the cache
    ///
    /// `created_at` is stamped from the store clock and a summary without an
    /// expiry gets the configured TTL from that moment. Cached summaries
    /// are immutable: admitting a key that already holds a live entry keeps
    /// the existing one and returns it.
    pub fn admit_summary(&mut self, mut summary: Summary) -> StoreResult<Summary> {
        summary
            .validate()
            .map_err(|e| StoreError::validation(EntityKind::Summary, e))?;

        let now = self.now();
        let key = summary.cache_key();
        if let Some(existing) = rows::get_summary(self.db.connection(), &key)? {
            let existing = decode_summary(&existing)?;
            if !existing.is_expired(now) {
                return Ok(existing);
            }
        }

        summary.created_at = now;
        if summary.expires_at.is_none() {
            summary.expires_at = Some(self.policy.default_expiry(now));
        }

        let payload = serde_json::to_string(&summary).map_err(|source| StoreError::Serialization {
            kind: EntityKind::Summary,
            source,
        })?;
        self.check_quota(payload.len() as u64)?;

        let row = SummaryRow {
            cache_key: key,
            content_hash: summary.content_hash.clone(),
            book_id: summary.book_id.map(|id| id.to_string()),
            created_at: to_micros(summary.created_at),
            expires_at: summary.expires_at.map(to_micros),
            payload,
        };
        let outcome = insert_and_evict(self.db.connection_mut(), &row, &self.policy, now);
        let victims = outcome.map_err(|e| self.storage_failure(e))?;

        if !victims.is_empty() {
            tracing::debug!(count = victims.len(), "Evicted cached summaries");
        }
        Ok(summary)
    }

    /// Find a live summary for `content_hash` generated with `options`
    ///
    /// An expired entry is a miss and is deleted.
    pub fn lookup_summary(
        &mut self,
        content_hash: &str,
        options: &SummaryOptions,
    ) -> StoreResult<Option<Summary>> {
        let key = options.cache_key(content_hash);
        let Some(row) = rows::get_summary(self.db.connection(), &key)? else {
            return Ok(None);
        };

        let summary = decode_summary(&row)?;
        if summary.is_expired(self.now()) {
            let conn = self.db.connection();
            rows::delete_summary(conn, &key)?;
            rows::add_meta_i64(conn, keys::CACHE_EXPIRED, 1)?;
            tracing::debug!(key = %key, "Dropped expired summary on lookup");
            return Ok(None);
        }
        Ok(Some(summary))
    }

    /// Remove every expired summary, returning how many were removed
    pub fn sweep_expired_summaries(&mut self) -> StoreResult<usize> {
        let now = to_micros(self.now());
        let conn = self.db.connection();
        let removed = rows::delete_expired_summaries(conn, now)?;
        if removed > 0 {
            rows::add_meta_i64(conn, keys::CACHE_EXPIRED, removed as i64)?;
            tracing::debug!(removed, "Swept expired summaries");
        }
        Ok(removed)
    }

    /// Drop every cached summary
    pub fn clear_summaries(&mut self) -> StoreResult<usize> {
        Ok(rows::clear_summaries(self.db.connection())?)
    }

    pub fn cache_stats(&self) -> StoreResult<CacheStats> {
        let conn = self.db.connection();
        Ok(CacheStats {
            entries: rows::count_summaries(conn)?,
            capacity: self.policy.capacity(),
            evicted: rows::get_meta_i64(conn, keys::CACHE_EVICTED)? as u64,
            expired: rows::get_meta_i64(conn, keys::CACHE_EXPIRED)? as u64,
        })
    }
}

/// Handle to the background sweeper
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// Sweep expired summaries every `interval`
pub fn spawn_sweeper(store: SharedStore, interval: Duration) -> SweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = store.lock().await.sweep_expired_summaries() {
                        tracing::warn!(error = %e, "Summary sweep failed");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });

    SweeperHandle { shutdown_tx, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::Config;
    use crate::models::SummaryLength;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn entry(key: &str, created: i64, expires: Option<i64>) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            created_at: at(created),
            expires_at: expires.map(at),
        }
    }

    fn keys_of(victims: &[Eviction]) -> Vec<&str> {
        victims.iter().map(|v| v.key.as_str()).collect()
    }

    fn policy(capacity: usize) -> EvictionPolicy {
        EvictionPolicy::new(capacity, chrono::Duration::hours(24))
    }

    #[test]
    fn test_no_eviction_within_capacity() {
        let entries = vec![entry("a", 0, Some(10)), entry("b", 0, Some(20))];
        assert!(policy(2).select_victims(&entries, at(100)).is_empty());
    }

    #[test]
    fn test_expired_evicted_first_oldest_created_first() {
        let entries = vec![
            entry("live", 0, Some(1000)),
            entry("expired-new", 50, Some(60)),
            entry("expired-old", 10, Some(70)),
        ];
        let victims = policy(2).select_victims(&entries, at(100));
        assert_eq!(keys_of(&victims), vec!["expired-old", "expired-new"]);
        assert!(victims.iter().all(|v| v.reason == EvictionReason::Expired));
    }

    #[test]
    fn test_soonest_expiry_evicted_when_nothing_expired() {
        let entries = vec![
            entry("later", 0, Some(500)),
            entry("forever", 0, None),
            entry("soon", 5, Some(200)),
        ];
        let victims = policy(2).select_victims(&entries, at(100));
        assert_eq!(keys_of(&victims), vec!["soon"]);
        assert_eq!(victims[0].reason, EvictionReason::Capacity);

        let victims = policy(1).select_victims(&entries, at(100));
        assert_eq!(keys_of(&victims), vec!["soon", "later"]);
    }

    #[test]
    fn test_expiry_ties_broken_by_oldest_created() {
        let entries = vec![entry("newer", 20, Some(500)), entry("older", 10, Some(500))];
        let victims = policy(1).select_victims(&entries, at(100));
        assert_eq!(keys_of(&victims), vec!["older"]);
    }

    #[test]
    fn test_expired_then_capacity() {
        let entries = vec![
            entry("gone", 0, Some(50)),
            entry("a", 0, Some(300)),
            entry("b", 0, Some(200)),
            entry("c", 0, Some(400)),
        ];
        let victims = policy(2).select_victims(&entries, at(100));
        assert_eq!(keys_of(&victims), vec!["gone", "b"]);
    }

    fn store_with(clock: &ManualClock, capacity: usize) -> Store {
        let mut config = Config::with_data_dir("/nonexistent/airis");
        config.cache.capacity = capacity;
        Store::builder(config)
            .clock(clock.clone())
            .in_memory()
            .open()
            .unwrap()
    }

    fn summary(clock: &ManualClock, text: &str) -> Summary {
        let mut summary = Summary::new(Summary::hash_content(text), format!("summary of {text}"));
        summary.created_at = clock.now();
        summary
    }

    #[test]
    fn test_admit_applies_default_ttl() {
        let clock = ManualClock::at_secs(1_000);
        let mut store = store_with(&clock, 10);

        let admitted = store.admit_summary(summary(&clock, "chapter one")).unwrap();
        assert_eq!(
            admitted.expires_at,
            Some(clock.now() + chrono::Duration::hours(24))
        );
    }

    #[test]
    fn test_admit_stamps_creation_with_store_clock() {
        let clock = ManualClock::at_secs(5_000);
        let mut store = store_with(&clock, 10);

        let mut stale = Summary::new(Summary::hash_content("prologue"), "summary".to_string());
        stale.created_at = at(10);
        let admitted = store.admit_summary(stale).unwrap();

        assert_eq!(admitted.created_at, clock.now());
        assert_eq!(
            admitted.expires_at,
            Some(clock.now() + chrono::Duration::hours(24))
        );
    }

    #[test]
    fn test_lookup_hits_and_lazily_expires() {
        let clock = ManualClock::at_secs(1_000);
        let mut store = store_with(&clock, 10);

        let s = summary(&clock, "chapter one").expiring_at(at(1_010));
        let hash = s.content_hash.clone();
        store.admit_summary(s).unwrap();

        let options = SummaryOptions::default();
        assert!(store.lookup_summary(&hash, &options).unwrap().is_some());

        clock.set(at(1_011));
        assert!(store.lookup_summary(&hash, &options).unwrap().is_none());

        let stats = store.cache_stats().unwrap();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.expired, 1);
    }

    #[test]
    fn test_lookup_respects_options() {
        let clock = ManualClock::at_secs(1_000);
        let mut store = store_with(&clock, 10);

        let s = summary(&clock, "chapter one");
        let hash = s.content_hash.clone();
        store.admit_summary(s).unwrap();

        let short = SummaryOptions {
            length: SummaryLength::Short,
            ..SummaryOptions::default()
        };
        assert!(store.lookup_summary(&hash, &short).unwrap().is_none());
    }

    #[test]
    fn test_admitted_summaries_are_immutable() {
        let clock = ManualClock::at_secs(1_000);
        let mut store = store_with(&clock, 10);

        let first = summary(&clock, "text");
        store.admit_summary(first.clone()).unwrap();

        let mut second = summary(&clock, "text");
        second.summary = "rewritten".to_string();
        let kept = store.admit_summary(second).unwrap();
        assert_eq!(kept.summary, first.summary);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let clock = ManualClock::at_secs(1_000);
        let mut store = store_with(&clock, 3);

        for i in 0..10 {
            clock.advance_secs(1);
            store
                .admit_summary(summary(&clock, &format!("text {i}")))
                .unwrap();
            assert!(store.cache_stats().unwrap().entries <= 3);
        }

        let stats = store.cache_stats().unwrap();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.evicted, 7);
    }

    #[test]
    fn test_sweep_removes_expired_only() {
        let clock = ManualClock::at_secs(1_000);
        let mut store = store_with(&clock, 10);

        store
            .admit_summary(summary(&clock, "short-lived").expiring_at(at(1_005)))
            .unwrap();
        store.admit_summary(summary(&clock, "long-lived")).unwrap();

        clock.set(at(1_006));
        assert_eq!(store.sweep_expired_summaries().unwrap(), 1);
        assert_eq!(store.cache_stats().unwrap().entries, 1);
        assert_eq!(store.sweep_expired_summaries().unwrap(), 0);
    }

    #[test]
    fn test_clear_summaries() {
        let clock = ManualClock::at_secs(1_000);
        let mut store = store_with(&clock, 10);
        store.admit_summary(summary(&clock, "a")).unwrap();
        store.admit_summary(summary(&clock, "b")).unwrap();

        assert_eq!(store.clear_summaries().unwrap(), 2);
        assert_eq!(store.cache_stats().unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_background_sweeper() {
        let clock = ManualClock::at_secs(1_000);
        let mut store = store_with(&clock, 10);
        store
            .admit_summary(summary(&clock, "stale").expiring_at(at(1_001)))
            .unwrap();
        clock.set(at(2_000));

        let shared = store.into_shared();
        let handle = spawn_sweeper(shared.clone(), Duration::from_millis(10));

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if shared.lock().await.cache_stats().unwrap().entries == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.shutdown().await;
        assert_eq!(Arc::strong_count(&shared), 1);
    }
}
