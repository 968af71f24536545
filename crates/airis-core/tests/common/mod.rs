//! Shared fixtures for the scenario tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use airis_core::clock::ManualClock;
use airis_core::config::{Config, TimeoutSettings};
use airis_core::quota::ManualEstimator;
use airis_core::sync::{
    PushAck, RemoteApi, RemoteChanges, RemoteError, RetryPolicy, SyncEngine, SyncRecord,
};
use airis_core::{SharedStore, Store, StoreEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedReceiver;

pub const EPOCH: i64 = 1_700_000_000;

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

#[derive(Default)]
pub struct ServerState {
    /// Latest version per (kind, id) with the server time it was stored at
    pub records: HashMap<(String, String), (DateTime<Utc>, SyncRecord)>,
    pub ticks: i64,
    /// Remote calls that fail with a network error before succeeding again
    pub failures: u32,
    pub fetches: u32,
    pub pushes: u32,
}

/// An in-process sync server shared by several devices
///
/// Keeps the newest version of every record; an older push is answered
/// with a conflict carrying the stored version.
#[derive(Default)]
pub struct MemoryServer(Mutex<ServerState>);

impl MemoryServer {
    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.0.lock().unwrap()
    }

    pub fn fail_next(&self, calls: u32) {
        self.state().failures = calls;
    }

    pub fn stored(&self, record: &SyncRecord) -> Option<SyncRecord> {
        let key = (record.kind().to_string(), record.id());
        self.state().records.get(&key).map(|(_, r)| r.clone())
    }

    pub fn seed(&self, record: SyncRecord) {
        let mut state = self.state();
        let now = state.tick();
        state
            .records
            .insert((record.kind().to_string(), record.id()), (now, record));
    }
}

impl ServerState {
    fn tick(&mut self) -> DateTime<Utc> {
        self.ticks += 1;
        at(2 * EPOCH + self.ticks)
    }

    fn now(&self) -> DateTime<Utc> {
        at(2 * EPOCH + self.ticks)
    }

    fn take_failure(&mut self) -> Result<(), RemoteError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(RemoteError::Network("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for MemoryServer {
    async fn fetch_changes(&self, since: Option<DateTime<Utc>>) -> Result<RemoteChanges, RemoteError> {
        let mut state = self.state();
        state.fetches += 1;
        state.take_failure()?;

        let records = state
            .records
            .values()
            .filter(|(stored_at, _)| since.map_or(true, |since| *stored_at > since))
            .map(|(_, record)| record.clone())
            .collect();
        Ok(RemoteChanges {
            records,
            server_time: state.now(),
        })
    }

    async fn push_changes(&self, changes: &[SyncRecord]) -> Result<Vec<PushAck>, RemoteError> {
        let mut state = self.state();
        state.pushes += 1;
        state.take_failure()?;

        let mut acks = Vec::with_capacity(changes.len());
        for record in changes {
            let key = (record.kind().to_string(), record.id());
            if let Some((_, existing)) = state.records.get(&key) {
                if existing.updated_at() > record.updated_at() {
                    acks.push(PushAck::conflict(existing.clone()));
                    continue;
                }
            }
            let stored_at = state.tick();
            state.records.insert(key, (stored_at, record.clone()));
            acks.push(PushAck::committed(record.kind(), record.id()));
        }
        Ok(acks)
    }
}

/// One client: a store, its clock and a sync engine against `server`
pub struct Device {
    pub store: SharedStore,
    pub clock: ManualClock,
    pub estimator: ManualEstimator,
    pub engine: SyncEngine,
    pub events: UnboundedReceiver<StoreEvent>,
}

pub fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(50),
        multiplier: 2.0,
        timeouts: TimeoutSettings::default(),
    }
}

pub fn open_store(clock: &ManualClock, estimator: &ManualEstimator) -> Store {
    Store::builder(Config::with_data_dir("/nonexistent/airis"))
        .clock(clock.clone())
        .estimator(estimator.clone())
        .in_memory()
        .open()
        .unwrap()
}

pub async fn device(server: &Arc<MemoryServer>, now: i64) -> Device {
    let clock = ManualClock::at_secs(now);
    let estimator = ManualEstimator::default();
    let store = open_store(&clock, &estimator);
    let events = store.subscribe();
    let store = store.into_shared();
    let engine = SyncEngine::new(store.clone(), server.clone())
        .await
        .with_policy(fast_retries());

    Device {
        store,
        clock,
        estimator,
        engine,
        events,
    }
}

/// Every event received so far
pub fn drain(rx: &mut UnboundedReceiver<StoreEvent>) -> Vec<StoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn count_topic(events: &[StoreEvent], topic: &str) -> usize {
    events.iter().filter(|e| e.topic() == topic).count()
}
