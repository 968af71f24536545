//! Sync engine
//!
//! One cycle pulls remote changes since the persisted watermark, resolves
//! them last-write-wins against the local rows, then pushes pending local
//! changes and confirms whatever the remote acknowledged. The store lock is
//! only taken for short synchronous sections, never across a remote call.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::events::{EventBus, StoreEvent};
use crate::models::{Book, Bookmark, EntityKind, Note, ReadingPosition, Record};
use crate::store::{PendingChange, SharedStore, Store};

use super::remote::{AckStatus, PushAck, RemoteApi, RemoteError, SyncRecord};
use super::resolve::{resolve, Resolution};
use super::retry::{OperationClass, RetryPolicy};

/// Observable state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Syncing,
    Success,
    PartialFailure,
    Failure,
}

/// Counters for one sync run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Remote records applied locally
    pub pulled: usize,
    /// Local changes the remote committed
    pub pushed: usize,
    /// Push conflicts resolved in favour of the remote
    pub conflicts: usize,
    /// Push conflicts where the local version won; re-sent next cycle
    pub kept_local: usize,
    /// Remote records rejected by local validation
    pub skipped: usize,
    /// Pushed changes the remote did not acknowledge
    pub unacknowledged: usize,
    pub cycles: usize,
}

impl SyncReport {
    fn absorb(&mut self, other: &SyncReport) {
        self.pulled += other.pulled;
        self.pushed += other.pushed;
        self.conflicts += other.conflicts;
        self.kept_local += other.kept_local;
        self.skipped += other.skipped;
        self.unacknowledged += other.unacknowledged;
        self.cycles += other.cycles;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Everything pushed was acknowledged; the watermark advanced
    Success(SyncReport),
    /// Some pushed changes were not acknowledged; the watermark is unchanged
    PartialFailure(SyncReport),
    /// A cycle was already running
    Skipped,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Success(report) | SyncOutcome::PartialFailure(report) => Some(report),
            SyncOutcome::Skipped => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    /// Network, server or timeout failure that outlasted every retry
    #[error("Sync failed after retries: {0}")]
    Transient(RemoteError),

    /// The remote refused the exchange; not retried
    #[error("Sync rejected by remote: {0}")]
    Rejected(RemoteError),

    #[error("Local store failed during sync: {0}")]
    Store(#[from] StoreError),

    #[error("Sync cancelled")]
    Cancelled,
}

impl From<RemoteError> for SyncError {
    fn from(error: RemoteError) -> Self {
        if error.is_transient() {
            SyncError::Transient(error)
        } else {
            SyncError::Rejected(error)
        }
    }
}

impl SyncError {
    fn is_remote(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::Rejected(_))
    }
}

/// Result of a single cycle
struct Cycle {
    report: SyncReport,
    /// A full batch was pushed, so more changes may be waiting
    batch_full: bool,
}

/// Drives synchronization between a [`SharedStore`] and a [`RemoteApi`]
pub struct SyncEngine {
    store: SharedStore,
    remote: Arc<dyn RemoteApi>,
    events: Arc<EventBus>,
    policy: RetryPolicy,
    batch_size: usize,
    running: AtomicBool,
    cancelled: AtomicBool,
    phase: watch::Sender<SyncPhase>,
}

impl SyncEngine {
    /// Build an engine using the store's retry, timeout and batch settings
    pub async fn new(store: SharedStore, remote: Arc<dyn RemoteApi>) -> Self {
        let (policy, batch_size, events) = {
            let guard = store.lock().await;
            let config = guard.config();
            (
                RetryPolicy::new(&config.retry, &config.timeouts),
                config.sync.batch_size.max(1),
                guard.events().clone(),
            )
        };
        let (phase, _) = watch::channel(SyncPhase::Idle);

        Self {
            store,
            remote,
            events,
            policy,
            batch_size,
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            phase,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Watch the engine's phase
    pub fn phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the running cycle at its next section boundary
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Run a sync now
    ///
    /// Returns [`SyncOutcome::Skipped`] when a sync is already in progress.
    /// A full batch triggers follow-up cycles until the pending changes are
    /// drained or a cycle confirms nothing.
    pub async fn sync_now(&self) -> Result<SyncOutcome, SyncError> {
        let Some(_running) = RunningGuard::acquire(self) else {
            tracing::debug!("Sync already in progress, skipping");
            return Ok(SyncOutcome::Skipped);
        };
        self.cancelled.store(false, Ordering::SeqCst);
        self.phase.send_replace(SyncPhase::Syncing);
        self.events.publish(StoreEvent::SyncStarted);
        tracing::info!("Sync started");

        let result = self.run_cycles().await;
        let phase = match result {
            Ok(SyncOutcome::PartialFailure(_)) => SyncPhase::PartialFailure,
            Ok(_) => SyncPhase::Success,
            Err(_) => SyncPhase::Failure,
        };
        self.phase.send_replace(phase);
        self.publish_outcome(&result);
        result
    }

    async fn run_cycles(&self) -> Result<SyncOutcome, SyncError> {
        let mut total = SyncReport::default();
        // Changes the remote answered with an older or equal version; they
        // stay dirty but are not re-sent until the next run
        let mut deferred = HashSet::new();
        loop {
            let cycle = self.run_cycle(&mut deferred).await?;
            total.absorb(&cycle.report);

            if cycle.report.unacknowledged > 0 {
                return Ok(SyncOutcome::PartialFailure(total));
            }
            let progressed =
                cycle.report.pushed + cycle.report.conflicts + cycle.report.kept_local > 0;
            if !cycle.batch_full || !progressed {
                return Ok(SyncOutcome::Success(total));
            }
            tracing::debug!("Batch was full, running follow-up cycle");
        }
    }

    async fn run_cycle(
        &self,
        deferred: &mut HashSet<(EntityKind, String)>,
    ) -> Result<Cycle, SyncError> {
        let mut report = SyncReport {
            cycles: 1,
            ..SyncReport::default()
        };

        let (since, batch) = {
            let store = self.store.lock().await;
            let batch: Vec<PendingChange> = store
                .pending_changes(self.batch_size + deferred.len())?
                .into_iter()
                .filter(|change| !deferred.contains(&(change.kind, change.id.clone())))
                .take(self.batch_size)
                .collect();
            (store.last_synced_at()?, batch)
        };
        let batch_full = batch.len() >= self.batch_size;
        self.check_cancelled()?;

        // Pull
        let mut changes = self
            .policy
            .run(OperationClass::Sync, || self.remote.fetch_changes(since))
            .await?;
        self.check_cancelled()?;

        changes.records.sort_by_key(SyncRecord::apply_rank);
        {
            let mut store = self.store.lock().await;
            for record in changes.records {
                match apply_if_newer(&mut store, record) {
                    Ok(true) => report.pulled += 1,
                    Ok(false) => {}
                    Err(err) if err.is_validation() => {
                        tracing::warn!(error = %err, "Skipping invalid remote record");
                        report.skipped += 1;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        self.check_cancelled()?;

        // Push
        let outgoing = {
            let store = self.store.lock().await;
            collect_outgoing(&store, &batch)?
        };
        if !outgoing.is_empty() {
            let records: Vec<SyncRecord> = outgoing.iter().map(|(_, r)| r.clone()).collect();
            let class = if records.iter().any(|r| matches!(r, SyncRecord::Book(_))) {
                OperationClass::Upload
            } else {
                OperationClass::Sync
            };

            let acks = self
                .policy
                .run(class, || self.remote.push_changes(&records))
                .await?;

            let mut store = self.store.lock().await;
            self.process_acks(&mut store, &outgoing, acks, &mut report, deferred)?;
        }

        // Acks already recorded stay confirmed; a cancelled run keeps the old watermark
        self.check_cancelled()?;
        if report.unacknowledged == 0 {
            let mut store = self.store.lock().await;
            store.set_last_synced_at(changes.server_time)?;
        }

        tracing::info!(
            pulled = report.pulled,
            pushed = report.pushed,
            conflicts = report.conflicts,
            unacknowledged = report.unacknowledged,
            "Sync cycle finished"
        );
        Ok(Cycle { report, batch_full })
    }

    fn process_acks(
        &self,
        store: &mut Store,
        outgoing: &[(PendingChange, SyncRecord)],
        acks: Vec<PushAck>,
        report: &mut SyncReport,
        deferred: &mut HashSet<(EntityKind, String)>,
    ) -> StoreResult<()> {
        let mut acknowledged = vec![false; outgoing.len()];

        for ack in acks {
            let Some(index) = outgoing
                .iter()
                .position(|(change, _)| change.kind == ack.kind && change.id == ack.id)
            else {
                tracing::warn!(kind = %ack.kind, id = %ack.id, "Ignoring ack for a change that was not sent");
                continue;
            };
            acknowledged[index] = true;
            let (change, sent) = &outgoing[index];

            match ack.status {
                AckStatus::Committed => {
                    confirm(store, change)?;
                    report.pushed += 1;
                }
                // The remote already holds exactly the version that was sent
                AckStatus::Conflict { remote } if remote.updated_at() == sent.updated_at() => {
                    tracing::debug!(kind = %change.kind, id = %change.id, "Remote holds the same version");
                    confirm(store, change)?;
                    report.pushed += 1;
                }
                AckStatus::Conflict { remote } => match apply_if_newer(store, remote) {
                    Ok(true) => {
                        tracing::warn!(kind = %change.kind, id = %change.id, "Conflict resolved with remote version");
                        report.conflicts += 1;
                    }
                    Ok(false) => {
                        tracing::warn!(kind = %change.kind, id = %change.id, "Conflict resolved with local version");
                        deferred.insert((change.kind, change.id.clone()));
                        report.kept_local += 1;
                    }
                    Err(err) if err.is_validation() => {
                        tracing::warn!(error = %err, "Conflicting remote record is invalid, keeping local");
                        deferred.insert((change.kind, change.id.clone()));
                        report.kept_local += 1;
                    }
                    Err(err) => return Err(err),
                },
            }
        }

        report.unacknowledged = acknowledged.iter().filter(|acked| !**acked).count();
        if report.unacknowledged > 0 {
            tracing::warn!(
                unacknowledged = report.unacknowledged,
                sent = outgoing.len(),
                "Remote acknowledged only part of the batch"
            );
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.cancelled.load(Ordering::SeqCst) {
            tracing::info!("Sync cancelled");
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    fn publish_outcome(&self, result: &Result<SyncOutcome, SyncError>) {
        match result {
            Ok(SyncOutcome::Success(report)) => {
                tracing::info!(cycles = report.cycles, "Sync succeeded");
                self.events.publish(StoreEvent::SyncSucceeded {
                    pulled: report.pulled,
                    pushed: report.pushed,
                    conflicts: report.conflicts,
                });
            }
            Ok(SyncOutcome::PartialFailure(report)) => {
                self.events.publish(StoreEvent::SyncFailed {
                    message: format!(
                        "{} pushed changes were not acknowledged",
                        report.unacknowledged
                    ),
                });
            }
            Ok(SyncOutcome::Skipped) => {}
            Err(SyncError::Cancelled) => {}
            Err(err) => {
                tracing::error!(error = %err, "Sync failed");
                let message = err.to_string();
                self.events.publish(StoreEvent::SyncFailed {
                    message: message.clone(),
                });
                if err.is_remote() {
                    self.events.publish(StoreEvent::StorageError { message });
                }
            }
        }
    }
}

/// Clears the running flag and settles the phase, also when a cycle is
/// dropped mid-flight
struct RunningGuard<'a> {
    engine: &'a SyncEngine,
}

impl<'a> RunningGuard<'a> {
    fn acquire(engine: &'a SyncEngine) -> Option<Self> {
        engine
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { engine })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.engine.phase.send_replace(SyncPhase::Idle);
        self.engine.running.store(false, Ordering::SeqCst);
    }
}

fn confirm(store: &mut Store, change: &PendingChange) -> StoreResult<()> {
    if !store.confirm_change(change)? {
        tracing::debug!(kind = %change.kind, id = %change.id, "Changed again while pushing, stays pending");
    }
    Ok(())
}

/// Apply a remote record unless the local version is at least as new
fn apply_if_newer(store: &mut Store, record: SyncRecord) -> StoreResult<bool> {
    let local = store.local_updated_at(record.kind(), &record.id())?;
    if resolve(local, record.updated_at()) == Resolution::KeepLocal {
        return Ok(false);
    }

    match record {
        SyncRecord::Book(book) => store.apply_remote(book).map(|_| true),
        SyncRecord::Note(note) => store.apply_remote(note).map(|_| true),
        SyncRecord::Position(position) => store.apply_remote(position).map(|_| true),
        SyncRecord::Bookmark(bookmark) => store.apply_remote(bookmark).map(|_| true),
        SyncRecord::Preferences(preferences) => {
            store.apply_remote_preferences(preferences).map(|_| true)
        }
        SyncRecord::Deleted { entity, id, .. } => {
            store.apply_remote_delete(entity, &id)?;
            Ok(true)
        }
    }
}

/// Re-read each change of the batch and build what to send
///
/// Changes confirmed or overwritten by the remote since the batch was read
/// are dropped.
fn collect_outgoing(
    store: &Store,
    batch: &[PendingChange],
) -> StoreResult<Vec<(PendingChange, SyncRecord)>> {
    let mut outgoing = Vec::with_capacity(batch.len());
    for change in batch {
        let Some(current) = store.pending_change(change.kind, &change.id)? else {
            continue;
        };
        if let Some(record) = load_record(store, &current)? {
            outgoing.push((current, record));
        }
    }
    Ok(outgoing)
}

fn load_record(store: &Store, change: &PendingChange) -> StoreResult<Option<SyncRecord>> {
    if let Some(deleted_at) = change.deleted_at {
        return Ok(Some(SyncRecord::Deleted {
            entity: change.kind,
            id: change.id.clone(),
            deleted_at,
        }));
    }

    Ok(match change.kind {
        EntityKind::Book => find::<Book>(store, &change.id)?.map(SyncRecord::Book),
        EntityKind::Note => find::<Note>(store, &change.id)?.map(SyncRecord::Note),
        EntityKind::Position => find::<ReadingPosition>(store, &change.id)?.map(SyncRecord::Position),
        EntityKind::Bookmark => find::<Bookmark>(store, &change.id)?.map(SyncRecord::Bookmark),
        EntityKind::Preferences => Some(SyncRecord::Preferences(store.preferences()?)),
        EntityKind::Summary => None,
    })
}

fn find<T: Record>(store: &Store, id: &str) -> StoreResult<Option<T>> {
    match Uuid::parse_str(id) {
        Ok(id) => store.find(id),
        Err(_) => Ok(None),
    }
}

// ==================== Background Task ====================

/// Commands sent to the background sync task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// Run a cycle now
    SyncNow,
    /// Stop the task, cancelling an in-flight cycle
    Shutdown,
}

/// Handle to control the background sync task
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    phase_rx: watch::Receiver<SyncPhase>,
    engine: Arc<SyncEngine>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Ask the task to sync now; returns false once the task has stopped
    pub async fn sync_now(&self) -> bool {
        self.command_tx.send(SyncCommand::SyncNow).await.is_ok()
    }

    pub fn phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase_rx.clone()
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Stop the task and wait for it to finish
    pub async fn shutdown(self) {
        self.engine.cancel();
        let _ = self.command_tx.send(SyncCommand::Shutdown).await;
        let _ = self.task.await;
    }
}

/// Spawn a task that syncs every `interval` and on demand
pub fn spawn_sync_task(engine: Arc<SyncEngine>, interval: Duration) -> SyncHandle {
    let (command_tx, command_rx) = mpsc::channel(16);
    let phase_rx = engine.phase();

    let task = tokio::spawn(sync_task_loop(engine.clone(), interval, command_rx));

    SyncHandle {
        command_tx,
        phase_rx,
        engine,
        task,
    }
}

async fn sync_task_loop(
    engine: Arc<SyncEngine>,
    interval: Duration,
    mut command_rx: mpsc::Receiver<SyncCommand>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            cmd = command_rx.recv() => {
                match cmd {
                    Some(SyncCommand::SyncNow) => {}
                    Some(SyncCommand::Shutdown) | None => break,
                }
            }
        }

        let cycle = engine.sync_now();
        tokio::pin!(cycle);
        loop {
            tokio::select! {
                result = &mut cycle => {
                    if let Err(e) = result {
                        tracing::debug!(error = %e, "Background sync failed");
                    }
                    break;
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(SyncCommand::SyncNow) => {
                            tracing::debug!("Sync already in progress");
                        }
                        Some(SyncCommand::Shutdown) | None => {
                            tracing::info!("Sync task stopping during a cycle");
                            return;
                        }
                    }
                }
            }
        }
    }
    tracing::debug!("Sync task stopped");
}
