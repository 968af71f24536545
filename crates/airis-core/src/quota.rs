//! Storage quota monitoring
//!
//! The [`QuotaMonitor`] watches storage usage and publishes a
//! `storage-quota-warning` once per crossing into the nearly-full state. The
//! [`QuotaGuard`] is consulted by the store before every write and rejects
//! writes that would exceed the hard ceiling.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{StoreError, StoreResult};
use crate::events::{EventBus, StoreEvent};

/// Storage usage as reported by an estimator
///
/// Every field is optional: an estimator that cannot report returns the
/// default (all `None`) rather than an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageEstimate {
    pub quota: Option<u64>,
    pub usage: Option<u64>,
    pub available: Option<u64>,
}

impl StorageEstimate {
    pub fn new(quota: u64, usage: u64) -> Self {
        Self {
            quota: Some(quota),
            usage: Some(usage),
            available: Some(quota.saturating_sub(usage)),
        }
    }

    /// Fraction of the quota in use, when both sides are known
    pub fn usage_ratio(&self) -> Option<f64> {
        match (self.usage, self.quota) {
            (Some(usage), Some(quota)) if quota > 0 => Some(usage as f64 / quota as f64),
            _ => None,
        }
    }
}

/// Whether `usage` is above `threshold` of `quota`
///
/// A zero quota is never nearly full.
pub fn is_nearly_full(usage: u64, quota: u64, threshold: f64) -> bool {
    quota > 0 && usage as f64 / quota as f64 > threshold
}

/// A source of storage usage figures
pub trait StorageEstimator: Send + Sync {
    /// Current estimate; never fails
    fn estimate(&self) -> StorageEstimate;
}

/// Measures the files in the data directory against a fixed budget
#[derive(Debug, Clone)]
pub struct DirectoryEstimator {
    dir: PathBuf,
    quota: u64,
}

impl DirectoryEstimator {
    pub fn new(dir: impl Into<PathBuf>, quota: u64) -> Self {
        Self {
            dir: dir.into(),
            quota,
        }
    }
}

impl StorageEstimator for DirectoryEstimator {
    fn estimate(&self) -> StorageEstimate {
        match directory_size(&self.dir) {
            Ok(usage) => StorageEstimate::new(self.quota, usage),
            Err(e) => {
                tracing::debug!(dir = ?self.dir, error = %e, "Storage estimate unavailable");
                StorageEstimate::default()
            }
        }
    }
}

fn directory_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += directory_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

/// An estimator whose figures are set by hand
///
/// Clones share the same estimate.
#[derive(Debug, Clone, Default)]
pub struct ManualEstimator(Arc<Mutex<StorageEstimate>>);

impl ManualEstimator {
    pub fn new(estimate: StorageEstimate) -> Self {
        Self(Arc::new(Mutex::new(estimate)))
    }

    pub fn set(&self, estimate: StorageEstimate) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = estimate;
    }
}

impl StorageEstimator for ManualEstimator {
    fn estimate(&self) -> StorageEstimate {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Edge-triggered nearly-full detector
pub struct QuotaMonitor {
    estimator: Arc<dyn StorageEstimator>,
    events: Arc<EventBus>,
    threshold: f64,
    /// Whether the last known estimate was above the threshold
    above: bool,
}

impl QuotaMonitor {
    pub fn new(estimator: Arc<dyn StorageEstimator>, events: Arc<EventBus>, threshold: f64) -> Self {
        Self {
            estimator,
            events,
            threshold,
            above: false,
        }
    }

    pub fn is_above_threshold(&self) -> bool {
        self.above
    }

    /// Take an estimate and publish a warning if it crossed the threshold
    ///
    /// An unknown estimate leaves the state unchanged.
    pub fn check(&mut self) -> StorageEstimate {
        let estimate = self.estimator.estimate();
        let (Some(usage), Some(quota)) = (estimate.usage, estimate.quota) else {
            return estimate;
        };

        let nearly_full = is_nearly_full(usage, quota, self.threshold);
        if nearly_full && !self.above {
            tracing::warn!(usage, quota, threshold = self.threshold, "Storage nearly full");
            self.events.publish(StoreEvent::StorageQuotaWarning(estimate));
        } else if !nearly_full && self.above {
            tracing::info!(usage, quota, "Storage back below quota threshold");
        }
        self.above = nearly_full;
        estimate
    }

    /// Run the monitor in the background
    ///
    /// Re-checks after every mutation event and on `interval`.
    pub fn spawn(mut self, interval: Duration) -> QuotaHandle {
        let mut events = self.events.subscribe();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check();
                    }
                    event = events.recv() => {
                        match event {
                            Some(event) if event.is_mutation() => {
                                self.check();
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::debug!("Quota monitor stopped");
        });

        QuotaHandle { shutdown_tx, task }
    }
}

/// Handle to the background quota monitor
pub struct QuotaHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl QuotaHandle {
    /// Stop the monitor and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// Hard storage ceiling checked before every write
pub struct QuotaGuard {
    estimator: Arc<dyn StorageEstimator>,
}

impl QuotaGuard {
    pub fn new(estimator: Arc<dyn StorageEstimator>) -> Self {
        Self { estimator }
    }

    pub fn estimate(&self) -> StorageEstimate {
        self.estimator.estimate()
    }

    /// Reject a write of `requested` bytes that would not fit
    ///
    /// Writes are allowed when usage cannot be estimated.
    pub fn check(&self, requested: u64) -> StoreResult<StorageEstimate> {
        let estimate = self.estimator.estimate();
        if let (Some(usage), Some(quota)) = (estimate.usage, estimate.quota) {
            if usage.saturating_add(requested) > quota {
                return Err(StoreError::QuotaExceeded {
                    requested,
                    usage,
                    limit: quota,
                });
            }
        }
        Ok(estimate)
    }
}
