//! Sync command handler

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use airis_core::sync::{HttpRemote, SyncEngine, SyncOutcome};
use airis_core::{Config, SharedStore};

use crate::output::{Output, OutputFormat};

/// Build an engine for the configured remote
pub async fn engine(store: &SharedStore, config: &Config) -> Result<SyncEngine> {
    if !config.sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             airis config set sync_enabled true\n  \
             airis config set sync_url https://your-server/api"
        );
    }
    let Some(ref sync_url) = config.sync_url else {
        bail!(
            "Sync URL not configured. Set it with:\n  \
             airis config set sync_url https://your-server/api"
        );
    };

    // the engine applies the per-operation timeouts; this only bounds a hung socket
    let request_timeout = Duration::from_millis(config.timeouts.upload_ms.saturating_mul(2));
    let remote = HttpRemote::new(sync_url.clone(), config.sync_token.clone(), request_timeout)
        .context("Failed to create HTTP client")?;

    Ok(SyncEngine::new(store.clone(), Arc::new(remote)).await)
}

/// Run one sync now
pub async fn sync(store: &SharedStore, config: &Config, output: &Output) -> Result<()> {
    let engine = engine(store, config).await?;

    output.message(&format!(
        "Syncing with {}...",
        config.sync_url.as_deref().unwrap_or_default()
    ));

    let outcome = engine.sync_now().await.context("Sync failed")?;
    let pending = store.lock().await.pending_count()?;

    match outcome {
        SyncOutcome::Success(report) | SyncOutcome::PartialFailure(report)
            if output.format == OutputFormat::Json =>
        {
            output.json(&serde_json::json!({
                "pulled": report.pulled,
                "pushed": report.pushed,
                "conflicts": report.conflicts,
                "kept_local": report.kept_local,
                "skipped": report.skipped,
                "unacknowledged": report.unacknowledged,
                "pending": pending,
            }));
        }
        SyncOutcome::Success(report) => {
            output.success(&format!(
                "Sync complete - pulled {}, pushed {}, {} conflict(s) resolved",
                report.pulled, report.pushed, report.conflicts
            ));
            if pending > 0 {
                output.message(&format!("  {} change(s) still pending", pending));
            }
        }
        SyncOutcome::PartialFailure(report) => {
            output.message(&format!(
                "⚠ Sync incomplete - {} change(s) not acknowledged, will retry next sync",
                report.unacknowledged
            ));
        }
        SyncOutcome::Skipped => output.message("Sync already in progress"),
    }

    Ok(())
}

/// Sync after a write, skipping silently when sync is not configured
pub async fn sync_quiet(store: &SharedStore, config: &Config) -> Result<()> {
    if !config.sync_enabled || config.sync_url.is_none() {
        return Ok(());
    }
    let engine = engine(store, config).await?;
    engine.sync_now().await?;
    Ok(())
}
