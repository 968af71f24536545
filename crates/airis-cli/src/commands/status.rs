//! Status command handler

use anyhow::Result;

use airis_core::Store;

use crate::output::{human_bytes, Output, OutputFormat};

/// Show library counts, sync state and storage usage
pub fn show(store: &Store, output: &Output) -> Result<()> {
    let stats = store.stats()?;
    let config = store.config();

    match output.format {
        OutputFormat::Json => {
            output.json(&serde_json::json!({
                "sync_enabled": config.sync_enabled,
                "sync_url": config.sync_url,
                "healthy": store.is_healthy(),
                "stats": stats,
            }));
        }
        OutputFormat::Quiet => {
            println!("{}", stats.pending);
        }
        OutputFormat::Human => {
            println!("Airis Status");
            println!("============");
            println!();
            println!("Sync:");
            println!(
                "  Status:      {}",
                if config.sync_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            if let Some(ref url) = config.sync_url {
                println!("  Server:      {}", url);
            }
            println!("  Pending:     {}", stats.pending);
            println!(
                "  Last synced: {}",
                stats
                    .last_synced_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string())
            );
            println!();
            println!("Storage:");
            println!("  Location:    {}", config.sqlite_path().display());
            match (stats.estimate.usage, stats.estimate.quota) {
                (Some(usage), Some(quota)) => println!(
                    "  Usage:       {} of {} ({:.1}%)",
                    human_bytes(usage),
                    human_bytes(quota),
                    stats.estimate.usage_ratio().unwrap_or(0.0) * 100.0
                ),
                _ => println!("  Usage:       unknown"),
            }
            println!();
            println!("Contents:");
            println!("  Books:       {}", stats.books);
            println!("  Notes:       {}", stats.notes);
            println!("  Positions:   {}", stats.positions);
            println!("  Bookmarks:   {}", stats.bookmarks);
            println!("  Summaries:   {}", stats.summaries);
        }
    }

    Ok(())
}
