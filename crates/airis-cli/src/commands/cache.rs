//! Summary cache command handlers

use anyhow::Result;

use airis_core::Store;

use crate::output::{Output, OutputFormat};

pub fn stats(store: &Store, output: &Output) -> Result<()> {
    let stats = store.cache_stats()?;
    match output.format {
        OutputFormat::Json => output.json(&stats),
        OutputFormat::Quiet => println!("{}", stats.entries),
        OutputFormat::Human => {
            println!("Summary cache:");
            println!("  Entries:  {} / {}", stats.entries, stats.capacity);
            println!("  Evicted:  {}", stats.evicted);
            println!("  Expired:  {}", stats.expired);
        }
    }
    Ok(())
}

pub fn sweep(store: &mut Store, output: &Output) -> Result<()> {
    let removed = store.sweep_expired_summaries()?;
    output.success(&format!("Removed {} expired summary(ies)", removed));
    Ok(())
}

pub fn clear(store: &mut Store, output: &Output) -> Result<()> {
    let removed = store.clear_summaries()?;
    output.success(&format!("Cleared {} cached summary(ies)", removed));
    Ok(())
}
