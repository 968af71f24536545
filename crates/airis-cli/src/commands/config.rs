//! Config command handlers

use anyhow::{bail, Context, Result};

use airis_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(output: &Output) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.json(&config),
        OutputFormat::Quiet => println!("{}", config.data_dir.display()),
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:                {}", config.data_dir.display());
            println!(
                "  sync_url:                {}",
                config.sync_url.as_deref().unwrap_or("(not set)")
            );
            println!("  sync_enabled:            {}", config.sync_enabled);
            println!(
                "  sync_token:              {}",
                if config.sync_token.is_some() {
                    "(set)"
                } else {
                    "(not set)"
                }
            );
            println!("  sync.interval_secs:      {}", config.sync.interval_secs);
            println!("  sync.batch_size:         {}", config.sync.batch_size);
            println!("  retry.max_attempts:      {}", config.retry.max_attempts);
            println!("  retry.base_delay_ms:     {}", config.retry.base_delay_ms);
            println!("  retry.multiplier:        {}", config.retry.multiplier);
            println!("  quota.warning_threshold: {}", config.quota.warning_threshold);
            println!("  quota.local_quota_mb:    {}", config.quota.local_quota_mb);
            println!("  cache.capacity:          {}", config.cache.capacity);
            println!("  cache.ttl_secs:          {}", config.cache.ttl_secs);
            println!();
            println!("Config file: {}", Config::config_file_path().display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, output: &Output) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    apply(&mut config, &key, &value)?;
    config.save().context("Failed to save configuration")?;

    let shown = if key == "sync_token" { "(hidden)" } else { value.as_str() };
    output.success(&format!("Set {} = {}", key, shown));
    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let optional = |value: &str| {
        if value.is_empty() || value == "none" {
            None
        } else {
            Some(value.to_string())
        }
    };

    match key {
        "data_dir" => config.data_dir = value.into(),
        "sync_url" => config.sync_url = optional(value),
        "sync_token" => config.sync_token = optional(value),
        "sync_enabled" => config.sync_enabled = parse(key, value)?,
        "sync.interval_secs" => config.sync.interval_secs = parse(key, value)?,
        "sync.batch_size" => config.sync.batch_size = parse(key, value)?,
        "retry.max_attempts" => config.retry.max_attempts = parse(key, value)?,
        "retry.base_delay_ms" => config.retry.base_delay_ms = parse(key, value)?,
        "retry.multiplier" => config.retry.multiplier = parse(key, value)?,
        "quota.warning_threshold" => config.quota.warning_threshold = parse(key, value)?,
        "quota.local_quota_mb" => config.quota.local_quota_mb = parse(key, value)?,
        "cache.capacity" => config.cache.capacity = parse(key, value)?,
        "cache.ttl_secs" => config.cache.ttl_secs = parse(key, value)?,
        _ => bail!(
            "Unknown configuration key: '{}'\n\
             Valid keys: data_dir, sync_url, sync_token, sync_enabled, sync.interval_secs, \
             sync.batch_size, retry.max_attempts, retry.base_delay_ms, retry.multiplier, \
             quota.warning_threshold, quota.local_quota_mb, cache.capacity, cache.ttl_secs",
            key
        ),
    }
    Ok(())
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid value for {}: '{}'", key, value))
}
