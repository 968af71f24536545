//! Preferences command handlers

use anyhow::{bail, Context, Result};

use airis_core::models::{AiPatch, Language, SummaryLength, SummaryStyle, Theme, VoicePatch};
use airis_core::{PreferencesPatch, Store};

use crate::output::Output;

pub fn show(store: &Store, output: &Output) -> Result<()> {
    let prefs = store.preferences()?;
    output.print_preferences(&prefs);
    Ok(())
}

pub fn set(store: &mut Store, key: String, value: String, output: &Output) -> Result<()> {
    let patch = patch_for(&key, &value)?;
    let prefs = store
        .update_preferences(&patch)
        .with_context(|| format!("Failed to set {}", key))?;

    output.success(&format!("Set {} = {}", key, value));
    output.print_preferences(&prefs);
    Ok(())
}

pub fn reset(store: &mut Store, output: &Output) -> Result<()> {
    let prefs = store.reset_preferences()?;
    output.success("Preferences reset to defaults");
    output.print_preferences(&prefs);
    Ok(())
}

/// Translate `key = value` into a partial preferences update
fn patch_for(key: &str, value: &str) -> Result<PreferencesPatch> {
    let mut patch = PreferencesPatch::default();
    let mut voice = VoicePatch::default();
    let mut ai = AiPatch::default();

    match key {
        "language" => patch.language = Some(value.parse::<Language>()?),
        "theme" => patch.theme = Some(value.parse::<Theme>()?),
        "voice.rate" => voice.rate = Some(parse_number(key, value)?),
        "voice.volume" => voice.volume = Some(parse_number(key, value)?),
        "voice.pitch" => voice.pitch = Some(parse_number(key, value)?),
        "voice.id" => voice.voice_id = Some(value.to_string()),
        "summary.length" => ai.summary_length = Some(value.parse::<SummaryLength>()?),
        "summary.style" => ai.summary_style = Some(value.parse::<SummaryStyle>()?),
        _ => bail!(
            "Unknown preference: '{}'\n\
             Valid keys: language, theme, voice.rate, voice.volume, voice.pitch, voice.id, \
             summary.length, summary.style",
            key
        ),
    }

    if voice != VoicePatch::default() {
        patch.voice = Some(voice);
    }
    if ai != AiPatch::default() {
        patch.ai = Some(ai);
    }
    Ok(patch)
}

fn parse_number(key: &str, value: &str) -> Result<f64> {
    value
        .parse()
        .with_context(|| format!("Invalid number for {}: {}", key, value))
}
