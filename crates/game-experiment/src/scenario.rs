//! Loading scenario bundles from disk.
//!
//! A scenario is a JSON file deserializing to [`ScenarioBundle`]. Any
//! prompt field (manager, player, human system prompts and the opening
//! instruction) may instead name a `.md` file next to the scenario; its
//! trimmed contents replace the field.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use experiment_kernel::{ConditionValue, ScenarioBundle};
use serde::Serialize;
use tracing::debug;

/// Load and resolve a scenario file.
pub fn load_scenario(path: &Path) -> Result<ScenarioBundle> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario {}", path.display()))?;
    let mut bundle: ScenarioBundle = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse scenario {}", path.display()))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    resolve_prompt(&mut bundle.manager.system_prompt, base)?;
    resolve_prompt(&mut bundle.player.system_prompt, base)?;
    resolve_prompt(&mut bundle.opening_instruction, base)?;
    if let Some(human) = bundle.human.as_mut() {
        resolve_prompt(&mut human.system_prompt, base)?;
    }

    if bundle.name.is_empty() {
        bundle.name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    Ok(bundle)
}

/// Replace `field` with a file's contents when it names an existing `.md` file.
fn resolve_prompt(field: &mut String, base: &Path) -> Result<()> {
    let candidate = field.trim();
    if !candidate.ends_with(".md") || candidate.contains('\n') {
        return Ok(());
    }
    let path = base.join(candidate);
    if !path.is_file() {
        return Ok(());
    }
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read prompt file {}", path.display()))?;
    debug!(path = %path.display(), "loaded prompt file");
    *field = contents.trim().to_string();
    Ok(())
}

/// Parse a `name=value` parameter override.
///
/// The value is read as JSON when it parses as a number or boolean, and as
/// plain text otherwise.
pub fn parse_override(s: &str) -> Result<(String, ConditionValue)> {
    let (name, raw) = s
        .split_once('=')
        .with_context(|| format!("Invalid override '{s}', expected name=value"))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Invalid override '{s}', empty name");
    }
    let raw = raw.trim();
    let value = match serde_json::from_str::<ConditionValue>(raw) {
        Ok(value @ (ConditionValue::Bool(_) | ConditionValue::Int(_) | ConditionValue::Real(_))) => value,
        _ => ConditionValue::Text(raw.to_string()),
    };
    Ok((name.to_string(), value))
}

/// Name and description of a scenario found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioSummary {
    pub path: PathBuf,
    pub name: String,
    pub description: String,
}

/// List every loadable scenario (`*.json`) directly under `root`, sorted by path.
///
/// Files that fail to load are skipped.
pub fn list_scenarios(root: &Path) -> Result<Vec<ScenarioSummary>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(root)
        .with_context(|| format!("Failed to read scenario directory {}", root.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    Ok(paths
        .into_iter()
        .filter_map(|path| match load_scenario(&path) {
            Ok(bundle) => Some(ScenarioSummary {
                path,
                name: bundle.name,
                description: bundle.description,
            }),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping unreadable scenario");
                None
            }
        })
        .collect())
}
