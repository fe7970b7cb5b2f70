//! Results collection and output for batch game sessions.
//!
//! Captures, per session:
//! - The drawn conditions
//! - The full transcript, internal messages included
//! - Simulated human calls
//! - The error that stopped the session, if any

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use experiment_kernel::{ConditionSet, LlmCallRecord, MessageRole, Transcript};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a timestamped output path from the given path.
/// e.g., "results.json" -> "results-20260108-010530.json"
pub fn timestamped_path(path: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d-%H%M%S");
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("results");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("json");
    let parent = path.parent().unwrap_or(Path::new("."));
    parent.join(format!("{}-{}.{}", stem, timestamp, ext))
}

/// Outcome of one simulated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub index: usize,
    pub session_id: Uuid,
    pub seed: u64,
    pub conditions: ConditionSet,
    /// Human turns that completed.
    pub turns: usize,
    pub transcript: Transcript,
    /// Calls made for the simulated human, kept apart from the session's own calls.
    pub human_calls: Vec<LlmCallRecord>,
    pub error: Option<String>,
}

impl SessionResult {
    pub fn completed(&self) -> bool {
        self.error.is_none()
    }

    /// Player decisions made during the session.
    pub fn player_decisions(&self) -> usize {
        self.transcript
            .messages()
            .iter()
            .filter(|m| m.role == MessageRole::Player)
            .count()
    }

    pub fn total_tokens(&self) -> u64 {
        let human: u64 = self
            .human_calls
            .iter()
            .map(|c| c.input_tokens + c.output_tokens)
            .sum();
        self.transcript.total_input_tokens() + self.transcript.total_output_tokens() + human
    }
}

/// Aggregates for sessions sharing the same condition values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellSummary {
    pub sessions: usize,
    pub failed: usize,
    pub avg_turns: f64,
    pub avg_player_decisions: f64,
    pub avg_tokens: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub sessions: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Keyed by `name=value` pairs joined with `:`, in name order.
    pub by_condition: BTreeMap<String, CellSummary>,
}

/// All results of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResults {
    pub scenario: String,
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub sessions: Vec<SessionResult>,
    pub summary: BatchSummary,
}

/// Grouping key for a condition set.
pub fn condition_key(conditions: &ConditionSet) -> String {
    conditions
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(":")
}

impl BatchResults {
    pub fn new(scenario: impl Into<String>, seed: u64) -> Self {
        Self {
            scenario: scenario.into(),
            seed,
            started_at: Utc::now(),
            ended_at: None,
            sessions: Vec::new(),
            summary: BatchSummary::default(),
        }
    }

    pub fn add(&mut self, result: SessionResult) {
        self.sessions.push(result);
    }

    /// Sort sessions by index and recompute the summary.
    pub fn finish(&mut self) {
        self.sessions.sort_by_key(|s| s.index);
        self.compute_summary();
        self.ended_at = Some(Utc::now());
    }

    /// Compute summary statistics.
    pub fn compute_summary(&mut self) {
        let mut summary = BatchSummary {
            sessions: self.sessions.len(),
            ..Default::default()
        };

        let mut by_condition: BTreeMap<String, Vec<&SessionResult>> = BTreeMap::new();
        for session in &self.sessions {
            if session.completed() {
                summary.completed += 1;
            } else {
                summary.failed += 1;
            }
            summary.total_input_tokens += session.transcript.total_input_tokens()
                + session.human_calls.iter().map(|c| c.input_tokens).sum::<u64>();
            summary.total_output_tokens += session.transcript.total_output_tokens()
                + session.human_calls.iter().map(|c| c.output_tokens).sum::<u64>();
            by_condition
                .entry(condition_key(&session.conditions))
                .or_default()
                .push(session);
        }

        for (key, sessions) in by_condition {
            let n = sessions.len() as f64;
            summary.by_condition.insert(
                key,
                CellSummary {
                    sessions: sessions.len(),
                    failed: sessions.iter().filter(|s| !s.completed()).count(),
                    avg_turns: sessions.iter().map(|s| s.turns as f64).sum::<f64>() / n,
                    avg_player_decisions: sessions
                        .iter()
                        .map(|s| s.player_decisions() as f64)
                        .sum::<f64>()
                        / n,
                    avg_tokens: sessions.iter().map(|s| s.total_tokens() as f64).sum::<f64>() / n,
                },
            );
        }

        self.summary = summary;
    }

    /// Save results to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Load results from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let results = serde_json::from_str(&json)?;
        Ok(results)
    }
}
