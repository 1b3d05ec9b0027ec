//! Shared types for the triage engine.
//!
//! The engine does not construct `Message`s — the host-side message source
//! supplies them and the engine only reads their fields.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::source::SourceHandle;

// ── Urgency levels ──────────────────────────────────────────────────

/// Urgency classification for an inbox message.
///
/// Closed set, ordered by severity (`Critical` highest). Anything outside
/// this set is invalid input and is rejected, never coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrgencyLevel {
    Critical,
    High,
    Medium,
    Low,
    Fyi,
}

impl UrgencyLevel {
    /// All levels, highest severity first.
    pub const ALL: [UrgencyLevel; 5] = [
        Self::Critical,
        Self::High,
        Self::Medium,
        Self::Low,
        Self::Fyi,
    ];

    /// Lowercase wire name (`"critical"` … `"fyi"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Fyi => "fyi",
        }
    }

    /// Human-readable display label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Critical => "Critical",
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
            Self::Fyi => "FYI",
        }
    }

    /// Host-side label path used by the label automator.
    pub fn label_path(&self) -> &'static str {
        match self {
            Self::Critical => "Triage/Critical",
            Self::High => "Triage/High",
            Self::Medium => "Triage/Medium",
            Self::Low => "Triage/Low",
            Self::Fyi => "Triage/FYI",
        }
    }

    /// Case-insensitive parse. Returns `None` for anything outside the set.
    pub fn parse_lenient(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            "fyi" => Some(Self::Fyi),
            _ => None,
        }
    }
}

impl fmt::Display for UrgencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UrgencyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_lenient(s).ok_or_else(|| format!("unknown urgency level: '{s}'"))
    }
}

// ── Messages ────────────────────────────────────────────────────────

/// A lightweight inbox message record supplied by the message source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Opaque identity. May arrive in several surface spellings — the
    /// store canonicalizes lookups (see `store::canonical_identity`).
    pub identity: String,
    /// Display sender.
    pub sender: String,
    /// Subject line.
    pub subject: String,
    /// Short preview text.
    #[serde(default)]
    pub snippet: String,
    /// Full body text, if captured.
    #[serde(default)]
    pub body_text: String,
    /// Live handle back into the message source, if still held.
    #[serde(default)]
    pub source_handle: Option<SourceHandle>,
    /// Permalink fragment usable for navigation / handle recovery.
    #[serde(default)]
    pub permalink: Option<String>,
    /// Urgency already visible in the host UI, if any. Transient — the
    /// message source recomputes it on demand.
    #[serde(default)]
    pub detected_level: Option<UrgencyLevel>,
}

// ── Verdicts ────────────────────────────────────────────────────────

/// How a verdict names the message it belongs to.
///
/// The model is instructed to echo identities back, but some models return
/// a positional index into the submitted batch instead (or both). The
/// orchestrator maps by identity first, then by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictTarget {
    /// Identity echoed by the model. Empty string means "not provided".
    #[serde(default)]
    pub identity: String,
    /// Position in the submitted batch, if the model returned one.
    #[serde(default)]
    pub index: Option<usize>,
}

/// One model-produced urgency decision for one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageVerdict {
    pub target: VerdictTarget,
    pub level: UrgencyLevel,
    /// Model confidence, clamped to [0, 100].
    pub score: u8,
    /// Short free-text justification.
    pub reason: String,
}

// ── Level counting ──────────────────────────────────────────────────

/// Per-level message counts for the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub fyi: usize,
}

impl LevelCounts {
    pub fn get(&self, level: UrgencyLevel) -> usize {
        match level {
            UrgencyLevel::Critical => self.critical,
            UrgencyLevel::High => self.high,
            UrgencyLevel::Medium => self.medium,
            UrgencyLevel::Low => self.low,
            UrgencyLevel::Fyi => self.fyi,
        }
    }

    fn bump(&mut self, level: UrgencyLevel) {
        match level {
            UrgencyLevel::Critical => self.critical += 1,
            UrgencyLevel::High => self.high += 1,
            UrgencyLevel::Medium => self.medium += 1,
            UrgencyLevel::Low => self.low += 1,
            UrgencyLevel::Fyi => self.fyi += 1,
        }
    }

    /// Ordered map form (severity-descending), for display.
    pub fn as_map(&self) -> BTreeMap<UrgencyLevel, usize> {
        UrgencyLevel::ALL.iter().map(|&l| (l, self.get(l))).collect()
    }
}

/// Count messages by their detected level. Messages without a level are
/// not counted anywhere.
pub fn count_by_level(messages: &[Message]) -> LevelCounts {
    let mut counts = LevelCounts::default();
    for msg in messages {
        if let Some(level) = msg.detected_level {
            counts.bump(level);
        }
    }
    counts
}
