use std::fmt;
use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::citation::VerificationReport;
use super::gateway::Usage;

// ═══════════════════════════════════════════════════════════
// Documents and chunks
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentRole {
    Primary,
    Supporting,
}

impl DocumentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Supporting => "supporting",
        }
    }
}

impl fmt::Display for DocumentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub source_id: String,
    pub role: DocumentRole,
    pub text: String,
}

impl Document {
    pub fn primary(source_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            role: DocumentRole::Primary,
            text: text.into(),
        }
    }

    pub fn supporting(source_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            role: DocumentRole::Supporting,
            text: text.into(),
        }
    }
}

/// A bounded, order-preserving segment of the planned text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub index: usize,
    pub total: usize,
    pub text: String,
    /// Character (not byte) range within the planned text.
    pub char_span: Range<usize>,
    /// Source ids whose text (or boundary marker) appears in this chunk.
    pub sources: Vec<String>,
}

// ═══════════════════════════════════════════════════════════
// Generation results
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialResult {
    pub chunk_index: usize,
    pub content: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidatedResult {
    pub content: String,
    pub partial_count: usize,
    /// True when a single partial was returned without a model call.
    pub passthrough: bool,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    Regenerate,
    Failed,
}

/// One pass through generate → verify, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationAttempt {
    pub attempt_number: u32,
    pub consolidated_result: ConsolidatedResult,
    pub verification_report: VerificationReport,
    pub verdict: Verdict,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════
// Verification policy
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    /// Failing citations reject the result.
    Strict,
    /// Failing citations are reported as warnings on an accepted result.
    Lenient,
}

/// When unverifiable citations alone may trigger regeneration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnverifiableEscalation {
    #[default]
    Never,
    /// Escalate in strict mode when the unverifiable share exceeds the ratio.
    AboveRatio(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerificationPolicy {
    pub mode: VerificationMode,
    pub max_attempts: u32,
    #[serde(default)]
    pub unverifiable_escalation: UnverifiableEscalation,
}

impl VerificationPolicy {
    pub fn new(mode: VerificationMode, max_attempts: u32) -> Self {
        Self {
            mode,
            max_attempts,
            unverifiable_escalation: UnverifiableEscalation::Never,
        }
    }

    pub fn strict(max_attempts: u32) -> Self {
        Self::new(VerificationMode::Strict, max_attempts)
    }

    pub fn lenient(max_attempts: u32) -> Self {
        Self::new(VerificationMode::Lenient, max_attempts)
    }

    pub fn with_escalation(mut self, escalation: UnverifiableEscalation) -> Self {
        self.unverifiable_escalation = escalation;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if let UnverifiableEscalation::AboveRatio(r) = self.unverifiable_escalation {
            if !(0.0..=1.0).contains(&r) {
                return Err(format!("unverifiable escalation ratio {r} is outside [0, 1]"));
            }
        }
        Ok(())
    }
}
