use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationKind {
    Case,
    Legislation,
    /// Bare neutral or report citation with no party names.
    Unknown,
}

impl fmt::Display for CitationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Case => write!(f, "case"),
            Self::Legislation => write!(f, "legislation"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A citation-shaped substring found in generated text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub raw_text: String,
    pub normalized_form: String,
    pub kind: CitationKind,
    /// Byte offsets of `raw_text` within the scanned text.
    pub span: Range<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    NotFound,
    Malformed,
    /// The check itself could not complete. Not evidence the citation is wrong.
    Unverifiable,
}

impl VerificationStatus {
    /// Statuses that count against a result in strict mode.
    pub fn is_failing(&self) -> bool {
        matches!(self, Self::NotFound | Self::Malformed)
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verified => write!(f, "verified"),
            Self::NotFound => write!(f, "not_found"),
            Self::Malformed => write!(f, "malformed"),
            Self::Unverifiable => write!(f, "unverifiable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub citation: Citation,
    pub status: VerificationStatus,
    /// Authority reference for verified citations.
    pub source_ref: Option<String>,
    pub detail: Option<String>,
}

impl VerificationOutcome {
    pub fn new(citation: Citation, status: VerificationStatus) -> Self {
        Self {
            citation,
            status,
            source_ref: None,
            detail: None,
        }
    }

    pub fn with_source_ref(mut self, source_ref: Option<String>) -> Self {
        self.source_ref = source_ref;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub total: usize,
    pub verified: usize,
    pub not_found: usize,
    pub malformed: usize,
    pub unverifiable: usize,
}

impl VerificationSummary {
    pub fn failing(&self) -> usize {
        self.not_found + self.malformed
    }
}

/// Outcomes for one attempt, in extraction order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub outcomes: Vec<VerificationOutcome>,
    pub summary: VerificationSummary,
}

impl VerificationReport {
    pub fn from_outcomes(outcomes: Vec<VerificationOutcome>) -> Self {
        let mut summary = VerificationSummary {
            total: outcomes.len(),
            ..Default::default()
        };
        for outcome in &outcomes {
            match outcome.status {
                VerificationStatus::Verified => summary.verified += 1,
                VerificationStatus::NotFound => summary.not_found += 1,
                VerificationStatus::Malformed => summary.malformed += 1,
                VerificationStatus::Unverifiable => summary.unverifiable += 1,
            }
        }
        Self { outcomes, summary }
    }

    pub fn has_failures(&self) -> bool {
        self.summary.failing() > 0
    }

    /// Normalized forms of `not_found` and `malformed` citations.
    pub fn failing_citations(&self) -> Vec<String> {
        self.citations_with(|s| s.is_failing())
    }

    pub fn unverifiable_citations(&self) -> Vec<String> {
        self.citations_with(|s| s == VerificationStatus::Unverifiable)
    }

    /// Share of citations that could not be checked; 0 when there are none.
    pub fn unverifiable_ratio(&self) -> f64 {
        if self.summary.total == 0 {
            return 0.0;
        }
        self.summary.unverifiable as f64 / self.summary.total as f64
    }

    /// One human-readable line per citation that did not verify.
    pub fn warnings(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.status != VerificationStatus::Verified)
            .map(|o| match &o.detail {
                Some(detail) => format!(
                    "citation \"{}\" is {}: {}",
                    o.citation.normalized_form, o.status, detail
                ),
                None => format!("citation \"{}\" is {}", o.citation.normalized_form, o.status),
            })
            .collect()
    }

    fn citations_with(&self, keep: impl Fn(VerificationStatus) -> bool) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| keep(o.status))
            .map(|o| o.citation.normalized_form.clone())
            .collect()
    }
}
