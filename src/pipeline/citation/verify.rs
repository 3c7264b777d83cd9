//! Citation verification against an external authority.
//!
//! Shape validation runs first and never touches the network. A lookup that
//! cannot complete (timeout, transport error, ambiguous answer) is retried
//! once with a relaxed query before the citation is reported unverifiable.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Datelike;
use futures_util::{stream, StreamExt};
use regex::Regex;

use super::authority::AuthoritySearch;
use super::types::{Citation, CitationKind, VerificationOutcome, VerificationReport, VerificationStatus};
use crate::pipeline_config::PipelineConfig;

static BRACKET_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\[(](\d{4})[\])]").expect("bracketed year pattern"));

static ACT_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?\bAct)\s+(\d{4})\b").expect("act year pattern"));

const EARLIEST_YEAR: i32 = 1200;

/// Result of one authority query.
enum Probe {
    Verified(Option<String>),
    NotFound,
    Incomplete(String),
}

pub struct CitationVerifier {
    authority: Arc<dyn AuthoritySearch>,
    citation_timeout: Duration,
    max_concurrent: usize,
}

impl CitationVerifier {
    pub fn new(authority: Arc<dyn AuthoritySearch>, citation_timeout: Duration, max_concurrent: usize) -> Self {
        Self {
            authority,
            citation_timeout,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn from_config(authority: Arc<dyn AuthoritySearch>, config: &PipelineConfig) -> Self {
        Self::new(
            authority,
            config.verifier.citation_timeout(),
            config.concurrency.max_concurrent_verifications,
        )
    }

    pub async fn verify(&self, citation: &Citation) -> VerificationOutcome {
        if let Err(detail) = validate_shape(citation) {
            tracing::debug!(citation = %citation.normalized_form, %detail, "Malformed citation");
            return VerificationOutcome::new(citation.clone(), VerificationStatus::Malformed)
                .with_detail(detail);
        }

        let first_failure = match self.probe(&citation.normalized_form).await {
            Probe::Verified(source_ref) => {
                return VerificationOutcome::new(citation.clone(), VerificationStatus::Verified)
                    .with_source_ref(source_ref);
            }
            Probe::NotFound => {
                return VerificationOutcome::new(citation.clone(), VerificationStatus::NotFound)
                    .with_detail("no matching authority");
            }
            Probe::Incomplete(reason) => reason,
        };

        let relaxed = relaxed_query(citation);
        tracing::debug!(
            citation = %citation.normalized_form,
            relaxed = %relaxed,
            reason = %first_failure,
            "Retrying citation lookup with relaxed query"
        );

        match self.probe(&relaxed).await {
            Probe::Verified(source_ref) => {
                VerificationOutcome::new(citation.clone(), VerificationStatus::Verified)
                    .with_source_ref(source_ref)
                    .with_detail(format!("matched on relaxed query \"{relaxed}\""))
            }
            Probe::NotFound => VerificationOutcome::new(citation.clone(), VerificationStatus::NotFound)
                .with_detail(format!("no matching authority (relaxed query \"{relaxed}\")")),
            Probe::Incomplete(reason) => {
                tracing::warn!(
                    citation = %citation.normalized_form,
                    first = %first_failure,
                    retry = %reason,
                    "Citation could not be verified"
                );
                VerificationOutcome::new(citation.clone(), VerificationStatus::Unverifiable)
                    .with_detail(format!("{first_failure}; relaxed retry: {reason}"))
            }
        }
    }

    /// Verify each citation independently; outcomes keep input order.
    pub async fn verify_all(&self, citations: &[Citation]) -> VerificationReport {
        let pending: Vec<_> = citations.iter().map(|c| self.verify(c)).collect();
        let outcomes: Vec<VerificationOutcome> = stream::iter(pending)
            .buffered(self.max_concurrent)
            .collect()
            .await;

        let report = VerificationReport::from_outcomes(outcomes);
        tracing::info!(
            total = report.summary.total,
            verified = report.summary.verified,
            not_found = report.summary.not_found,
            malformed = report.summary.malformed,
            unverifiable = report.summary.unverifiable,
            "Citations verified"
        );
        report
    }

    async fn probe(&self, query: &str) -> Probe {
        match tokio::time::timeout(self.citation_timeout, self.authority.query(query)).await {
            Err(_) => Probe::Incomplete(format!("timed out after {:?}", self.citation_timeout)),
            Ok(Err(e)) => Probe::Incomplete(e.to_string()),
            Ok(Ok(hit)) if hit.ambiguous => Probe::Incomplete("ambiguous authority match".into()),
            Ok(Ok(hit)) if hit.exists => Probe::Verified(hit.source_ref),
            Ok(Ok(_)) => Probe::NotFound,
        }
    }
}

/// Basic structural checks that need no lookup.
pub fn validate_shape(citation: &Citation) -> Result<(), String> {
    let form = citation.normalized_form.as_str();

    let year = match citation.kind {
        CitationKind::Case => {
            if !form.contains(" v ") {
                return Err("case citation has no \" v \" between parties".into());
            }
            if !ends_with_number(form) {
                return Err("case citation has no trailing report number".into());
            }
            bracket_year(form).ok_or("case citation has no bracketed year")?
        }
        CitationKind::Legislation => {
            if !form.split_whitespace().any(|w| w == "Act") {
                return Err("legislation citation does not name an Act".into());
            }
            ACT_YEAR
                .captures(form)
                .and_then(|c| c[2].parse::<i32>().ok())
                .ok_or("legislation citation has no year after the Act name")?
        }
        CitationKind::Unknown => {
            if !ends_with_number(form) {
                return Err("citation has no trailing number".into());
            }
            bracket_year(form).ok_or("citation has no bracketed year")?
        }
    };

    let current_year = chrono::Utc::now().year();
    if !(EARLIEST_YEAR..=current_year).contains(&year) {
        return Err(format!("year {year} is outside {EARLIEST_YEAR}..={current_year}"));
    }
    Ok(())
}

/// Broader query for the single retry: parties and year for cases, Act
/// name and year for legislation, the bare text without brackets otherwise.
pub fn relaxed_query(citation: &Citation) -> String {
    let form = citation.normalized_form.as_str();
    match citation.kind {
        CitationKind::Case => {
            let parties = form
                .split(['[', '('])
                .next()
                .unwrap_or(form)
                .trim()
                .trim_end_matches(',');
            match bracket_year(form) {
                Some(year) => format!("{parties} {year}"),
                None => parties.to_string(),
            }
        }
        CitationKind::Legislation => match ACT_YEAR.captures(form) {
            Some(caps) => format!("{} {}", &caps[1], &caps[2]),
            None => form.to_string(),
        },
        CitationKind::Unknown => form
            .replace(['[', ']', '(', ')'], "")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn bracket_year(form: &str) -> Option<i32> {
    BRACKET_YEAR
        .captures(form)
        .and_then(|c| c[1].parse::<i32>().ok())
}

fn ends_with_number(form: &str) -> bool {
    form.split_whitespace()
        .last()
        .is_some_and(|w| w.chars().all(|c| c.is_ascii_digit()))
}
