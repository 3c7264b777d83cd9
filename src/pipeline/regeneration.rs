//! Bounded generate → verify → regenerate loop.
//!
//! ```text
//! Generating(n) → Verifying(n) ─┬→ Accepted
//!                               ├→ Regenerating(n) → Generating(n+1)
//!                               └→ Failed
//! ```
//!
//! The verdict for each attempt comes from [`decide`], a pure function of
//! the report, the attempt number and the policy. The controller only
//! sequences calls and keeps the attempt history.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use super::citation::VerificationReport;
use super::events::{EventSink, PipelineEvent};
use super::types::{
    ConsolidatedResult, GenerationAttempt, UnverifiableEscalation, Verdict, VerificationMode,
    VerificationPolicy,
};
use super::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ControllerState {
    Generating { attempt: u32 },
    Verifying { attempt: u32 },
    Regenerating { attempt: u32 },
    Accepted,
    Failed,
}

impl ControllerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Failed)
    }
}

/// Whether the unverifiable share alone rejects the result.
pub fn escalates(report: &VerificationReport, policy: &VerificationPolicy) -> bool {
    match policy.unverifiable_escalation {
        UnverifiableEscalation::Never => false,
        UnverifiableEscalation::AboveRatio(ratio) => {
            report.summary.unverifiable > 0 && report.unverifiable_ratio() > ratio
        }
    }
}

pub fn decide(report: &VerificationReport, attempt: u32, policy: &VerificationPolicy) -> Verdict {
    if policy.mode == VerificationMode::Lenient {
        return Verdict::Accepted;
    }
    if !report.has_failures() && !escalates(report, policy) {
        return Verdict::Accepted;
    }
    if attempt < policy.max_attempts {
        Verdict::Regenerate
    } else {
        Verdict::Failed
    }
}

/// Citations the next attempt must avoid: failing ones, plus unverifiable
/// ones when they triggered the rejection.
pub fn rejected_citations(report: &VerificationReport, policy: &VerificationPolicy) -> Vec<String> {
    let mut rejected = report.failing_citations();
    if escalates(report, policy) {
        rejected.extend(report.unverifiable_citations());
    }
    rejected
}

/// The two halves of one attempt. The orchestrator implements this over the
/// consolidator and verifier; tests script it directly.
#[async_trait]
pub trait AttemptRunner: Send + Sync {
    /// Produce a candidate. `avoid` accumulates rejected citations from all
    /// earlier attempts and is empty on the first.
    async fn generate(&self, attempt: u32, avoid: &[String]) -> Result<ConsolidatedResult, PipelineError>;

    async fn verify(&self, attempt: u32, result: &ConsolidatedResult) -> Result<VerificationReport, PipelineError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerOutcome {
    /// `Accepted` or `Failed`.
    pub verdict: Verdict,
    pub attempts: Vec<GenerationAttempt>,
    pub history: Vec<ControllerState>,
}

impl ControllerOutcome {
    pub fn final_attempt(&self) -> Option<&GenerationAttempt> {
        self.attempts.last()
    }
}

pub struct RegenerationController {
    policy: VerificationPolicy,
    events: EventSink,
}

impl RegenerationController {
    pub fn new(policy: VerificationPolicy, events: EventSink) -> Result<Self, PipelineError> {
        policy.validate().map_err(PipelineError::InvalidConfig)?;
        Ok(Self { policy, events })
    }

    pub fn policy(&self) -> &VerificationPolicy {
        &self.policy
    }

    pub async fn run(&self, runner: &dyn AttemptRunner) -> Result<ControllerOutcome, PipelineError> {
        let mut attempts = Vec::new();
        let mut avoid: Vec<String> = Vec::new();
        let mut attempt = 1;
        let mut history = vec![ControllerState::Generating { attempt }];

        loop {
            self.events.emit(PipelineEvent::AttemptStarted { attempt });
            tracing::info!(attempt, max_attempts = self.policy.max_attempts, avoid = avoid.len(), "Generation attempt started");
            let started_at = Utc::now();

            let result = runner.generate(attempt, &avoid).await?;
            history.push(ControllerState::Verifying { attempt });

            let report = runner.verify(attempt, &result).await?;
            let verdict = decide(&report, attempt, &self.policy);

            self.events.emit(PipelineEvent::AttemptVerified {
                attempt,
                failing: report.summary.failing(),
                unverifiable: report.summary.unverifiable,
            });
            tracing::info!(
                attempt,
                citations = report.summary.total,
                failing = report.summary.failing(),
                unverifiable = report.summary.unverifiable,
                ?verdict,
                "Attempt verified"
            );

            let rejected = match verdict {
                Verdict::Regenerate => rejected_citations(&report, &self.policy),
                _ => Vec::new(),
            };

            attempts.push(GenerationAttempt {
                attempt_number: attempt,
                consolidated_result: result,
                verification_report: report,
                verdict,
                started_at,
                finished_at: Utc::now(),
            });

            match verdict {
                Verdict::Accepted | Verdict::Failed => {
                    history.push(if verdict == Verdict::Accepted {
                        ControllerState::Accepted
                    } else {
                        ControllerState::Failed
                    });
                    if verdict == Verdict::Failed {
                        tracing::warn!(attempts = attempt, "Regeneration budget exhausted");
                    }
                    return Ok(ControllerOutcome {
                        verdict,
                        attempts,
                        history,
                    });
                }
                Verdict::Regenerate => {
                    for citation in rejected {
                        if !avoid.contains(&citation) {
                            avoid.push(citation);
                        }
                    }
                    history.push(ControllerState::Regenerating { attempt });
                    attempt += 1;
                    history.push(ControllerState::Generating { attempt });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::pipeline::citation::{
        Citation, CitationKind, VerificationOutcome, VerificationStatus,
    };
    use crate::pipeline::gateway::Usage;

    fn outcome(text: &str, status: VerificationStatus) -> VerificationOutcome {
        VerificationOutcome::new(
            Citation {
                raw_text: text.into(),
                normalized_form: text.into(),
                kind: CitationKind::Case,
                span: 0..text.len(),
            },
            status,
        )
    }

    fn report(statuses: &[(&str, VerificationStatus)]) -> VerificationReport {
        VerificationReport::from_outcomes(statuses.iter().map(|(t, s)| outcome(t, *s)).collect())
    }

    use VerificationStatus::*;

    /// Returns one scripted report per attempt (last repeats) and records
    /// the avoid list each generation received.
    struct ScriptedRunner {
        reports: Vec<VerificationReport>,
        seen_avoid: Mutex<Vec<Vec<String>>>,
        verify_calls: Mutex<usize>,
    }

    impl ScriptedRunner {
        fn new(reports: Vec<VerificationReport>) -> Self {
            Self {
                reports,
                seen_avoid: Mutex::new(Vec::new()),
                verify_calls: Mutex::new(0),
            }
        }

        fn generations(&self) -> Vec<Vec<String>> {
            self.seen_avoid.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AttemptRunner for ScriptedRunner {
        async fn generate(&self, attempt: u32, avoid: &[String]) -> Result<ConsolidatedResult, PipelineError> {
            self.seen_avoid.lock().unwrap().push(avoid.to_vec());
            Ok(ConsolidatedResult {
                content: format!("draft {attempt}"),
                partial_count: 1,
                passthrough: false,
                usage: Usage::default(),
            })
        }

        async fn verify(&self, _attempt: u32, _result: &ConsolidatedResult) -> Result<VerificationReport, PipelineError> {
            let mut calls = self.verify_calls.lock().unwrap();
            let report = self
                .reports
                .get(*calls)
                .or(self.reports.last())
                .cloned()
                .unwrap_or_default();
            *calls += 1;
            Ok(report)
        }
    }

    // ── decide ───────────────────────────────────────────────

    #[test]
    fn clean_report_is_accepted() {
        let r = report(&[("A v B [2000] AC 1", Verified)]);
        assert_eq!(decide(&r, 1, &VerificationPolicy::strict(3)), Verdict::Accepted);
        assert_eq!(decide(&VerificationReport::default(), 1, &VerificationPolicy::strict(1)), Verdict::Accepted);
    }

    #[test]
    fn failing_citations_regenerate_until_budget() {
        let r = report(&[("A v B [2000] AC 1", Verified), ("X v Y [2001] AC 9", NotFound)]);
        let policy = VerificationPolicy::strict(3);
        assert_eq!(decide(&r, 1, &policy), Verdict::Regenerate);
        assert_eq!(decide(&r, 2, &policy), Verdict::Regenerate);
        assert_eq!(decide(&r, 3, &policy), Verdict::Failed);

        let malformed = report(&[("Old v Older [1100] KB 4", Malformed)]);
        assert_eq!(decide(&malformed, 1, &VerificationPolicy::strict(1)), Verdict::Failed);
    }

    #[test]
    fn lenient_always_accepts() {
        let r = report(&[("X v Y [2001] AC 9", NotFound), ("Old v Older [1100] KB 4", Malformed)]);
        assert_eq!(decide(&r, 1, &VerificationPolicy::lenient(3)), Verdict::Accepted);
        let escalating = VerificationPolicy::lenient(3)
            .with_escalation(UnverifiableEscalation::AboveRatio(0.0));
        let u = report(&[("G v H [2002] AC 4", Unverifiable)]);
        assert_eq!(decide(&u, 1, &escalating), Verdict::Accepted);
    }

    #[test]
    fn unverifiable_alone_needs_escalation() {
        let r = report(&[
            ("A v B [2000] AC 1", Verified),
            ("G v H [2002] AC 4", Unverifiable),
            ("I v J [2003] AC 5", Unverifiable),
        ]);
        assert_eq!(decide(&r, 1, &VerificationPolicy::strict(2)), Verdict::Accepted);

        let above_half = VerificationPolicy::strict(2)
            .with_escalation(UnverifiableEscalation::AboveRatio(0.5));
        assert_eq!(decide(&r, 1, &above_half), Verdict::Regenerate);
        assert_eq!(decide(&r, 2, &above_half), Verdict::Failed);

        let above_most = VerificationPolicy::strict(2)
            .with_escalation(UnverifiableEscalation::AboveRatio(0.7));
        assert_eq!(decide(&r, 1, &above_most), Verdict::Accepted);
    }

    #[test]
    fn escalated_unverifiable_citations_join_feedback() {
        let r = report(&[("X v Y [2001] AC 9", NotFound), ("G v H [2002] AC 4", Unverifiable)]);
        let plain = VerificationPolicy::strict(2);
        assert_eq!(rejected_citations(&r, &plain), vec!["X v Y [2001] AC 9"]);

        let escalating = plain.with_escalation(UnverifiableEscalation::AboveRatio(0.25));
        assert_eq!(
            rejected_citations(&r, &escalating),
            vec!["X v Y [2001] AC 9", "G v H [2002] AC 4"]
        );
    }

    // ── run ──────────────────────────────────────────────────

    #[test]
    fn zero_max_attempts_is_invalid_config() {
        assert!(matches!(
            RegenerationController::new(VerificationPolicy::strict(0), EventSink::disabled()),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn regeneration_is_bounded_by_max_attempts() {
        for max_attempts in 1..=4 {
            let runner = ScriptedRunner::new(vec![report(&[("X v Y [2001] AC 9", NotFound)])]);
            let controller =
                RegenerationController::new(VerificationPolicy::strict(max_attempts), EventSink::disabled())
                    .unwrap();
            let outcome = controller.run(&runner).await.unwrap();

            assert_eq!(outcome.verdict, Verdict::Failed);
            assert_eq!(outcome.attempts.len(), max_attempts as usize);
            assert_eq!(runner.generations().len(), max_attempts as usize);
            assert_eq!(outcome.history.last(), Some(&ControllerState::Failed));
            let numbers: Vec<u32> = outcome.attempts.iter().map(|a| a.attempt_number).collect();
            assert_eq!(numbers, (1..=max_attempts).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn second_attempt_receives_feedback_and_is_accepted() {
        let runner = ScriptedRunner::new(vec![
            report(&[("A v B [2000] AC 1", Verified), ("X v Y [2001] AC 9", NotFound)]),
            report(&[("A v B [2000] AC 1", Verified)]),
        ]);
        let (events, mut rx) = EventSink::channel();
        let controller = RegenerationController::new(VerificationPolicy::strict(3), events).unwrap();
        let outcome = controller.run(&runner).await.unwrap();

        assert_eq!(outcome.verdict, Verdict::Accepted);
        assert_eq!(
            runner.generations(),
            vec![Vec::<String>::new(), vec!["X v Y [2001] AC 9".to_string()]]
        );
        assert_eq!(outcome.attempts[0].verdict, Verdict::Regenerate);
        assert_eq!(outcome.attempts[1].verdict, Verdict::Accepted);
        assert_eq!(outcome.final_attempt().unwrap().consolidated_result.content, "draft 2");
        assert_eq!(
            outcome.history,
            vec![
                ControllerState::Generating { attempt: 1 },
                ControllerState::Verifying { attempt: 1 },
                ControllerState::Regenerating { attempt: 1 },
                ControllerState::Generating { attempt: 2 },
                ControllerState::Verifying { attempt: 2 },
                ControllerState::Accepted,
            ]
        );

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                PipelineEvent::AttemptStarted { attempt: 1 },
                PipelineEvent::AttemptVerified { attempt: 1, failing: 1, unverifiable: 0 },
                PipelineEvent::AttemptStarted { attempt: 2 },
                PipelineEvent::AttemptVerified { attempt: 2, failing: 0, unverifiable: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn avoid_list_accumulates_without_duplicates() {
        let runner = ScriptedRunner::new(vec![
            report(&[("X v Y [2001] AC 9", NotFound)]),
            report(&[("X v Y [2001] AC 9", NotFound), ("P v Q [2005] AC 3", Malformed)]),
            report(&[]),
        ]);
        let controller =
            RegenerationController::new(VerificationPolicy::strict(3), EventSink::disabled()).unwrap();
        let outcome = controller.run(&runner).await.unwrap();

        assert_eq!(outcome.verdict, Verdict::Accepted);
        assert_eq!(
            runner.generations()[2],
            vec!["X v Y [2001] AC 9".to_string(), "P v Q [2005] AC 3".to_string()]
        );
    }

    #[tokio::test]
    async fn lenient_run_accepts_first_attempt() {
        let runner = ScriptedRunner::new(vec![report(&[("X v Y [2001] AC 9", NotFound)])]);
        let controller =
            RegenerationController::new(VerificationPolicy::lenient(3), EventSink::disabled()).unwrap();
        let outcome = controller.run(&runner).await.unwrap();
        assert_eq!(outcome.verdict, Verdict::Accepted);
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].verification_report.summary.not_found, 1);
    }

    #[tokio::test]
    async fn runner_errors_abort_the_loop() {
        struct Broken;

        #[async_trait]
        impl AttemptRunner for Broken {
            async fn generate(&self, _: u32, _: &[String]) -> Result<ConsolidatedResult, PipelineError> {
                Err(PipelineError::InvalidInput("boom".into()))
            }

            async fn verify(&self, _: u32, _: &ConsolidatedResult) -> Result<VerificationReport, PipelineError> {
                unreachable!()
            }
        }

        let controller =
            RegenerationController::new(VerificationPolicy::strict(3), EventSink::disabled()).unwrap();
        assert!(matches!(
            controller.run(&Broken).await,
            Err(PipelineError::InvalidInput(_))
        ));
    }
}
