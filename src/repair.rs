//! Generate → validate → repair loop around an unreliable generator.

use std::fmt::{Debug, Display};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::validation::ValidationResult;

/// Attempt budget for `check_risk` snippets.
pub const CODE_ATTEMPTS: u32 = 3;
/// Attempt budget for rule objects: the first draft plus one repair.
pub const RULE_ATTEMPTS: u32 = 2;

/// What the generator is told when an earlier attempt was rejected.
#[derive(Debug, Clone)]
pub struct RepairFeedback<A> {
    /// 1-based number of the attempt about to be generated.
    pub attempt: u32,
    pub previous: A,
    pub validation: ValidationResult,
}

/// Produces one candidate per call. `feedback` is `None` on the first attempt.
#[async_trait]
pub trait ArtifactGenerator: Send + Sync {
    type Artifact: Clone + Debug + Send + Sync;
    type Error: Display + Send;

    async fn generate(
        &self,
        feedback: Option<&RepairFeedback<Self::Artifact>>,
    ) -> Result<Self::Artifact, Self::Error>;
}

pub trait ArtifactValidator<A>: Send + Sync {
    fn validate(&self, artifact: &A) -> ValidationResult;
}

impl<A, F> ArtifactValidator<A> for F
where
    F: Fn(&A) -> ValidationResult + Send + Sync,
{
    fn validate(&self, artifact: &A) -> ValidationResult {
        self(artifact)
    }
}

#[derive(Debug, Clone)]
pub enum RepairOutcome<A> {
    Accepted { artifact: A, attempts: u32 },
    /// Every attempt produced an artifact, none of them valid.
    Exhausted { attempts: u32, last: A, validation: ValidationResult },
    /// The generator itself failed; no further attempts were made.
    GenerationFailed { attempts: u32, reason: String },
}

impl<A> RepairOutcome<A> {
    pub fn attempts(&self) -> u32 {
        match self {
            RepairOutcome::Accepted { attempts, .. }
            | RepairOutcome::Exhausted { attempts, .. }
            | RepairOutcome::GenerationFailed { attempts, .. } => *attempts,
        }
    }

    pub fn accepted(self) -> Option<A> {
        match self {
            RepairOutcome::Accepted { artifact, .. } => Some(artifact),
            _ => None,
        }
    }

    /// Human-readable reason for a non-accepted outcome.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            RepairOutcome::Accepted { .. } => None,
            RepairOutcome::Exhausted { attempts, validation, .. } => Some(format!(
                "validation failed after {} attempts: {}",
                attempts,
                validation.summary()
            )),
            RepairOutcome::GenerationFailed { attempts, reason } => {
                Some(format!("generation failed on attempt {}: {}", attempts, reason))
            }
        }
    }
}

/// Run up to `max_attempts` (at least one) generate/validate rounds.
pub async fn run_repair_loop<G, V>(
    generator: &G,
    validator: &V,
    max_attempts: u32,
    label: &str,
) -> RepairOutcome<G::Artifact>
where
    G: ArtifactGenerator + ?Sized,
    V: ArtifactValidator<G::Artifact> + ?Sized,
{
    let max_attempts = max_attempts.max(1);
    let mut feedback: Option<RepairFeedback<G::Artifact>> = None;
    let mut attempt = 1;

    loop {
        if attempt == 1 {
            info!("{}: generating (attempt {}/{})", label, attempt, max_attempts);
        } else {
            info!("{}: repairing (attempt {}/{})", label, attempt, max_attempts);
        }

        let artifact = match generator.generate(feedback.as_ref()).await {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!("{}: generation failed on attempt {}: {}", label, attempt, e);
                return RepairOutcome::GenerationFailed { attempts: attempt, reason: e.to_string() };
            }
        };

        let validation = validator.validate(&artifact);
        if validation.is_valid {
            info!("{}: accepted on attempt {}", label, attempt);
            return RepairOutcome::Accepted { artifact, attempts: attempt };
        }

        warn!("{}: attempt {} invalid: {}", label, attempt, validation.summary());
        if attempt == max_attempts {
            warn!("{}: giving up after {} attempts", label, attempt);
            return RepairOutcome::Exhausted { attempts: attempt, last: artifact, validation };
        }
        attempt += 1;
        feedback = Some(RepairFeedback { attempt, previous: artifact, validation });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Scripted {
        outputs: Mutex<Vec<Result<String, String>>>,
        seen: Mutex<Vec<Option<(u32, String)>>>,
    }

    impl Scripted {
        fn new(outputs: Vec<Result<&str, &str>>) -> Self {
            let outputs = outputs
                .into_iter()
                .rev()
                .map(|r| r.map(str::to_string).map_err(str::to_string))
                .collect();
            Self { outputs: Mutex::new(outputs), seen: Mutex::new(Vec::new()) }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ArtifactGenerator for Scripted {
        type Artifact = String;
        type Error = String;

        async fn generate(&self, feedback: Option<&RepairFeedback<String>>) -> Result<String, String> {
            self.seen
                .lock()
                .unwrap()
                .push(feedback.map(|f| (f.attempt, f.previous.clone())));
            self.outputs.lock().unwrap().pop().unwrap_or_else(|| Ok("fallback".to_string()))
        }
    }

    fn accepts_ok(artifact: &String) -> ValidationResult {
        if artifact == "ok" {
            ValidationResult::valid()
        } else {
            ValidationResult::from_findings(vec![format!("{} is not ok", artifact)], vec!["say ok".into()])
        }
    }

    #[tokio::test]
    async fn valid_first_attempt_generates_once() {
        let generator = Scripted::new(vec![Ok("ok")]);
        let outcome = run_repair_loop(&generator, &accepts_ok, 3, "test").await;
        assert!(matches!(outcome, RepairOutcome::Accepted { attempts: 1, .. }));
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn always_invalid_uses_exact_budget() {
        let generator = Scripted::new(vec![Ok("a"), Ok("b"), Ok("c"), Ok("d")]);
        let outcome = run_repair_loop(&generator, &accepts_ok, 3, "test").await;
        match outcome {
            RepairOutcome::Exhausted { attempts, last, validation } => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "c");
                assert_eq!(validation.issues, vec!["c is not ok".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(generator.calls(), 3);
    }

    #[tokio::test]
    async fn repair_attempts_see_previous_artifact() {
        let generator = Scripted::new(vec![Ok("draft"), Ok("ok")]);
        let outcome = run_repair_loop(&generator, &accepts_ok, 2, "test").await;
        assert!(matches!(outcome, RepairOutcome::Accepted { attempts: 2, ref artifact } if artifact == "ok"));
        let seen = generator.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![None, Some((2, "draft".to_string()))]);
    }

    #[tokio::test]
    async fn generation_failure_stops_the_loop() {
        let generator = Scripted::new(vec![Ok("bad"), Err("llm down"), Ok("ok")]);
        let outcome = run_repair_loop(&generator, &accepts_ok, 3, "test").await;
        assert!(matches!(outcome, RepairOutcome::GenerationFailed { attempts: 2, .. }));
        assert!(outcome.failure_reason().unwrap_or_default().contains("llm down"));
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test]
    async fn zero_budget_still_tries_once() {
        let generator = Scripted::new(vec![Ok("nope")]);
        let outcome = run_repair_loop(&generator, &accepts_ok, 0, "test").await;
        assert_eq!(outcome.attempts(), 1);
        assert!(outcome.accepted().is_none());
    }
}
