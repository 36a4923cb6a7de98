//! Differential bug classification.
//!
//! A crash found on the candidate build is replayed there first, then against
//! the same target in the latest baseline build. Only a crash that reproduces
//! on the candidate and not on the baseline is a new regression.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::ContainerBackend;
use crate::baseline::BaselineProvider;
use crate::config::Sanitizer;
use crate::docker::{reproduce_invocation, ContainerContext};
use crate::error::{BackendError, ReproduceError};
use crate::obs;
use crate::parser;
use crate::target::FuzzTarget;

/// Times a test case is replayed before it is called flaky.
pub const REPRODUCE_ATTEMPTS: u32 = 10;

/// libFuzzer `-runs` per replay attempt.
pub const REPRODUCE_RUNS: u32 = 100;

/// Per-attempt limit for a replay.
pub const REPRODUCE_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome of classifying a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Did not reproduce on the candidate build; not reported.
    NotReproducible,
    /// Reproduces on both builds; the change did not introduce it.
    PreExisting,
    /// Reproduces on the candidate build only.
    NewRegression,
    /// Reproduces on the candidate build but the baseline could not be run.
    BaselineUnavailable { reason: String },
}

impl Verdict {
    /// Whether the crash is attributed to the change under test.
    pub fn is_new(&self) -> bool {
        matches!(self, Verdict::NewRegression)
    }

    /// Whether classification could not reach a decision.
    pub fn is_inconclusive(&self) -> bool {
        matches!(self, Verdict::BaselineUnavailable { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::NotReproducible => "not_reproducible",
            Verdict::PreExisting => "pre_existing",
            Verdict::NewRegression => "new_regression",
            Verdict::BaselineUnavailable { .. } => "baseline_unavailable",
        }
    }
}

/// Replays a test case against a target binary.
#[async_trait]
pub trait Reproducer: Send + Sync {
    /// Whether `testcase` makes the target at `target_path` crash.
    async fn is_reproducible(
        &self,
        target_path: &Path,
        testcase: &Path,
    ) -> Result<bool, ReproduceError>;
}

/// [`Reproducer`] running the base-runner `reproduce` script in a container.
pub struct ContainerReproducer {
    backend: Arc<dyn ContainerBackend>,
    context: ContainerContext,
    attempts: u32,
    timeout: Duration,
}

impl ContainerReproducer {
    pub fn new(backend: Arc<dyn ContainerBackend>, context: ContainerContext) -> Self {
        Self {
            backend,
            context,
            attempts: REPRODUCE_ATTEMPTS,
            timeout: REPRODUCE_TIMEOUT,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }
}

#[async_trait]
impl Reproducer for ContainerReproducer {
    async fn is_reproducible(
        &self,
        target_path: &Path,
        testcase: &Path,
    ) -> Result<bool, ReproduceError> {
        if !target_path.is_file() {
            return Err(ReproduceError::TargetNotFound(target_path.to_path_buf()));
        }
        if !testcase.is_file() {
            return Err(ReproduceError::TestCaseNotFound(testcase.to_path_buf()));
        }
        let target = FuzzTarget::new(target_path);
        let args = reproduce_invocation(
            &self.context,
            target.out_dir(),
            target.name(),
            testcase,
            REPRODUCE_RUNS,
        );

        for attempt in 1..=self.attempts {
            let output = self.backend.run_captured(&args, self.timeout).await?;
            if output.success() {
                continue;
            }
            // A replay outliving its limit is a hung container, not a crash.
            if output.timed_out {
                return Err(BackendError::Timeout(self.timeout.as_secs()).into());
            }
            if output.launch_failed() {
                return Err(BackendError::ContainerLaunch {
                    exit_code: output.exit_code,
                }
                .into());
            }
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            if !parser::has_crash_marker(&combined) {
                return Err(ReproduceError::NoCrashReport {
                    exit_code: output.exit_code,
                });
            }
            info!(
                target = %target_path.display(),
                attempt,
                exit_code = output.exit_code,
                "Reproducible"
            );
            return Ok(true);
        }
        info!(target = %target_path.display(), "Reproduce command returned 0; not reproducible");
        Ok(false)
    }
}

/// Decide whether the crash `testcase` triggered in `target` is new.
///
/// Candidate-side failures (missing target or test case, backend errors) are
/// returned as `Err`. Baseline-side failures become
/// [`Verdict::BaselineUnavailable`], never a guess in either direction.
pub async fn classify_crash(
    reproducer: &dyn Reproducer,
    baseline: &dyn BaselineProvider,
    target: &FuzzTarget,
    testcase: &Path,
    project_name: &str,
    sanitizer: Sanitizer,
) -> Result<Verdict, ReproduceError> {
    let verdict = decide(reproducer, baseline, target, testcase, project_name, sanitizer).await?;
    obs::emit_bug_classified(target.name(), &verdict);
    Ok(verdict)
}

async fn decide(
    reproducer: &dyn Reproducer,
    baseline: &dyn BaselineProvider,
    target: &FuzzTarget,
    testcase: &Path,
    project_name: &str,
    sanitizer: Sanitizer,
) -> Result<Verdict, ReproduceError> {
    if !target.is_reproducible(reproducer, testcase).await? {
        info!(target = %target.name(), "Failed to reproduce the crash using the obtained test case");
        return Ok(Verdict::NotReproducible);
    }

    let baseline_dir = match baseline
        .fetch(project_name, sanitizer, target.out_dir())
        .await
    {
        Ok(dir) => dir,
        Err(e) => {
            return Ok(Verdict::BaselineUnavailable {
                reason: format!("baseline build unavailable: {e}"),
            })
        }
    };

    let Some(file_name) = target.path().file_name() else {
        return Ok(Verdict::BaselineUnavailable {
            reason: "target has no file name".to_string(),
        });
    };
    let baseline_target = FuzzTarget::new(baseline_dir.join(file_name));
    if !baseline_target.path().is_file() {
        return Ok(Verdict::BaselineUnavailable {
            reason: format!("target {} not present in baseline build", target.name()),
        });
    }

    match baseline_target.is_reproducible(reproducer, testcase).await {
        Ok(true) => Ok(Verdict::PreExisting),
        Ok(false) => Ok(Verdict::NewRegression),
        Err(e) => Ok(Verdict::BaselineUnavailable {
            reason: format!("baseline target failed to run: {e}"),
        }),
    }
}
