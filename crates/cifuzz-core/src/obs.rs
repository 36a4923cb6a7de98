//! Structured observability hooks for the fuzzing pipeline.
//!
//! Each pipeline step emits one `info!` event tagged with an `event` field, so
//! log consumers can follow a run without parsing free text. [`run_span`]
//! scopes everything logged during a step under the project name.

use tracing::{info, warn, Span};

use crate::classify::Verdict;

/// Span scoping one pipeline step of a project.
///
/// ```ignore
/// run_fuzzers(..).instrument(run_span("example", "run_fuzzers")).await
/// ```
pub fn run_span(project_name: &str, step: &str) -> Span {
    tracing::info_span!("cifuzz.run", project = %project_name, step = %step)
}

pub fn emit_build_finished(project_name: &str, sanitizer: &str, success: bool, duration_ms: u64) {
    info!(
        event = "build.finished",
        project = %project_name,
        sanitizer = %sanitizer,
        success = success,
        duration_ms = duration_ms,
    );
}

pub fn emit_build_checked(out_dir: &str, sanitizer: &str, passed: bool) {
    info!(
        event = "build.checked",
        out_dir = %out_dir,
        sanitizer = %sanitizer,
        passed = passed,
    );
}

/// Emit event: a fuzz target started with its time slice.
pub fn emit_fuzz_started(target: &str, max_total_time: u64, remaining_targets: usize) {
    info!(
        event = "fuzz.started",
        target = %target,
        max_total_time = max_total_time,
        remaining_targets = remaining_targets,
    );
}

/// Emit event: a fuzz target crashed.
pub fn emit_crash_detected(target: &str, crash_type: Option<&str>, testcase: Option<&str>) {
    warn!(
        event = "fuzz.crash_detected",
        target = %target,
        crash_type = crash_type.unwrap_or("unknown"),
        testcase = testcase.unwrap_or("none"),
    );
}

/// Emit event: a crash was classified.
pub fn emit_bug_classified(target: &str, verdict: &Verdict) {
    match verdict {
        Verdict::BaselineUnavailable { reason } => info!(
            event = "bug.classified",
            target = %target,
            verdict = verdict.as_str(),
            reason = %reason,
        ),
        _ => info!(
            event = "bug.classified",
            target = %target,
            verdict = verdict.as_str(),
        ),
    }
}

/// Emit event: the fuzzing step ended.
pub fn emit_fuzz_finished(targets_run: usize, bug_found: bool, duration_ms: u64) {
    info!(
        event = "fuzz.finished",
        targets_run = targets_run,
        bug_found = bug_found,
        duration_ms = duration_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _entered = run_span("example", "build_fuzzers").entered();
    }

    #[test]
    fn test_emitters_without_subscriber() {
        emit_crash_detected("do_stuff_fuzzer", None, None);
        emit_bug_classified(
            "do_stuff_fuzzer",
            &Verdict::BaselineUnavailable {
                reason: "offline".to_string(),
            },
        );
    }
}
