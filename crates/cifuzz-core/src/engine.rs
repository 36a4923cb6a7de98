//! Fuzz execution engine.
//!
//! Runs every fuzz target in an output directory under one shared time
//! budget, and hands the first crash of each target to the parser and the
//! classifier.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn, Instrument};

use crate::classify::{classify_crash, Verdict};
use crate::config::Sanitizer;
use crate::docker::fuzz_invocation;
use crate::obs;
use crate::parser;
use crate::pipeline::CiFuzz;
use crate::target::{find_fuzz_targets, FuzzTarget};

/// Fixed libFuzzer flags for reproducible runs.
pub const LIBFUZZER_OPTIONS: &str = "-seed=1337 -len_control=0";

/// Grace period on top of a target's slice before the process is killed.
pub const BUFFER_TIME: Duration = Duration::from_secs(10);

/// Directory under the output directory holding per-target seed corpora.
pub const CORPUS_DIR: &str = "corpus";

static TESTCASE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bTest unit written to \./([^\s]+)").expect("valid test case regex")
});

/// A crash that was classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BugReport {
    pub target: String,
    pub crash_type: Option<String>,
    pub locations: Vec<String>,
    pub verdict: Verdict,
    pub summary_path: Option<PathBuf>,
    pub testcase: PathBuf,
}

/// Outcome of [`run_fuzzers`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FuzzRunResult {
    /// Whether fuzzing ran and reached a conclusion.
    pub run_succeeded: bool,

    /// Whether a new regression was found.
    pub bug_found: bool,

    /// Verdict of the crash that ended the run, if any.
    pub verdict: Option<Verdict>,

    pub bug_report: Option<BugReport>,

    pub targets_run: usize,
}

impl FuzzRunResult {
    fn failed() -> Self {
        Self::default()
    }

    pub fn as_tuple(&self) -> (bool, bool) {
        (self.run_succeeded, self.bug_found)
    }
}

/// Test case named in fuzzer output, resolved against `out_dir`.
pub fn find_testcase(output: &[u8], out_dir: &Path) -> Option<PathBuf> {
    let text = String::from_utf8_lossy(output);
    TESTCASE_LINE
        .captures(&text)
        .map(|caps| out_dir.join(&caps[1]))
}

/// Seconds each remaining target gets out of `remaining`.
fn slice_seconds(remaining: Duration, targets_left: usize) -> u64 {
    (remaining.as_secs() / targets_left.max(1) as u64).max(1)
}

/// Fuzz every target in `out_dir` within `total_time_seconds`.
///
/// Stops at the first new regression. An inconclusive classification also
/// stops the run and reports it as not succeeded, with the verdict attached.
pub async fn run_fuzzers(
    cifuzz: &CiFuzz,
    total_time_seconds: u64,
    out_dir: &Path,
    project_name: &str,
    sanitizer: Sanitizer,
) -> FuzzRunResult {
    fuzz_all(cifuzz, total_time_seconds, out_dir, project_name, sanitizer)
        .instrument(obs::run_span(project_name, "run_fuzzers"))
        .await
}

async fn fuzz_all(
    cifuzz: &CiFuzz,
    total_time_seconds: u64,
    out_dir: &Path,
    project_name: &str,
    sanitizer: Sanitizer,
) -> FuzzRunResult {
    let start = Instant::now();

    if total_time_seconds == 0 {
        error!("Fuzz time must be greater than zero");
        return FuzzRunResult::failed();
    }
    if !out_dir.is_dir() {
        error!(out_dir = %out_dir.display(), "Output directory does not exist");
        return FuzzRunResult::failed();
    }
    let targets = find_fuzz_targets(out_dir);
    if targets.is_empty() {
        error!(out_dir = %out_dir.display(), "No fuzz targets found");
        return FuzzRunResult::failed();
    }
    info!(count = targets.len(), total_time_seconds, "Fuzzing targets");

    let deadline = start + Duration::from_secs(total_time_seconds);
    let mut result = FuzzRunResult {
        run_succeeded: true,
        ..Default::default()
    };

    for (index, path) in targets.iter().enumerate() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            info!("Fuzzing budget exhausted");
            break;
        }
        let targets_left = targets.len() - index;
        let slice = slice_seconds(remaining, targets_left);
        let timeout = (Duration::from_secs(slice) + BUFFER_TIME).min(remaining);

        let target = FuzzTarget::new(path);
        let corpus = Path::new(CORPUS_DIR).join(target.name());
        let corpus = out_dir.join(&corpus).is_dir().then_some(corpus);
        let args = fuzz_invocation(
            cifuzz.context(),
            out_dir,
            sanitizer,
            target.name(),
            slice,
            corpus.as_deref(),
        );

        obs::emit_fuzz_started(target.name(), slice, targets_left);
        result.targets_run += 1;
        let output = match cifuzz.backend().run_captured(&args, timeout).await {
            Ok(output) => output,
            Err(e) => {
                error!(target = %target.name(), error = %e, "Could not run fuzz target");
                return finish(FuzzRunResult::failed(), start);
            }
        };

        if output.timed_out {
            info!(target = %target.name(), "Fuzzer reached its time limit without crashing");
            continue;
        }
        if output.exit_code == 0 {
            info!(target = %target.name(), "Fuzzer finished without crashing");
            continue;
        }

        if output.launch_failed() {
            error!(target = %target.name(), exit_code = output.exit_code, "Fuzz container failed to start");
            return finish(FuzzRunResult::failed(), start);
        }

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        if !parser::has_crash_marker(&combined) {
            error!(
                target = %target.name(),
                exit_code = output.exit_code,
                "Fuzzer exited with an error but reported no crash"
            );
            return finish(FuzzRunResult::failed(), start);
        }
        let Some(testcase) = find_testcase(&combined, out_dir) else {
            warn!(target = %target.name(), exit_code = output.exit_code, "Fuzzer crashed but no test case was written");
            continue;
        };

        let recorded = parser::record_crash(&combined, out_dir);
        obs::emit_crash_detected(
            target.name(),
            recorded.as_ref().map(|(summary, _)| summary.crash_type.as_str()),
            testcase.to_str(),
        );

        let verdict = match classify_crash(
            cifuzz.reproducer(),
            cifuzz.baseline(),
            &target,
            &testcase,
            project_name,
            sanitizer,
        )
        .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                error!(target = %target.name(), error = %e, "Could not classify crash");
                return finish(FuzzRunResult::failed(), start);
            }
        };

        match verdict {
            Verdict::NotReproducible | Verdict::PreExisting => continue,
            Verdict::NewRegression | Verdict::BaselineUnavailable { .. } => {
                let new = verdict.is_new();
                let (crash_type, locations, summary_path) = match recorded {
                    Some((summary, path)) => {
                        (Some(summary.crash_type), summary.locations, Some(path))
                    }
                    None => (None, Vec::new(), None),
                };
                result.run_succeeded = new;
                result.bug_found = new;
                result.verdict = Some(verdict.clone());
                result.bug_report = Some(BugReport {
                    target: target.name().to_string(),
                    crash_type,
                    locations,
                    verdict,
                    summary_path,
                    testcase,
                });
                return finish(result, start);
            }
        }
    }

    finish(result, start)
}

fn finish(result: FuzzRunResult, start: Instant) -> FuzzRunResult {
    obs::emit_fuzz_finished(
        result.targets_run,
        result.bug_found,
        start.elapsed().as_millis() as u64,
    );
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::baseline::{LocalBaseline, NoBaseline};
    use crate::docker::ContainerContext;
    use crate::error::ReproduceError;
    use crate::fakes::{crash_output, FakeBackend, FakeSource, ScriptedReproducer};
    use crate::target::test_support::write_executable;

    const CRASH: &str = "\
==11==ERROR: AddressSanitizer: heap-buffer-overflow on address 0x6020000000f1 at pc 0x5278a4
READ of size 1 at 0x6020000000f1 thread T0
    #0 0x5278a3 in DoStuff /src/example/my_api.cpp:26:10
    #1 0x526f13 in LLVMFuzzerTestOneInput /src/example/do_stuff_fuzzer.cpp:15:3

SUMMARY: AddressSanitizer: heap-buffer-overflow /src/example/my_api.cpp:26:10 in DoStuff
artifact_prefix='./'; Test unit written to ./crash-b8e7dae5e0e7f26f6e9b3d5a0e4b6e0a2ef6c8d1
";

    fn cifuzz(backend: &Arc<FakeBackend>, reproducer: ScriptedReproducer, baseline_dir: Option<&Path>) -> CiFuzz {
        let baseline: Arc<dyn crate::baseline::BaselineProvider> = match baseline_dir {
            Some(dir) => Arc::new(LocalBaseline::new(dir)),
            None => Arc::new(NoBaseline),
        };
        CiFuzz::new(
            backend.clone(),
            Arc::new(FakeSource::failing()),
            Arc::new(reproducer),
            baseline,
            ContainerContext::Host,
        )
    }

    fn out_with_targets(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            write_executable(dir.path(), name, b"");
        }
        dir
    }

    #[test]
    fn test_find_testcase() {
        let found = find_testcase(CRASH.as_bytes(), Path::new("/ws/out")).unwrap();
        assert_eq!(
            found,
            Path::new("/ws/out/crash-b8e7dae5e0e7f26f6e9b3d5a0e4b6e0a2ef6c8d1")
        );
        assert!(find_testcase(b"no test unit here", Path::new("/ws/out")).is_none());
    }

    #[test]
    fn test_slice_seconds() {
        assert_eq!(slice_seconds(Duration::from_secs(90), 3), 30);
        assert_eq!(slice_seconds(Duration::from_secs(2), 5), 1);
        assert_eq!(slice_seconds(Duration::from_secs(10), 0), 10);
    }

    #[tokio::test]
    async fn test_preconditions() {
        let backend = Arc::new(FakeBackend::new());
        let cf = cifuzz(&backend, ScriptedReproducer::default(), None);

        let out = out_with_targets(&["do_stuff_fuzzer"]);
        let result = run_fuzzers(&cf, 0, out.path(), "example", Sanitizer::Address).await;
        assert_eq!(result.as_tuple(), (false, false));

        let result = run_fuzzers(&cf, 10, Path::new("not/a/valid/path"), "example", Sanitizer::Address).await;
        assert_eq!(result.as_tuple(), (false, false));

        let empty = tempfile::tempdir().unwrap();
        let result = run_fuzzers(&cf, 10, empty.path(), "example", Sanitizer::Address).await;
        assert_eq!(result.as_tuple(), (false, false));

        assert!(backend.captured_calls().is_empty());
    }

    #[tokio::test]
    async fn test_clean_run() {
        let out = out_with_targets(&["a_fuzzer", "b_fuzzer"]);
        let backend = Arc::new(FakeBackend::new());
        let cf = cifuzz(&backend, ScriptedReproducer::default(), None);
        let result = run_fuzzers(&cf, 60, out.path(), "example", Sanitizer::Address).await;
        assert_eq!(result.as_tuple(), (true, false));
        assert_eq!(result.targets_run, 2);
        assert!(!out.path().join(parser::BUG_SUMMARY_FILE).exists());

        let calls = backend.captured_calls();
        assert!(calls[0].last().unwrap().starts_with("run_fuzzer a_fuzzer -seed=1337"));
        assert!(calls[1].last().unwrap().starts_with("run_fuzzer b_fuzzer"));
    }

    #[tokio::test]
    async fn test_new_regression_stops_run() {
        let out = out_with_targets(&["a_fuzzer", "b_fuzzer"]);
        let base = out.path().join("oss_fuzz_latest");
        std::fs::create_dir(&base).unwrap();
        write_executable(&base, "a_fuzzer", b"");

        let backend = Arc::new(FakeBackend::new().with_captured_outputs(vec![crash_output(CRASH)]));
        let reproducer = ScriptedReproducer::new(vec![Ok(true), Ok(false)]);
        let cf = cifuzz(&backend, reproducer, Some(base.as_path()));

        let result = run_fuzzers(&cf, 60, out.path(), "example", Sanitizer::Address).await;
        assert_eq!(result.as_tuple(), (true, true));
        assert_eq!(result.verdict, Some(Verdict::NewRegression));
        assert_eq!(backend.captured_calls().len(), 1, "b_fuzzer never runs");

        let report = result.bug_report.unwrap();
        assert_eq!(report.target, "a_fuzzer");
        assert_eq!(report.crash_type.as_deref(), Some("AddressSanitizer: heap-buffer-overflow"));
        let summary = std::fs::read_to_string(out.path().join(parser::BUG_SUMMARY_FILE)).unwrap();
        assert_eq!(
            summary,
            "AddressSanitizer: heap-buffer-overflow\n\
             #0 DoStuff /src/example/my_api.cpp:26:10\n\
             #1 LLVMFuzzerTestOneInput /src/example/do_stuff_fuzzer.cpp:15:3\n"
        );
    }

    #[tokio::test]
    async fn test_pre_existing_crash_continues() {
        let out = out_with_targets(&["a_fuzzer", "b_fuzzer"]);
        let base = out.path().join("oss_fuzz_latest");
        std::fs::create_dir(&base).unwrap();
        write_executable(&base, "a_fuzzer", b"");

        let backend = Arc::new(FakeBackend::new().with_captured_outputs(vec![crash_output(CRASH)]));
        let reproducer = ScriptedReproducer::new(vec![Ok(true), Ok(true)]);
        let cf = cifuzz(&backend, reproducer, Some(base.as_path()));

        let result = run_fuzzers(&cf, 60, out.path(), "example", Sanitizer::Address).await;
        assert_eq!(result.as_tuple(), (true, false));
        assert_eq!(backend.captured_calls().len(), 2);
        // The summary of a pre-existing crash stays on disk.
        assert!(out.path().join(parser::BUG_SUMMARY_FILE).exists());
    }

    #[tokio::test]
    async fn test_not_reproducible_crash_continues() {
        let out = out_with_targets(&["a_fuzzer"]);
        let backend = Arc::new(FakeBackend::new().with_captured_outputs(vec![crash_output(CRASH)]));
        let cf = cifuzz(&backend, ScriptedReproducer::new(vec![Ok(false)]), None);
        let result = run_fuzzers(&cf, 60, out.path(), "example", Sanitizer::Address).await;
        assert_eq!(result.as_tuple(), (true, false));
    }

    #[tokio::test]
    async fn test_unavailable_baseline_is_inconclusive() {
        let out = out_with_targets(&["a_fuzzer"]);
        let backend = Arc::new(FakeBackend::new().with_captured_outputs(vec![crash_output(CRASH)]));
        let cf = cifuzz(&backend, ScriptedReproducer::new(vec![Ok(true)]), None);
        let result = run_fuzzers(&cf, 60, out.path(), "example", Sanitizer::Address).await;
        assert_eq!(result.as_tuple(), (false, false));
        assert!(result.verdict.unwrap().is_inconclusive());
    }

    #[tokio::test]
    async fn test_candidate_reproduce_error_fails_run() {
        let out = out_with_targets(&["a_fuzzer"]);
        let backend = Arc::new(FakeBackend::new().with_captured_outputs(vec![crash_output(CRASH)]));
        let reproducer =
            ScriptedReproducer::new(vec![Err(ReproduceError::TestCaseNotFound("x".into()))]);
        let cf = cifuzz(&backend, reproducer, None);
        let result = run_fuzzers(&cf, 60, out.path(), "example", Sanitizer::Address).await;
        assert_eq!(result.as_tuple(), (false, false));
    }

    #[tokio::test]
    async fn test_crash_without_testcase_is_not_a_bug() {
        let out = out_with_targets(&["a_fuzzer"]);
        let backend = Arc::new(
            FakeBackend::new().with_captured_outputs(vec![crash_output("==1==ERROR: libFuzzer: deadly signal\n")]),
        );
        let reproducer = ScriptedReproducer::default();
        let cf = cifuzz(&backend, reproducer, None);
        let result = run_fuzzers(&cf, 60, out.path(), "example", Sanitizer::Address).await;
        assert_eq!(result.as_tuple(), (true, false));
    }

    #[tokio::test]
    async fn test_container_launch_failure_fails_run() {
        for exit_code in [125, 126, 127] {
            let out = out_with_targets(&["a_fuzzer", "b_fuzzer"]);
            let backend = Arc::new(FakeBackend::new().with_captured_exit_codes(vec![exit_code]));
            let cf = cifuzz(&backend, ScriptedReproducer::default(), None);
            let result = run_fuzzers(&cf, 60, out.path(), "example", Sanitizer::Address).await;
            assert_eq!(result.as_tuple(), (false, false), "exit code {exit_code}");
            assert_eq!(backend.captured_calls().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_error_exit_without_crash_report_fails_run() {
        let out = out_with_targets(&["a_fuzzer"]);
        let backend = Arc::new(FakeBackend::new().with_captured_outputs(vec![crate::backend::ProcessOutput {
            exit_code: 1,
            stderr: b"/out/a_fuzzer: error while loading shared libraries\n".to_vec(),
            ..Default::default()
        }]));
        let reproducer = ScriptedReproducer::default();
        let cf = cifuzz(&backend, reproducer, None);
        let result = run_fuzzers(&cf, 60, out.path(), "example", Sanitizer::Address).await;
        assert_eq!(result.as_tuple(), (false, false));
        assert!(!out.path().join(parser::BUG_SUMMARY_FILE).exists());
    }

    #[tokio::test]
    async fn test_sanitizer_reaches_fuzz_invocation() {
        for sanitizer in [Sanitizer::Memory, Sanitizer::Undefined] {
            let out = out_with_targets(&["a_fuzzer"]);
            let backend = Arc::new(FakeBackend::new());
            let cf = cifuzz(&backend, ScriptedReproducer::default(), None);
            let result = run_fuzzers(&cf, 60, out.path(), "example", sanitizer).await;
            assert_eq!(result.as_tuple(), (true, false));

            let expected = format!("SANITIZER={sanitizer}");
            let calls = backend.captured_calls();
            assert!(
                calls[0].windows(2).any(|pair| pair[0] == "-e" && pair[1] == expected),
                "{sanitizer}: {:?}",
                calls[0]
            );
        }
    }

    #[tokio::test]
    async fn test_memory_crash_is_classified() {
        let out = out_with_targets(&["a_fuzzer"]);
        let base = out.path().join("oss_fuzz_latest");
        std::fs::create_dir(&base).unwrap();
        write_executable(&base, "a_fuzzer", b"");
        let msan = "\
==3==WARNING: MemorySanitizer: use-of-uninitialized-value
    #0 0x49a1 in Check /src/curl/lib/url.c:100:5
    #1 0x49b2 in LLVMFuzzerTestOneInput /src/curl_fuzzer/curl_fuzzer.cc:30:3
Test unit written to ./crash-msan
";
        let backend = Arc::new(FakeBackend::new().with_captured_outputs(vec![crash_output(msan)]));
        let cf = cifuzz(&backend, ScriptedReproducer::new(vec![Ok(true), Ok(false)]), Some(base.as_path()));
        let result = run_fuzzers(&cf, 60, out.path(), "example", Sanitizer::Memory).await;
        assert_eq!(result.as_tuple(), (true, true));
        let report = result.bug_report.unwrap();
        assert_eq!(
            report.crash_type.as_deref(),
            Some("MemorySanitizer: use-of-uninitialized-value")
        );
        assert_eq!(report.testcase, out.path().join("crash-msan"));
    }

    #[tokio::test]
    async fn test_backend_failure_fails_run() {
        let out = out_with_targets(&["a_fuzzer"]);
        let backend = Arc::new(FakeBackend::new().unavailable());
        let cf = cifuzz(&backend, ScriptedReproducer::default(), None);
        let result = run_fuzzers(&cf, 60, out.path(), "example", Sanitizer::Address).await;
        assert_eq!(result.as_tuple(), (false, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corpus_dir_is_passed() {
        let out = out_with_targets(&["a_fuzzer"]);
        std::fs::create_dir_all(out.path().join("corpus/a_fuzzer")).unwrap();
        let backend = Arc::new(FakeBackend::new());
        let cf = cifuzz(&backend, ScriptedReproducer::default(), None);
        run_fuzzers(&cf, 60, out.path(), "example", Sanitizer::Address).await;
        assert!(backend.captured_calls()[0]
            .last()
            .unwrap()
            .ends_with("-max_total_time=60 /out/corpus/a_fuzzer"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_is_shared_and_capped() {
        let out = out_with_targets(&["a_fuzzer", "b_fuzzer", "c_fuzzer"]);
        let backend = Arc::new(FakeBackend::new().with_call_duration(Duration::from_secs(30)));
        let cf = cifuzz(&backend, ScriptedReproducer::default(), None);

        let result = run_fuzzers(&cf, 90, out.path(), "example", Sanitizer::Address).await;
        assert_eq!(result.as_tuple(), (true, false));
        assert_eq!(
            backend.captured_timeouts(),
            vec![
                Duration::from_secs(40),
                Duration::from_secs(40),
                Duration::from_secs(30)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unused_time_rolls_over() {
        let out = out_with_targets(&["a_fuzzer", "b_fuzzer"]);
        let backend = Arc::new(FakeBackend::new().with_call_duration(Duration::from_secs(5)));
        let cf = cifuzz(&backend, ScriptedReproducer::default(), None);

        run_fuzzers(&cf, 100, out.path(), "example", Sanitizer::Address).await;
        let calls = backend.captured_calls();
        assert!(calls[0].last().unwrap().ends_with("-max_total_time=50"));
        assert!(calls[1].last().unwrap().ends_with("-max_total_time=95"));
    }
}
