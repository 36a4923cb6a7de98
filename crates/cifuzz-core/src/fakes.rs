//! In-memory fakes for the pipeline's collaborators (testing only)
//!
//! Provides `FakeBackend`, `ScriptedReproducer` and `FakeSource`, which record
//! what they were asked to do and answer from a script instead of launching
//! containers or touching git.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{ContainerBackend, ProcessOutput};
use crate::classify::Reproducer;
use crate::config::{CheckoutRef, RunConfig};
use crate::docker::ProjectImage;
use crate::error::{BackendError, ReproduceError, SourceError};
use crate::source::{CheckedOutSource, SourceProvider};

/// A crashed fuzzer run whose stderr is `stderr`.
pub fn crash_output(stderr: &str) -> ProcessOutput {
    ProcessOutput {
        exit_code: 1,
        stderr: stderr.as_bytes().to_vec(),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// FakeBackend
// ---------------------------------------------------------------------------

/// Scripted [`ContainerBackend`].
///
/// Each kind of call pops its next answer from a queue; an empty queue
/// answers with a clean exit.
#[derive(Debug, Default)]
pub struct FakeBackend {
    run_exit_codes: Mutex<VecDeque<i32>>,
    captured_outputs: Mutex<VecDeque<ProcessOutput>>,
    build_exit_codes: Mutex<VecDeque<i32>>,
    call_duration: Option<Duration>,
    unavailable: bool,

    run_calls: Mutex<Vec<Vec<String>>>,
    captured_calls: Mutex<Vec<Vec<String>>>,
    captured_timeouts: Mutex<Vec<Duration>>,
    built_images: Mutex<Vec<ProjectImage>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit codes for successive `run` calls.
    pub fn with_run_exit_codes(self, codes: Vec<i32>) -> Self {
        *self.run_exit_codes.lock().unwrap() = codes.into();
        self
    }

    /// Exit codes for successive `run_captured` calls, with empty output.
    pub fn with_captured_exit_codes(self, codes: Vec<i32>) -> Self {
        let outputs = codes
            .into_iter()
            .map(|exit_code| ProcessOutput {
                exit_code,
                ..Default::default()
            })
            .collect();
        self.with_captured_outputs(outputs)
    }

    /// Outputs for successive `run_captured` calls.
    pub fn with_captured_outputs(self, outputs: Vec<ProcessOutput>) -> Self {
        *self.captured_outputs.lock().unwrap() = outputs.into();
        self
    }

    /// Exit codes for successive `build_image` calls.
    pub fn with_build_exit_codes(self, codes: Vec<i32>) -> Self {
        *self.build_exit_codes.lock().unwrap() = codes.into();
        self
    }

    /// Make each `run_captured` call take `duration` of (tokio) time. Calls
    /// whose timeout is shorter are cut off and reported as timed out.
    pub fn with_call_duration(mut self, duration: Duration) -> Self {
        self.call_duration = Some(duration);
        self
    }

    /// Fail every call as if docker could not be launched.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn run_calls(&self) -> Vec<Vec<String>> {
        self.run_calls.lock().unwrap().clone()
    }

    pub fn captured_calls(&self) -> Vec<Vec<String>> {
        self.captured_calls.lock().unwrap().clone()
    }

    pub fn captured_timeouts(&self) -> Vec<Duration> {
        self.captured_timeouts.lock().unwrap().clone()
    }

    pub fn built_images(&self) -> Vec<ProjectImage> {
        self.built_images.lock().unwrap().clone()
    }

    /// Total number of containers launched or images built.
    pub fn total_calls(&self) -> usize {
        self.run_calls().len() + self.captured_calls().len() + self.built_images().len()
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.unavailable {
            return Err(BackendError::Spawn {
                program: "docker".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "docker not installed"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    async fn run(&self, args: &[String]) -> Result<i32, BackendError> {
        self.run_calls.lock().unwrap().push(args.to_vec());
        self.check_available()?;
        Ok(self.run_exit_codes.lock().unwrap().pop_front().unwrap_or(0))
    }

    async fn run_captured(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, BackendError> {
        self.captured_calls.lock().unwrap().push(args.to_vec());
        self.captured_timeouts.lock().unwrap().push(timeout);
        self.check_available()?;

        let mut output = self
            .captured_outputs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        if let Some(duration) = self.call_duration {
            if duration >= timeout {
                tokio::time::sleep(timeout).await;
                return Ok(ProcessOutput {
                    exit_code: -1,
                    duration_ms: timeout.as_millis() as u64,
                    timed_out: true,
                    ..Default::default()
                });
            }
            tokio::time::sleep(duration).await;
            output.duration_ms = duration.as_millis() as u64;
        }
        Ok(output)
    }

    async fn build_image(&self, image: &ProjectImage) -> Result<i32, BackendError> {
        self.built_images.lock().unwrap().push(image.clone());
        self.check_available()?;
        Ok(self.build_exit_codes.lock().unwrap().pop_front().unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// ScriptedReproducer
// ---------------------------------------------------------------------------

/// [`Reproducer`] answering from a script, in call order.
///
/// Once the script runs out every answer is `Ok(false)`.
#[derive(Debug, Default)]
pub struct ScriptedReproducer {
    answers: Mutex<VecDeque<Result<bool, ReproduceError>>>,
    calls: Mutex<Vec<(PathBuf, PathBuf)>>,
}

impl ScriptedReproducer {
    pub fn new(answers: Vec<Result<bool, ReproduceError>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(target_path, testcase)` of every call so far.
    pub fn calls(&self) -> Vec<(PathBuf, PathBuf)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reproducer for ScriptedReproducer {
    async fn is_reproducible(
        &self,
        target_path: &Path,
        testcase: &Path,
    ) -> Result<bool, ReproduceError> {
        self.calls
            .lock()
            .unwrap()
            .push((target_path.to_path_buf(), testcase.to_path_buf()));
        self.answers.lock().unwrap().pop_front().unwrap_or(Ok(false))
    }
}

// ---------------------------------------------------------------------------
// FakeSource
// ---------------------------------------------------------------------------

/// [`SourceProvider`] that hands out a fixed directory.
#[derive(Debug)]
pub struct FakeSource {
    source: Option<CheckedOutSource>,
    checkouts: Mutex<Vec<CheckoutRef>>,
}

impl FakeSource {
    /// Check-outs resolve to `host_repo_path`.
    pub fn new(host_repo_path: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(CheckedOutSource::for_host_path(host_repo_path)),
            checkouts: Mutex::new(Vec::new()),
        }
    }

    /// Every checkout fails.
    pub fn failing() -> Self {
        Self {
            source: None,
            checkouts: Mutex::new(Vec::new()),
        }
    }

    pub fn checkouts(&self) -> Vec<CheckoutRef> {
        self.checkouts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceProvider for FakeSource {
    async fn checkout(
        &self,
        config: &RunConfig,
        checkout: &CheckoutRef,
    ) -> Result<CheckedOutSource, SourceError> {
        self.checkouts.lock().unwrap().push(checkout.clone());
        self.source
            .clone()
            .ok_or_else(|| SourceError::UnknownRepository(config.project_name().to_string()))
    }
}
