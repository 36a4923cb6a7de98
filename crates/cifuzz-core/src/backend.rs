//! Container execution backend.
//!
//! The pipeline only needs "run this container command and tell me how it
//! exited"; [`DockerBackend`] does that with the `docker` CLI.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::docker::{build_image_args, ProjectImage};
use crate::error::BackendError;

/// `docker run` exit codes meaning the command never ran: daemon or image
/// failure (125), command not executable (126), command not found (127).
pub const LAUNCH_FAILURE_EXIT_CODES: &[i32] = &[125, 126, 127];

/// Limit for `docker kill` on a timed-out container.
const KILL_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured result of a container command.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code (-1 when killed or terminated by a signal).
    pub exit_code: i32,

    pub stdout: Vec<u8>,

    pub stderr: Vec<u8>,

    pub duration_ms: u64,

    /// Whether the process was killed for exceeding its time limit.
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// Whether the container or its command failed to start.
    pub fn launch_failed(&self) -> bool {
        !self.timed_out && LAUNCH_FAILURE_EXIT_CODES.contains(&self.exit_code)
    }
}

/// Runs container commands on behalf of the pipeline.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Run a container with `args` (everything after `docker run`) and return
    /// its exit code. Output goes to the job log.
    async fn run(&self, args: &[String]) -> Result<i32, BackendError>;

    /// Run a container with `args`, capturing output. The container is
    /// killed once `timeout` elapses and the result is marked `timed_out`.
    async fn run_captured(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, BackendError>;

    /// Build the project image. Returns the exit code of the build.
    async fn build_image(&self, image: &ProjectImage) -> Result<i32, BackendError>;
}

/// Configuration for the Docker CLI backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DockerConfig {
    /// Path to the docker binary.
    pub docker_binary: String,

    /// OSS-Fuzz `projects/` directory holding internal project Dockerfiles.
    pub projects_dir: PathBuf,

    /// Limit for builds and validation passes, in seconds (0 = no limit).
    pub command_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            projects_dir: PathBuf::from("projects"),
            command_timeout_secs: 0,
        }
    }
}

/// [`ContainerBackend`] driving the `docker` CLI.
#[derive(Debug, Clone, Default)]
pub struct DockerBackend {
    config: DockerConfig,
}

impl DockerBackend {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    fn run_prefix() -> Vec<String> {
        vec![
            "run".to_string(),
            "--rm".to_string(),
            "--privileged".to_string(),
        ]
    }

    fn command_timeout(&self) -> Option<Duration> {
        (self.config.command_timeout_secs > 0)
            .then(|| Duration::from_secs(self.config.command_timeout_secs))
    }

    /// Stop a container whose `docker run` client was killed. The client
    /// dying does not stop the container itself.
    async fn kill_container(&self, name: &str) {
        let command = vec![
            self.config.docker_binary.clone(),
            "kill".to_string(),
            name.to_string(),
        ];
        match execute_captured(&command, KILL_TIMEOUT).await {
            Ok(output) if output.success() => info!(container = %name, "Killed timed-out container"),
            Ok(output) => warn!(
                container = %name,
                exit_code = output.exit_code,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Could not kill timed-out container"
            ),
            Err(e) => warn!(container = %name, error = %e, "Could not kill timed-out container"),
        }
    }
}

/// Unique name for a container the backend may have to kill.
fn container_name() -> String {
    format!("cifuzz-{}", uuid::Uuid::new_v4().simple())
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn run(&self, args: &[String]) -> Result<i32, BackendError> {
        let mut command = vec![self.config.docker_binary.clone()];
        command.extend(Self::run_prefix());
        command.extend_from_slice(args);
        execute_inherited(&command, self.command_timeout()).await
    }

    async fn run_captured(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, BackendError> {
        let name = container_name();
        let mut command = vec![self.config.docker_binary.clone()];
        command.extend(Self::run_prefix());
        command.push("--name".to_string());
        command.push(name.clone());
        command.extend_from_slice(args);

        let output = execute_captured(&command, timeout).await?;
        if output.timed_out {
            self.kill_container(&name).await;
        }
        Ok(output)
    }

    async fn build_image(&self, image: &ProjectImage) -> Result<i32, BackendError> {
        let mut command = vec![self.config.docker_binary.clone(), "build".to_string()];
        command.extend(build_image_args(image, &self.config.projects_dir));
        execute_inherited(&command, self.command_timeout()).await
    }
}

/// Run `command` with output streamed to our own stdout/stderr.
pub async fn execute_inherited(
    command: &[String],
    timeout: Option<Duration>,
) -> Result<i32, BackendError> {
    let (exe, args) = command.split_first().ok_or(BackendError::EmptyCommand)?;
    info!(command = %command.join(" "), "Running command");

    let mut child = Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| BackendError::Spawn {
            program: exe.clone(),
            source,
        })?;

    let status = match timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait())
            .await
            .map_err(|_| BackendError::Timeout(limit.as_secs()))??,
        None => child.wait().await?,
    };

    Ok(status.code().unwrap_or(-1))
}

/// Run `command` capturing stdout and stderr, killing it after `timeout`.
pub async fn execute_captured(
    command: &[String],
    timeout: Duration,
) -> Result<ProcessOutput, BackendError> {
    let start = Instant::now();
    let (exe, args) = command.split_first().ok_or(BackendError::EmptyCommand)?;
    debug!(command = %command.join(" "), timeout_secs = timeout.as_secs(), "Running command");

    let child = Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| BackendError::Spawn {
            program: exe.clone(),
            source,
        })?;

    // Dropping the wait future on timeout drops the child, which kills it.
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(ProcessOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: output.stderr,
                duration_ms: start.elapsed().as_millis() as u64,
                timed_out: false,
            })
        }
        Err(_) => Ok(ProcessOutput {
            exit_code: -1,
            stdout: Vec::new(),
            stderr: Vec::new(),
            duration_ms: start.elapsed().as_millis() as u64,
            timed_out: true,
        }),
    }
}
