//! Error taxonomy for the fuzzing pipeline.
//!
//! Only contract violations surface as `Err`. Broken builds, missing targets and
//! similar infra conditions are ordinary negative results (`false`).

use std::path::PathBuf;

/// Errors raised while constructing a [`RunConfig`](crate::config::RunConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown configuration field: {0}")]
    UnknownField(String),

    #[error("missing required configuration field: {0}")]
    MissingField(&'static str),

    #[error("invalid sanitizer: {0} (expected address, memory or undefined)")]
    InvalidSanitizer(String),

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Fatal pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum CifuzzError {
    #[error("no commit reference to build: commit SHA is empty and no pull request ref is set")]
    MissingCommitReference,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Failures of the container backend itself (not of the command it ran).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("empty container command")]
    EmptyCommand,

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("container command timed out after {0}s")]
    Timeout(u64),

    #[error("container failed to start (exit code {exit_code})")]
    ContainerLaunch { exit_code: i32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that prevent a reproducibility check from running at all.
#[derive(Debug, thiserror::Error)]
pub enum ReproduceError {
    #[error("target not found: {0}")]
    TargetNotFound(PathBuf),

    #[error("test case not found: {0}")]
    TestCaseNotFound(PathBuf),

    #[error("replay exited with code {exit_code} without a crash report")]
    NoCrashReport { exit_code: i32 },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Errors fetching or unpacking a baseline build.
#[derive(Debug, thiserror::Error)]
pub enum BaselineError {
    #[error("no baseline build published for {0}")]
    NotPublished(String),

    #[error("baseline directory not found: {0}")]
    MissingDir(PathBuf),

    #[error("http error: {0}")]
    Http(String),

    #[error("invalid baseline archive: {0}")]
    Archive(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for BaselineError {
    fn from(err: reqwest::Error) -> Self {
        BaselineError::Http(err.to_string())
    }
}

impl From<zip::result::ZipError> for BaselineError {
    fn from(err: zip::result::ZipError) -> Self {
        BaselineError::Archive(err.to_string())
    }
}

/// Errors from resolving and checking out project sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("could not determine repository for project {0}")]
    UnknownRepository(String),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
