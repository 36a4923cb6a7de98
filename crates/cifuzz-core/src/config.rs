//! Run configuration: the immutable value threaded through one pipeline run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CifuzzError, ConfigError};

/// Default fuzzing budget when none is configured.
pub const DEFAULT_FUZZ_SECONDS: u64 = 600;

/// Sanitizer a project is built with.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Sanitizer {
    #[default]
    Address,
    Memory,
    Undefined,
}

impl Sanitizer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sanitizer::Address => "address",
            Sanitizer::Memory => "memory",
            Sanitizer::Undefined => "undefined",
        }
    }
}

impl fmt::Display for Sanitizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sanitizer {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "address" => Ok(Sanitizer::Address),
            "memory" => Ok(Sanitizer::Memory),
            "undefined" => Ok(Sanitizer::Undefined),
            other => Err(ConfigError::InvalidSanitizer(other.to_string())),
        }
    }
}

/// What to check out before building.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutRef {
    /// A pull request merge ref, e.g. `refs/pull/1757/merge`.
    PullRequest(String),
    /// A commit SHA (or any rev git accepts).
    Commit(String),
}

/// Configuration for one pipeline invocation.
///
/// Built once through [`RunConfigBuilder`] and only read afterwards; there are
/// no setters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunConfig {
    project_name: String,
    project_repo_name: String,
    workspace: PathBuf,
    sanitizer: Sanitizer,
    commit_sha: Option<String>,
    pr_ref: Option<String>,
    base_ref: Option<String>,
    project_src_path: Option<PathBuf>,
    build_integration_path: Option<PathBuf>,
    fuzz_seconds: u64,
    allowed_broken_targets_percentage: Option<u8>,
    dry_run: bool,
}

impl RunConfig {
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn project_repo_name(&self) -> &str {
        &self.project_repo_name
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn sanitizer(&self) -> Sanitizer {
        self.sanitizer
    }

    pub fn commit_sha(&self) -> Option<&str> {
        self.commit_sha.as_deref()
    }

    pub fn pr_ref(&self) -> Option<&str> {
        self.pr_ref.as_deref()
    }

    pub fn base_ref(&self) -> Option<&str> {
        self.base_ref.as_deref()
    }

    pub fn project_src_path(&self) -> Option<&Path> {
        self.project_src_path.as_deref()
    }

    pub fn build_integration_path(&self) -> Option<&Path> {
        self.build_integration_path.as_deref()
    }

    pub fn fuzz_seconds(&self) -> u64 {
        self.fuzz_seconds
    }

    pub fn allowed_broken_targets_percentage(&self) -> Option<u8> {
        self.allowed_broken_targets_percentage
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Directory the build writes fuzz targets into.
    pub fn out_dir(&self) -> PathBuf {
        self.workspace.join("out")
    }

    /// Directory sources are cloned into.
    pub fn storage_dir(&self) -> PathBuf {
        self.workspace.join("storage")
    }

    /// Whether the project carries its own build integration instead of
    /// living in the OSS-Fuzz projects tree.
    pub fn is_external(&self) -> bool {
        self.build_integration_path.is_some()
    }

    /// Resolve the ref to check out.
    ///
    /// An empty commit SHA, or no commit and no pull request, is a caller bug.
    pub fn checkout_ref(&self) -> Result<CheckoutRef, CifuzzError> {
        match (self.commit_sha.as_deref(), self.pr_ref.as_deref()) {
            (Some(""), _) => Err(CifuzzError::MissingCommitReference),
            (_, Some(pr_ref)) if !pr_ref.is_empty() => {
                Ok(CheckoutRef::PullRequest(pr_ref.to_string()))
            }
            (Some(sha), _) => Ok(CheckoutRef::Commit(sha.to_string())),
            (None, _) => Err(CifuzzError::MissingCommitReference),
        }
    }
}

/// Builder over the fixed [`RunConfig`] schema.
#[derive(Debug, Clone, Default)]
pub struct RunConfigBuilder {
    project_name: Option<String>,
    project_repo_name: Option<String>,
    workspace: Option<PathBuf>,
    sanitizer: Sanitizer,
    commit_sha: Option<String>,
    pr_ref: Option<String>,
    base_ref: Option<String>,
    project_src_path: Option<PathBuf>,
    build_integration_path: Option<PathBuf>,
    fuzz_seconds: Option<u64>,
    allowed_broken_targets_percentage: Option<u8>,
    dry_run: bool,
}

impl RunConfigBuilder {
    /// Field names accepted by [`RunConfigBuilder::set`].
    pub const FIELDS: &'static [&'static str] = &[
        "project_name",
        "project_repo_name",
        "workspace",
        "sanitizer",
        "commit_sha",
        "pr_ref",
        "base_ref",
        "project_src_path",
        "build_integration_path",
        "fuzz_seconds",
        "allowed_broken_targets_percentage",
        "dry_run",
    ];

    pub fn project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = Some(name.into());
        self
    }

    pub fn project_repo_name(mut self, name: impl Into<String>) -> Self {
        self.project_repo_name = Some(name.into());
        self
    }

    pub fn workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace = Some(path.into());
        self
    }

    pub fn sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn commit_sha(mut self, sha: impl Into<String>) -> Self {
        self.commit_sha = Some(sha.into());
        self
    }

    pub fn pr_ref(mut self, pr_ref: impl Into<String>) -> Self {
        self.pr_ref = Some(pr_ref.into());
        self
    }

    pub fn base_ref(mut self, base_ref: impl Into<String>) -> Self {
        self.base_ref = Some(base_ref.into());
        self
    }

    pub fn project_src_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_src_path = Some(path.into());
        self
    }

    pub fn build_integration_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.build_integration_path = Some(path.into());
        self
    }

    pub fn fuzz_seconds(mut self, seconds: u64) -> Self {
        self.fuzz_seconds = Some(seconds);
        self
    }

    pub fn allowed_broken_targets_percentage(mut self, percentage: u8) -> Self {
        self.allowed_broken_targets_percentage = Some(percentage);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set a field by name, e.g. from a CI environment mapping.
    ///
    /// Unknown names are rejected here rather than ignored.
    pub fn set(self, key: &str, value: impl Into<String>) -> Result<Self, ConfigError> {
        let value = value.into();
        let builder = match key {
            "project_name" => self.project_name(value),
            "project_repo_name" => self.project_repo_name(value),
            "workspace" => self.workspace(value),
            "sanitizer" => self.sanitizer(value.parse()?),
            "commit_sha" => self.commit_sha(value),
            "pr_ref" => self.pr_ref(value),
            "base_ref" => self.base_ref(value),
            "project_src_path" => self.project_src_path(value),
            "build_integration_path" => self.build_integration_path(value),
            "fuzz_seconds" => {
                let seconds = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    field: "fuzz_seconds",
                    value: value.clone(),
                })?;
                self.fuzz_seconds(seconds)
            }
            "allowed_broken_targets_percentage" => {
                let percentage = parse_percentage(&value)?;
                self.allowed_broken_targets_percentage(percentage)
            }
            "dry_run" => {
                let dry_run = parse_bool(&value).ok_or_else(|| ConfigError::InvalidValue {
                    field: "dry_run",
                    value: value.clone(),
                })?;
                self.dry_run(dry_run)
            }
            other => return Err(ConfigError::UnknownField(other.to_string())),
        };
        Ok(builder)
    }

    pub fn build(self) -> Result<RunConfig, ConfigError> {
        let project_name = self
            .project_name
            .filter(|name| !name.is_empty())
            .ok_or(ConfigError::MissingField("project_name"))?;
        let workspace = self
            .workspace
            .ok_or(ConfigError::MissingField("workspace"))?;
        if let Some(percentage) = self.allowed_broken_targets_percentage {
            if percentage > 100 {
                return Err(ConfigError::InvalidValue {
                    field: "allowed_broken_targets_percentage",
                    value: percentage.to_string(),
                });
            }
        }
        let project_repo_name = self
            .project_repo_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| project_name.clone());

        Ok(RunConfig {
            project_name,
            project_repo_name,
            workspace,
            sanitizer: self.sanitizer,
            commit_sha: self.commit_sha,
            pr_ref: self.pr_ref.filter(|r| !r.is_empty()),
            base_ref: self.base_ref.filter(|r| !r.is_empty()),
            project_src_path: self.project_src_path,
            build_integration_path: self.build_integration_path,
            fuzz_seconds: self.fuzz_seconds.unwrap_or(DEFAULT_FUZZ_SECONDS),
            allowed_broken_targets_percentage: self.allowed_broken_targets_percentage,
            dry_run: self.dry_run,
        })
    }
}

fn parse_percentage(value: &str) -> Result<u8, ConfigError> {
    value
        .trim()
        .parse::<u8>()
        .ok()
        .filter(|p| *p <= 100)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: "allowed_broken_targets_percentage",
            value: value.to_string(),
        })
}

/// Parse the boolean spellings CI systems use.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
