//! Project source checkout.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{CheckoutRef, RunConfig};
use crate::error::SourceError;

/// Directory sources live under inside build images.
pub const IMAGE_SRC_DIR: &str = "/src";

/// Where the checked-out repository is on the host and inside the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedOutSource {
    pub host_repo_path: PathBuf,
    pub image_repo_path: PathBuf,
}

impl CheckedOutSource {
    /// Pair `host_repo_path` with the image path it replaces.
    ///
    /// The build copies the host directory into `/src`, so the image path
    /// shares its directory name.
    pub fn for_host_path(host_repo_path: impl Into<PathBuf>) -> Self {
        let host_repo_path = host_repo_path.into();
        let name = host_repo_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        Self {
            image_repo_path: Path::new(IMAGE_SRC_DIR).join(name),
            host_repo_path,
        }
    }
}

/// Makes the project's sources available on the host.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Check out `checkout` for the project described by `config`.
    async fn checkout(
        &self,
        config: &RunConfig,
        checkout: &CheckoutRef,
    ) -> Result<CheckedOutSource, SourceError>;
}

/// [`SourceProvider`] using a local source tree or a `git` clone.
#[derive(Debug, Clone)]
pub struct GitSourceProvider {
    git_binary: String,
    repository_url: Option<String>,
}

impl Default for GitSourceProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

impl GitSourceProvider {
    /// `repository_url` is cloned when the run has no local source path.
    pub fn new(repository_url: Option<String>) -> Self {
        Self {
            git_binary: "git".to_string(),
            repository_url,
        }
    }

    pub fn with_git_binary(mut self, git_binary: impl Into<String>) -> Self {
        self.git_binary = git_binary.into();
        self
    }

    async fn git(&self, repo: Option<&Path>, args: &[&str]) -> Result<(), SourceError> {
        let mut command = Command::new(&self.git_binary);
        if let Some(dir) = repo {
            command.current_dir(dir);
        }
        let output = command
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SourceError::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn checkout_ref(&self, repo: &Path, checkout: &CheckoutRef) -> Result<(), SourceError> {
        match checkout {
            CheckoutRef::PullRequest(pr_ref) => {
                self.git(Some(repo), &["fetch", "origin", pr_ref]).await?;
                self.git(Some(repo), &["checkout", "-f", "FETCH_HEAD"]).await
            }
            CheckoutRef::Commit(sha) => {
                // Shallow or stale clones may not have the commit yet.
                if let Err(e) = self.git(Some(repo), &["fetch", "origin", sha]).await {
                    warn!(error = %e, "Fetching commit failed; trying local objects");
                }
                self.git(Some(repo), &["checkout", "-f", sha]).await
            }
        }
    }
}

#[async_trait]
impl SourceProvider for GitSourceProvider {
    async fn checkout(
        &self,
        config: &RunConfig,
        checkout: &CheckoutRef,
    ) -> Result<CheckedOutSource, SourceError> {
        if let Some(src) = config.project_src_path() {
            info!(path = %src.display(), "Using local project source");
            return Ok(CheckedOutSource::for_host_path(src));
        }

        let url = self
            .repository_url
            .as_deref()
            .ok_or_else(|| SourceError::UnknownRepository(config.project_name().to_string()))?;
        let storage = config.storage_dir();
        let host_repo_path = storage.join(config.project_repo_name());

        if !host_repo_path.join(".git").exists() {
            tokio::fs::create_dir_all(&storage).await?;
            let dest = host_repo_path.display().to_string();
            info!(url = %url, dest = %dest, "Cloning project repository");
            self.git(None, &["clone", url, &dest]).await?;
        }

        if let Err(e) = self.checkout_ref(&host_repo_path, checkout).await {
            warn!(error = %e, "Checkout failed; building the current state of the repository");
        }
        Ok(CheckedOutSource::for_host_path(host_repo_path))
    }
}
