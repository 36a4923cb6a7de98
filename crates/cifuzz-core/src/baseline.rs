//! Baseline builds: the latest known-good build of a project, used as the
//! comparison point when deciding whether a crash is new.

use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::Sanitizer;
use crate::error::BaselineError;

pub const GCS_BASE_URL: &str = "https://storage.googleapis.com";
pub const CLUSTERFUZZ_BUILDS: &str = "clusterfuzz-builds";

/// Directory (inside the output directory) a downloaded baseline unpacks to.
pub const BASELINE_DIR_NAME: &str = "oss_fuzz_latest";

/// Supplies the directory holding the baseline build's fuzz targets.
#[async_trait]
pub trait BaselineProvider: Send + Sync {
    /// Return the baseline build directory for `project_name`, fetching it
    /// into `out_dir` if needed.
    async fn fetch(
        &self,
        project_name: &str,
        sanitizer: Sanitizer,
        out_dir: &Path,
    ) -> Result<PathBuf, BaselineError>;
}

/// A baseline build that already sits on disk.
#[derive(Debug, Clone)]
pub struct LocalBaseline {
    dir: PathBuf,
}

impl LocalBaseline {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl BaselineProvider for LocalBaseline {
    async fn fetch(
        &self,
        _project_name: &str,
        _sanitizer: Sanitizer,
        _out_dir: &Path,
    ) -> Result<PathBuf, BaselineError> {
        if self.dir.is_dir() {
            Ok(self.dir.clone())
        } else {
            Err(BaselineError::MissingDir(self.dir.clone()))
        }
    }
}

/// No baseline at all; every classification that needs one is inconclusive.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBaseline;

#[async_trait]
impl BaselineProvider for NoBaseline {
    async fn fetch(
        &self,
        project_name: &str,
        _sanitizer: Sanitizer,
        _out_dir: &Path,
    ) -> Result<PathBuf, BaselineError> {
        Err(BaselineError::NotPublished(project_name.to_string()))
    }
}

/// Downloads the latest ClusterFuzz build of a project.
#[derive(Debug, Clone)]
pub struct ClusterFuzzBaseline {
    client: reqwest::Client,
    base_url: String,
}

impl Default for ClusterFuzzBaseline {
    fn default() -> Self {
        Self::new(GCS_BASE_URL)
    }
}

impl ClusterFuzzBaseline {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// URL of the file naming the latest build archive.
    pub fn latest_version_url(&self, project_name: &str, sanitizer: Sanitizer) -> String {
        format!(
            "{}/{CLUSTERFUZZ_BUILDS}/{project_name}/{project_name}-{sanitizer}-latest.version",
            self.base_url
        )
    }

    /// URL of the build archive `version`.
    pub fn build_url(&self, project_name: &str, version: &str) -> String {
        format!(
            "{}/{CLUSTERFUZZ_BUILDS}/{project_name}/{version}",
            self.base_url
        )
    }

    async fn latest_version(
        &self,
        project_name: &str,
        sanitizer: Sanitizer,
    ) -> Result<String, BaselineError> {
        let url = self.latest_version_url(project_name, sanitizer);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            warn!(url = %url, status = %response.status(), "No latest build version");
            return Err(BaselineError::NotPublished(project_name.to_string()));
        }
        let version = response.text().await?.trim().to_string();
        if version.is_empty() {
            return Err(BaselineError::NotPublished(project_name.to_string()));
        }
        Ok(version)
    }
}

#[async_trait]
impl BaselineProvider for ClusterFuzzBaseline {
    async fn fetch(
        &self,
        project_name: &str,
        sanitizer: Sanitizer,
        out_dir: &Path,
    ) -> Result<PathBuf, BaselineError> {
        let dest = out_dir.join(BASELINE_DIR_NAME);
        if dir_has_entries(&dest) {
            return Ok(dest);
        }

        let version = self.latest_version(project_name, sanitizer).await?;
        let url = self.build_url(project_name, &version);
        info!(url = %url, "Downloading baseline build");
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(BaselineError::Http(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        let archive = response.bytes().await?.to_vec();

        let out_dir = out_dir.to_path_buf();
        tokio::task::spawn_blocking(move || install_archive(&archive, &out_dir))
            .await
            .map_err(|e| BaselineError::Archive(e.to_string()))?
    }
}

/// Unpack a baseline archive into `<out_dir>/oss_fuzz_latest`.
///
/// The archive is unpacked into a staging directory next to the destination
/// and renamed into place only once every entry is written, so a failed
/// unpack never leaves a partial baseline behind.
pub fn install_archive(data: &[u8], out_dir: &Path) -> Result<PathBuf, BaselineError> {
    let dest = out_dir.join(BASELINE_DIR_NAME);
    let staging = tempfile::Builder::new()
        .prefix(&format!(".{BASELINE_DIR_NAME}-"))
        .tempdir_in(out_dir)?;
    unpack_zip(data, staging.path())?;

    if dest.exists() {
        fs::remove_dir_all(&dest)?;
    }
    fs::rename(staging.path(), &dest)?;
    Ok(dest)
}

fn dir_has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Unpack a zip archive into `dest`, keeping unix permissions.
///
/// Entries whose names escape `dest` are skipped.
pub fn unpack_zip(data: &[u8], dest: &Path) -> Result<(), BaselineError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
    fs::create_dir_all(dest)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!(name = %entry.name(), "Skipping archive entry outside destination");
            continue;
        };
        let path = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&path)?;
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&path)?;
        io::copy(&mut entry, &mut file)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
            }
        }
    }
    Ok(())
}
