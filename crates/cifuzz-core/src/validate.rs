//! Build validation: make sure freshly built fuzz targets actually run.

use std::path::Path;

use tracing::{error, info};

use crate::backend::ContainerBackend;
use crate::config::Sanitizer;
use crate::docker::{check_build_invocation, ContainerContext};
use crate::obs;
use crate::target::find_fuzz_targets;

/// Run the `test_all` validation pass over the targets in `out_dir`.
///
/// `false` when `out_dir` is missing, holds no fuzz targets, the pass fails or
/// the backend cannot launch it.
pub async fn check_fuzzer_build(
    backend: &dyn ContainerBackend,
    context: &ContainerContext,
    out_dir: &Path,
    sanitizer: Sanitizer,
    allowed_broken_targets_percentage: Option<u8>,
) -> bool {
    let passed = validate(
        backend,
        context,
        out_dir,
        sanitizer,
        allowed_broken_targets_percentage,
    )
    .await;
    obs::emit_build_checked(&out_dir.display().to_string(), sanitizer.as_str(), passed);
    passed
}

async fn validate(
    backend: &dyn ContainerBackend,
    context: &ContainerContext,
    out_dir: &Path,
    sanitizer: Sanitizer,
    allowed_broken_targets_percentage: Option<u8>,
) -> bool {
    if !out_dir.is_dir() {
        error!(out_dir = %out_dir.display(), "Output directory does not exist");
        return false;
    }
    let targets = find_fuzz_targets(out_dir);
    if targets.is_empty() {
        error!(out_dir = %out_dir.display(), "No fuzz targets found");
        return false;
    }
    info!(count = targets.len(), "Checking fuzz target build");

    let args = check_build_invocation(
        context,
        out_dir,
        sanitizer,
        allowed_broken_targets_percentage,
    );
    match backend.run(&args).await {
        Ok(0) => true,
        Ok(code) => {
            error!(exit_code = code, "Check build failed");
            false
        }
        Err(e) => {
            error!(error = %e, "Could not run check build");
            false
        }
    }
}
