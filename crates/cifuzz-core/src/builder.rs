//! Building a project's fuzzers in its build image.

use std::path::Path;
use std::time::Instant;

use tracing::{error, info, Instrument};

use crate::config::{CheckoutRef, RunConfig};
use crate::docker::{build_fuzzers_invocation, ProjectImage};
use crate::error::CifuzzError;
use crate::obs;
use crate::pipeline::CiFuzz;
use crate::source::{CheckedOutSource, IMAGE_SRC_DIR};

/// Image the fuzzers of `config` are built in.
pub fn project_image(config: &RunConfig, source: &CheckedOutSource) -> ProjectImage {
    match config.build_integration_path() {
        Some(integration) => ProjectImage::External {
            dockerfile: source.host_repo_path.join(integration).join("Dockerfile"),
            context: source.host_repo_path.clone(),
        },
        None => ProjectImage::Internal {
            project_name: config.project_name().to_string(),
        },
    }
}

/// Check out the change under test and compile its fuzz targets into
/// `<workspace>/out`.
///
/// `Err` only for a run with nothing to build (no commit and no pull
/// request). Every other failure is `Ok(false)`.
pub async fn build_fuzzers(cifuzz: &CiFuzz, config: &RunConfig) -> Result<bool, CifuzzError> {
    let checkout = config.checkout_ref()?;
    let start = Instant::now();

    let built = build(cifuzz, config, &checkout)
        .instrument(obs::run_span(config.project_name(), "build_fuzzers"))
        .await;
    obs::emit_build_finished(
        config.project_name(),
        config.sanitizer().as_str(),
        built,
        start.elapsed().as_millis() as u64,
    );
    Ok(built)
}

async fn build(cifuzz: &CiFuzz, config: &RunConfig, checkout: &CheckoutRef) -> bool {
    let workspace = config.workspace();
    if !workspace.is_dir() {
        error!(workspace = %workspace.display(), "Workspace does not exist");
        return false;
    }
    if let Some(src) = config.project_src_path() {
        if !src.is_dir() {
            error!(path = %src.display(), "Project source path does not exist");
            return false;
        }
    }

    let out_dir = config.out_dir();
    if let Err(e) = tokio::fs::create_dir_all(&out_dir).await {
        error!(out_dir = %out_dir.display(), error = %e, "Could not create output directory");
        return false;
    }

    let mut source = match cifuzz.source().checkout(config, checkout).await {
        Ok(source) => source,
        Err(e) => {
            error!(error = %e, "Could not check out project source");
            return false;
        }
    };
    if config.is_external() {
        source.image_repo_path = Path::new(IMAGE_SRC_DIR).join(config.project_repo_name());
    }

    let image = project_image(config, &source);
    info!(image = %image.tag(), "Building project image");
    match cifuzz.backend().build_image(&image).await {
        Ok(0) => {}
        Ok(code) => {
            error!(exit_code = code, image = %image.tag(), "Building project image failed");
            return false;
        }
        Err(e) => {
            error!(error = %e, "Could not build project image");
            return false;
        }
    }

    let args = build_fuzzers_invocation(
        cifuzz.context(),
        config.sanitizer(),
        &image,
        &out_dir,
        &source.host_repo_path,
        &source.image_repo_path,
    );
    match cifuzz.backend().run(&args).await {
        Ok(0) => {
            info!(out_dir = %out_dir.display(), "Fuzzers built");
            true
        }
        Ok(code) => {
            error!(exit_code = code, "Building fuzzers failed");
            false
        }
        Err(e) => {
            error!(error = %e, "Could not run fuzzer build");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::baseline::NoBaseline;
    use crate::docker::ContainerContext;
    use crate::fakes::{FakeBackend, FakeSource, ScriptedReproducer};

    struct Harness {
        backend: Arc<FakeBackend>,
        source: Arc<FakeSource>,
        cifuzz: CiFuzz,
    }

    fn harness(backend: FakeBackend, source: FakeSource) -> Harness {
        let backend = Arc::new(backend);
        let source = Arc::new(source);
        let cifuzz = CiFuzz::new(
            backend.clone(),
            source.clone(),
            Arc::new(ScriptedReproducer::default()),
            Arc::new(NoBaseline),
            ContainerContext::Host,
        );
        Harness {
            backend,
            source,
            cifuzz,
        }
    }

    fn config(workspace: &Path) -> crate::config::RunConfigBuilder {
        RunConfig::builder()
            .project_name("example")
            .workspace(workspace)
    }

    #[tokio::test]
    async fn test_empty_commit_is_fatal_before_any_launch() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(FakeBackend::new(), FakeSource::new(dir.path().join("example")));
        let config = config(dir.path()).commit_sha("").build().unwrap();
        let err = build_fuzzers(&h.cifuzz, &config).await.unwrap_err();
        assert!(matches!(err, CifuzzError::MissingCommitReference));
        assert_eq!(h.backend.total_calls(), 0);
        assert!(h.source.checkouts().is_empty());
    }

    #[tokio::test]
    async fn test_missing_workspace_is_soft_failure() {
        let h = harness(FakeBackend::new(), FakeSource::new("/unused"));
        let config = config(Path::new("not/a/valid/path"))
            .commit_sha("0b95fe1039ed7c38fea1f97078316bfc5030c523")
            .build()
            .unwrap();
        assert!(!build_fuzzers(&h.cifuzz, &config).await.unwrap());
        assert_eq!(h.backend.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_project_src_path_is_soft_failure() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(FakeBackend::new(), FakeSource::new("/unused"));
        let config = config(dir.path())
            .commit_sha("0b95fe1039ed7c38fea1f97078316bfc5030c523")
            .project_src_path(dir.path().join("missing"))
            .build()
            .unwrap();
        assert!(!build_fuzzers(&h.cifuzz, &config).await.unwrap());
        assert_eq!(h.backend.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_internal_build_pull_request() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("storage/example");
        let h = harness(FakeBackend::new(), FakeSource::new(&repo));
        let config = config(dir.path())
            .pr_ref("refs/pull/1757/merge")
            .build()
            .unwrap();

        assert!(build_fuzzers(&h.cifuzz, &config).await.unwrap());
        assert!(dir.path().join("out").is_dir());
        assert_eq!(
            h.source.checkouts(),
            vec![CheckoutRef::PullRequest("refs/pull/1757/merge".to_string())]
        );
        assert_eq!(
            h.backend.built_images(),
            vec![ProjectImage::Internal {
                project_name: "example".to_string()
            }]
        );

        let args = &h.backend.run_calls()[0];
        assert!(args.windows(2).any(|p| p[0] == "-e" && p[1] == "CIFUZZ=True"));
        assert!(args.contains(&"gcr.io/oss-fuzz/example".to_string()));
        assert_eq!(
            args.last().unwrap(),
            &format!("rm -rf /src/example && cp -r {} /src && compile", repo.display())
        );
    }

    #[tokio::test]
    async fn test_external_build_uses_repo_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("storage/external-project-repo");
        let h = harness(FakeBackend::new(), FakeSource::new(&repo));
        let config = config(dir.path())
            .project_repo_name("external-project-repo")
            .commit_sha("0b95fe1039ed7c38fea1f97078316bfc5030c523")
            .build_integration_path(".clusterfuzzlite")
            .build()
            .unwrap();

        assert!(build_fuzzers(&h.cifuzz, &config).await.unwrap());
        assert_eq!(
            h.backend.built_images(),
            vec![ProjectImage::External {
                dockerfile: repo.join(".clusterfuzzlite/Dockerfile"),
                context: repo.clone(),
            }]
        );
        let args = &h.backend.run_calls()[0];
        assert!(args.contains(&"external-project".to_string()));
        assert!(args
            .last()
            .unwrap()
            .starts_with("rm -rf /src/external-project-repo && "));
    }

    #[tokio::test]
    async fn test_failed_compile_is_soft_failure() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(
            FakeBackend::new().with_run_exit_codes(vec![1]),
            FakeSource::new(dir.path().join("storage/example")),
        );
        let config = config(dir.path())
            .commit_sha("0b95fe1039ed7c38fea1f97078316bfc5030c523")
            .build()
            .unwrap();
        assert!(!build_fuzzers(&h.cifuzz, &config).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_image_build_skips_compile() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(
            FakeBackend::new().with_build_exit_codes(vec![1]),
            FakeSource::new(dir.path().join("storage/example")),
        );
        let config = config(dir.path())
            .commit_sha("0b95fe1039ed7c38fea1f97078316bfc5030c523")
            .build()
            .unwrap();
        assert!(!build_fuzzers(&h.cifuzz, &config).await.unwrap());
        assert!(h.backend.run_calls().is_empty());
    }

    #[tokio::test]
    async fn test_checkout_failure_is_soft_failure() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(FakeBackend::new(), FakeSource::failing());
        let config = config(dir.path())
            .commit_sha("0b95fe1039ed7c38fea1f97078316bfc5030c523")
            .build()
            .unwrap();
        assert!(!build_fuzzers(&h.cifuzz, &config).await.unwrap());
        assert_eq!(h.backend.total_calls(), 0);
    }
}
