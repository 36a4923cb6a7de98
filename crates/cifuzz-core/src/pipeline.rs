//! Pipeline orchestration: build, check and fuzz in one run.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, Instrument};

use crate::backend::{ContainerBackend, DockerBackend, DockerConfig};
use crate::baseline::{BaselineProvider, ClusterFuzzBaseline};
use crate::builder;
use crate::classify::{ContainerReproducer, Reproducer};
use crate::config::RunConfig;
use crate::docker::ContainerContext;
use crate::engine::{self, FuzzRunResult};
use crate::error::CifuzzError;
use crate::obs;
use crate::source::{GitSourceProvider, SourceProvider};
use crate::validate;

/// The collaborators a pipeline run talks to.
///
/// Production code wires real ones with [`CiFuzz::docker`]; tests inject fakes
/// through [`CiFuzz::new`].
#[derive(Clone)]
pub struct CiFuzz {
    backend: Arc<dyn ContainerBackend>,
    source: Arc<dyn SourceProvider>,
    reproducer: Arc<dyn Reproducer>,
    baseline: Arc<dyn BaselineProvider>,
    context: ContainerContext,
}

impl CiFuzz {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        source: Arc<dyn SourceProvider>,
        reproducer: Arc<dyn Reproducer>,
        baseline: Arc<dyn BaselineProvider>,
        context: ContainerContext,
    ) -> Self {
        Self {
            backend,
            source,
            reproducer,
            baseline,
            context,
        }
    }

    /// Docker backend, git checkout and ClusterFuzz baselines, in the
    /// detected container context.
    pub fn docker(config: DockerConfig, repository_url: Option<String>) -> Self {
        let context = ContainerContext::detect();
        let backend: Arc<dyn ContainerBackend> = Arc::new(DockerBackend::new(config));
        let reproducer = Arc::new(ContainerReproducer::new(backend.clone(), context.clone()));
        Self::new(
            backend,
            Arc::new(GitSourceProvider::new(repository_url)),
            reproducer,
            Arc::new(ClusterFuzzBaseline::default()),
            context,
        )
    }

    /// Replace the baseline provider.
    pub fn with_baseline(mut self, baseline: Arc<dyn BaselineProvider>) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn backend(&self) -> &dyn ContainerBackend {
        self.backend.as_ref()
    }

    pub fn source(&self) -> &dyn SourceProvider {
        self.source.as_ref()
    }

    pub fn reproducer(&self) -> &dyn Reproducer {
        self.reproducer.as_ref()
    }

    pub fn baseline(&self) -> &dyn BaselineProvider {
        self.baseline.as_ref()
    }

    pub fn context(&self) -> &ContainerContext {
        &self.context
    }

    pub async fn build_fuzzers(&self, config: &RunConfig) -> Result<bool, CifuzzError> {
        builder::build_fuzzers(self, config).await
    }

    pub async fn check_build(&self, config: &RunConfig) -> bool {
        validate::check_fuzzer_build(
            self.backend(),
            &self.context,
            &config.out_dir(),
            config.sanitizer(),
            config.allowed_broken_targets_percentage(),
        )
        .await
    }

    pub async fn run_fuzzers(&self, config: &RunConfig) -> FuzzRunResult {
        engine::run_fuzzers(
            self,
            config.fuzz_seconds(),
            &config.out_dir(),
            config.project_name(),
            config.sanitizer(),
        )
        .await
    }

    /// Build, check, then fuzz, stopping at the first failed step.
    pub async fn run_pipeline(&self, config: &RunConfig) -> Result<PipelineResult, CifuzzError> {
        self.pipeline(config)
            .instrument(obs::run_span(config.project_name(), "pipeline"))
            .await
    }

    async fn pipeline(&self, config: &RunConfig) -> Result<PipelineResult, CifuzzError> {
        let start = Instant::now();
        let mut result = PipelineResult::default();

        result.built = self.build_fuzzers(config).await?;
        if result.built {
            result.checked = self.check_build(config).await;
        }
        if result.checked {
            result.fuzz = Some(self.run_fuzzers(config).await);
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            built = result.built,
            checked = result.checked,
            bug_found = result.bug_found(),
            duration_ms = result.duration_ms,
            "Pipeline finished"
        );
        Ok(result)
    }
}

/// Outcome of [`CiFuzz::run_pipeline`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineResult {
    pub built: bool,
    pub checked: bool,
    /// Absent when the build or its check failed.
    pub fuzz: Option<FuzzRunResult>,
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn bug_found(&self) -> bool {
        self.fuzz.as_ref().is_some_and(|f| f.bug_found)
    }

    /// Whether every step ran to completion without finding a new bug.
    pub fn success(&self) -> bool {
        self.built
            && self.checked
            && self
                .fuzz
                .as_ref()
                .is_some_and(|f| f.run_succeeded && !f.bug_found)
    }
}
