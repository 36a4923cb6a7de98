//! CIFuzz Core - continuous fuzzing for pull requests
//!
//! Builds a project's fuzz targets against the change under test, validates
//! the build, fuzzes every target under a shared time budget and reports only
//! crashes that the change introduced:
//! - `builder` / `validate`: compile and sanity-check fuzz targets in containers
//! - `engine`: time-boxed fuzzing of every target
//! - `parser`: turn sanitizer output into `bug_summary.txt`
//! - `classify`: replay crashes against the latest baseline build

pub mod backend;
pub mod baseline;
pub mod builder;
pub mod classify;
pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod fakes;
pub mod obs;
pub mod parser;
pub mod pipeline;
pub mod source;
pub mod target;
pub mod validate;

// Re-export key types
pub use backend::{ContainerBackend, DockerBackend, DockerConfig, ProcessOutput};
pub use baseline::{BaselineProvider, ClusterFuzzBaseline, LocalBaseline, NoBaseline};
pub use classify::{classify_crash, ContainerReproducer, Reproducer, Verdict};
pub use config::{CheckoutRef, RunConfig, RunConfigBuilder, Sanitizer};
pub use docker::ContainerContext;
pub use engine::{BugReport, FuzzRunResult};
pub use error::{CifuzzError, ConfigError};
pub use parser::{parse_crash_report, parse_fuzzer_output, CrashSummary};
pub use pipeline::{CiFuzz, PipelineResult};
pub use source::{CheckedOutSource, GitSourceProvider, SourceProvider};
