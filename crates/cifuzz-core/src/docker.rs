//! Container invocation arguments for build, validation, fuzzing and
//! reproduction passes.
//!
//! Everything here is a pure function returning an argument vector; launching
//! the container is the [`ContainerBackend`](crate::backend::ContainerBackend)'s job.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::Sanitizer;

/// Image used for validation, fuzzing and reproduction.
pub const BASE_RUNNER_IMAGE: &str = "gcr.io/oss-fuzz-base/base-runner";

/// Image tag for projects that bring their own build integration.
pub const EXTERNAL_PROJECT_IMAGE: &str = "external-project";

/// Mount point of the output directory inside a fresh container.
pub const IMAGE_OUT_DIR: &str = "/out";

/// Working directory inside the build container.
pub const IMAGE_WORK_DIR: &str = "/work";

pub const DEFAULT_ENGINE: &str = "libfuzzer";
pub const DEFAULT_ARCHITECTURE: &str = "x86_64";

/// Whether the caller already runs inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum ContainerContext {
    /// Running on the host; directories are bind mounted.
    Host,
    /// Running in the named container; its volumes are shared.
    Container(String),
}

impl ContainerContext {
    /// Detect the context of the current process.
    pub fn detect() -> Self {
        Self::detect_from(Path::new("/proc/self/cgroup"), Path::new("/etc/hostname"))
    }

    /// Detect using explicit cgroup and hostname files.
    ///
    /// A cgroup file mentioning `docker` means we are containerized, and the
    /// container's name is its hostname.
    pub fn detect_from(cgroup_path: &Path, hostname_path: &Path) -> Self {
        let in_docker = std::fs::read_to_string(cgroup_path)
            .map(|cgroup| cgroup.contains("docker"))
            .unwrap_or(false);
        if !in_docker {
            return ContainerContext::Host;
        }
        match std::fs::read_to_string(hostname_path) {
            Ok(name) if !name.trim().is_empty() => {
                ContainerContext::Container(name.trim().to_string())
            }
            _ => ContainerContext::Host,
        }
    }

    pub fn container_name(&self) -> Option<&str> {
        match self {
            ContainerContext::Host => None,
            ContainerContext::Container(name) => Some(name),
        }
    }
}

/// Image the project's fuzzers are built in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectImage {
    /// `gcr.io/oss-fuzz/<project>`, built from the OSS-Fuzz projects tree.
    Internal { project_name: String },
    /// Built from a Dockerfile inside the project's own repository.
    External {
        dockerfile: PathBuf,
        context: PathBuf,
    },
}

impl ProjectImage {
    pub fn tag(&self) -> String {
        match self {
            ProjectImage::Internal { project_name } => format!("gcr.io/oss-fuzz/{project_name}"),
            ProjectImage::External { .. } => EXTERNAL_PROJECT_IMAGE.to_string(),
        }
    }
}

fn env_arg(args: &mut Vec<String>, key: &str, value: impl AsRef<str>) {
    args.push("-e".to_string());
    args.push(format!("{key}={}", value.as_ref()));
}

fn volume(host: &Path, container: &Path) -> String {
    format!("{}:{}", host.display(), container.display())
}

/// Arguments shared by every build and validation container.
///
/// Always carries `CIFUZZ=True` so build scripts can tell they run in CI.
pub fn common_docker_args(sanitizer: Sanitizer) -> Vec<String> {
    let mut args = vec!["--cap-add".to_string(), "SYS_PTRACE".to_string()];
    env_arg(&mut args, "FUZZING_ENGINE", DEFAULT_ENGINE);
    env_arg(&mut args, "SANITIZER", sanitizer.as_str());
    env_arg(&mut args, "ARCHITECTURE", DEFAULT_ARCHITECTURE);
    env_arg(&mut args, "CIFUZZ", "True");
    env_arg(&mut args, "FUZZING_LANGUAGE", "c++");
    args
}

/// Output binding when running inside `container`: the output directory is
/// already visible through the shared volumes.
pub fn build_fuzzers_args_container(out_dir: &Path, container: &str) -> Vec<String> {
    let mut args = Vec::new();
    env_arg(&mut args, "OUT", out_dir.display().to_string());
    args.push("--volumes-from".to_string());
    args.push(container.to_string());
    args
}

/// Output and source bindings for a fresh container started from the host.
///
/// The repository is mounted at the same path it has on the host.
pub fn build_fuzzers_args_not_container(host_out_dir: &Path, host_repo_path: &Path) -> Vec<String> {
    let mut args = Vec::new();
    env_arg(&mut args, "OUT", IMAGE_OUT_DIR);
    args.push("-v".to_string());
    args.push(volume(host_out_dir, Path::new(IMAGE_OUT_DIR)));
    args.push("-v".to_string());
    args.push(volume(host_repo_path, host_repo_path));
    args
}

/// MemorySanitizer runtime library location, relative to `work_dir`.
pub fn build_fuzzers_args_msan(work_dir: &Path) -> Vec<String> {
    let mut args = Vec::new();
    env_arg(
        &mut args,
        "MSAN_LIBS_PATH",
        work_dir.join("msan").display().to_string(),
    );
    args
}

/// `path` as a single `bash` word, quoted only when it needs to be.
pub fn shell_quote(path: &Path) -> String {
    let raw = path.display().to_string();
    let plain = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:,=@%".contains(c));
    if plain {
        raw
    } else {
        format!("'{}'", raw.replace('\'', r"'\''"))
    }
}

/// Output binding for `context`, choosing between shared volumes and mounts.
pub fn build_fuzzers_args(
    context: &ContainerContext,
    out_dir: &Path,
    host_repo_path: &Path,
) -> Vec<String> {
    match context {
        ContainerContext::Container(name) => build_fuzzers_args_container(out_dir, name),
        ContainerContext::Host => build_fuzzers_args_not_container(out_dir, host_repo_path),
    }
}

/// Shell command run inside the build container.
///
/// Replaces the image's copy of the repository with the checked-out one, then
/// compiles.
pub fn build_fuzzers_command(
    host_repo_path: &Path,
    image_repo_path: &Path,
    sanitizer: Sanitizer,
    work_dir: &Path,
) -> String {
    let image_src_dir = image_repo_path.parent().unwrap_or(Path::new("/src"));
    let mut command = format!(
        "rm -rf {} && cp -r {} {} && compile",
        shell_quote(image_repo_path),
        shell_quote(host_repo_path),
        shell_quote(image_src_dir)
    );
    if sanitizer == Sanitizer::Memory {
        command = format!("cp -r /msan {} && {command}", shell_quote(work_dir));
    }
    command
}

/// Full argument vector for the build container.
pub fn build_fuzzers_invocation(
    context: &ContainerContext,
    sanitizer: Sanitizer,
    image: &ProjectImage,
    out_dir: &Path,
    host_repo_path: &Path,
    image_repo_path: &Path,
) -> Vec<String> {
    let work_dir = Path::new(IMAGE_WORK_DIR);
    let mut args = common_docker_args(sanitizer);
    args.extend(build_fuzzers_args(context, out_dir, host_repo_path));
    if sanitizer == Sanitizer::Memory {
        args.extend(build_fuzzers_args_msan(work_dir));
    }
    args.push(image.tag());
    args.push("/bin/bash".to_string());
    args.push("-c".to_string());
    args.push(build_fuzzers_command(
        host_repo_path,
        image_repo_path,
        sanitizer,
        work_dir,
    ));
    args
}

/// `docker build` arguments producing `image`.
pub fn build_image_args(image: &ProjectImage, projects_dir: &Path) -> Vec<String> {
    let mut args = vec!["-t".to_string(), image.tag()];
    match image {
        ProjectImage::Internal { project_name } => {
            args.push(projects_dir.join(project_name).display().to_string());
        }
        ProjectImage::External {
            dockerfile,
            context,
        } => {
            args.push("-f".to_string());
            args.push(dockerfile.display().to_string());
            args.push(context.display().to_string());
        }
    }
    args
}

/// Arguments for the `test_all` validation pass over `out_dir`.
pub fn check_build_invocation(
    context: &ContainerContext,
    out_dir: &Path,
    sanitizer: Sanitizer,
    allowed_broken_targets_percentage: Option<u8>,
) -> Vec<String> {
    let mut args = common_docker_args(sanitizer);
    if let Some(percentage) = allowed_broken_targets_percentage {
        env_arg(
            &mut args,
            "ALLOWED_BROKEN_TARGETS_PERCENTAGE",
            percentage.to_string(),
        );
    }
    match context {
        ContainerContext::Container(name) => {
            env_arg(&mut args, "OUT", out_dir.display().to_string());
            args.push("--volumes-from".to_string());
            args.push(name.clone());
        }
        ContainerContext::Host => {
            args.push("-v".to_string());
            args.push(volume(out_dir, Path::new(IMAGE_OUT_DIR)));
        }
    }
    args.push("-t".to_string());
    args.push(BASE_RUNNER_IMAGE.to_string());
    args.push("test_all".to_string());
    args
}

/// Arguments for fuzzing `target_name` in `out_dir` with libFuzzer.
///
/// `corpus_dir` is a path relative to `out_dir`.
pub fn fuzz_invocation(
    context: &ContainerContext,
    out_dir: &Path,
    sanitizer: Sanitizer,
    target_name: &str,
    max_total_time: u64,
    corpus_dir: Option<&Path>,
) -> Vec<String> {
    let mut args = Vec::new();
    let image_out = match context {
        ContainerContext::Container(name) => {
            args.push("--volumes-from".to_string());
            args.push(name.clone());
            env_arg(&mut args, "OUT", out_dir.display().to_string());
            out_dir.to_path_buf()
        }
        ContainerContext::Host => {
            args.push("-v".to_string());
            args.push(volume(out_dir, Path::new(IMAGE_OUT_DIR)));
            PathBuf::from(IMAGE_OUT_DIR)
        }
    };
    env_arg(&mut args, "FUZZING_ENGINE", DEFAULT_ENGINE);
    env_arg(&mut args, "SANITIZER", sanitizer.as_str());
    env_arg(&mut args, "RUN_FUZZER_MODE", "interactive");
    args.push(BASE_RUNNER_IMAGE.to_string());
    args.push("bash".to_string());
    args.push("-c".to_string());

    let mut command = format!(
        "run_fuzzer {target_name} {} -max_total_time={max_total_time}",
        crate::engine::LIBFUZZER_OPTIONS
    );
    if let Some(corpus) = corpus_dir {
        command.push(' ');
        command.push_str(&shell_quote(&image_out.join(corpus)));
    }
    args.push(command);
    args
}

/// Arguments for replaying `testcase` against `target_name` in `target_dir`.
pub fn reproduce_invocation(
    context: &ContainerContext,
    target_dir: &Path,
    target_name: &str,
    testcase: &Path,
    runs: u32,
) -> Vec<String> {
    let mut args = Vec::new();
    match context {
        ContainerContext::Container(name) => {
            args.push("--volumes-from".to_string());
            args.push(name.clone());
            env_arg(&mut args, "OUT", target_dir.display().to_string());
            env_arg(&mut args, "TESTCASE", testcase.display().to_string());
        }
        ContainerContext::Host => {
            args.push("-v".to_string());
            args.push(volume(target_dir, Path::new(IMAGE_OUT_DIR)));
            args.push("-v".to_string());
            args.push(volume(testcase, Path::new("/testcase")));
        }
    }
    args.push("-t".to_string());
    args.push(BASE_RUNNER_IMAGE.to_string());
    args.push("reproduce".to_string());
    args.push(target_name.to_string());
    args.push(format!("-runs={runs}"));
    args
}
