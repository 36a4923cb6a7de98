//! Fuzz target discovery and per-target reproducibility state.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use regex::Regex;

use crate::classify::Reproducer;
use crate::error::ReproduceError;

/// Marker libFuzzer entry points are compiled from.
const FUZZ_TARGET_SEARCH_STRING: &[u8] = b"LLVMFuzzerTestOneInput";

/// Files in the output directory that are never targets.
const EXCLUDED_NAMES: &[&str] = &["llvm-symbolizer", "jazzer_driver", "jazzer_driver_with_sanitizer"];

const ALLOWED_EXTENSIONS: &[&str] = &["", "exe"];

static VALID_TARGET_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("valid target name regex"));

/// A fuzz target binary in an output directory.
///
/// Reproducibility against a given test case is computed on first request and
/// remembered afterwards.
#[derive(Debug)]
pub struct FuzzTarget {
    path: PathBuf,
    name: String,
    reproducibility: Mutex<HashMap<PathBuf, bool>>,
}

impl FuzzTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            name,
            reproducibility: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the target.
    pub fn out_dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }

    /// Known reproducibility of `testcase`, if it has been checked.
    pub fn known_reproducibility(&self, testcase: &Path) -> Option<bool> {
        self.reproducibility
            .lock()
            .ok()
            .and_then(|cache| cache.get(testcase).copied())
    }

    /// Whether `testcase` crashes this target, running it on first request.
    pub async fn is_reproducible(
        &self,
        reproducer: &dyn Reproducer,
        testcase: &Path,
    ) -> Result<bool, ReproduceError> {
        if let Some(known) = self.known_reproducibility(testcase) {
            return Ok(known);
        }
        let reproducible = reproducer.is_reproducible(&self.path, testcase).await?;
        if let Ok(mut cache) = self.reproducibility.lock() {
            cache.insert(testcase.to_path_buf(), reproducible);
        }
        Ok(reproducible)
    }
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    true
}

fn contains_marker(path: &Path) -> bool {
    let mut contents = Vec::new();
    match fs::File::open(path).and_then(|mut file| file.read_to_end(&mut contents)) {
        Ok(_) => contents
            .windows(FUZZ_TARGET_SEARCH_STRING.len())
            .any(|window| window == FUZZ_TARGET_SEARCH_STRING),
        Err(_) => false,
    }
}

/// Whether `path` looks like a fuzz target binary.
pub fn is_fuzz_target(path: &Path) -> bool {
    let Some(stem) = path.file_stem().map(|s| s.to_string_lossy()) else {
        return false;
    };
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();

    if !VALID_TARGET_NAME.is_match(&stem) {
        return false;
    }
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return false;
    }
    if EXCLUDED_NAMES.contains(&&*stem) {
        return false;
    }
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() || !is_executable(&metadata) {
        return false;
    }
    if stem.ends_with("_fuzzer") {
        return true;
    }
    contains_marker(path)
}

/// Fuzz target paths directly inside `out_dir`, sorted.
///
/// Subdirectories (e.g. an unpacked baseline build) are not searched. A
/// missing or unreadable directory yields no targets.
pub fn find_fuzz_targets(out_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(out_dir) else {
        return Vec::new();
    };
    let mut targets: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_fuzz_target(path))
        .collect();
    targets.sort();
    targets
}


#[cfg(test)]
mod tests {
    use super::test_support::write_executable;
    use super::*;
    use crate::fakes::ScriptedReproducer;

    #[test]
    fn test_fuzzer_suffix_is_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_executable(dir.path(), "do_stuff_fuzzer", b"\x7fELF");
        assert!(is_fuzz_target(&path));
    }

    #[test]
    fn test_marker_is_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_executable(dir.path(), "parse", b"..LLVMFuzzerTestOneInput..");
        assert!(is_fuzz_target(&path));

        let path = write_executable(dir.path(), "helper", b"#!/bin/sh\nexit 0\n");
        assert!(!is_fuzz_target(&path));
    }

    #[test]
    fn test_non_targets_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let symbolizer = write_executable(dir.path(), "llvm-symbolizer", FUZZ_TARGET_SEARCH_STRING);
        assert!(!is_fuzz_target(&symbolizer));

        let options = write_executable(dir.path(), "do_stuff_fuzzer.options", b"[libfuzzer]");
        assert!(!is_fuzz_target(&options));

        let bad_name = write_executable(dir.path(), "bad name_fuzzer", b"");
        assert!(!is_fuzz_target(&bad_name));

        let data = dir.path().join("seed_fuzzer");
        std::fs::write(&data, FUZZ_TARGET_SEARCH_STRING).unwrap();
        #[cfg(unix)]
        assert!(!is_fuzz_target(&data), "non-executable file is not a target");

        assert!(!is_fuzz_target(&dir.path().join("missing_fuzzer")));
    }

    #[test]
    fn test_find_fuzz_targets_sorted_top_level_only() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(dir.path(), "b_fuzzer", b"");
        write_executable(dir.path(), "a_fuzzer", b"");
        std::fs::write(dir.path().join("bug_summary.txt"), b"x").unwrap();
        let nested = dir.path().join("oss_fuzz_latest");
        std::fs::create_dir(&nested).unwrap();
        write_executable(&nested, "c_fuzzer", b"");

        let targets = find_fuzz_targets(dir.path());
        let names: Vec<_> = targets
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a_fuzzer", "b_fuzzer"]);
    }

    #[test]
    fn test_find_fuzz_targets_missing_dir() {
        assert!(find_fuzz_targets(Path::new("not/a/valid/path")).is_empty());
    }

    #[tokio::test]
    async fn test_reproducibility_is_memoized() {
        let target = FuzzTarget::new("/out/do_stuff_fuzzer");
        assert_eq!(target.name(), "do_stuff_fuzzer");
        assert_eq!(target.out_dir(), Path::new("/out"));

        let testcase = Path::new("/out/crash-1");
        assert_eq!(target.known_reproducibility(testcase), None);

        let reproducer = ScriptedReproducer::new(vec![Ok(true)]);
        assert!(target.is_reproducible(&reproducer, testcase).await.unwrap());
        // Second call answers from the cache; the script has no more answers.
        assert!(target.is_reproducible(&reproducer, testcase).await.unwrap());
        assert_eq!(reproducer.calls().len(), 1);
        assert_eq!(target.known_reproducibility(testcase), Some(true));
    }
}
