//! Crash report parsing.
//!
//! Turns raw fuzzer output into a `bug_summary.txt` artifact: the crash type
//! on the first line, then the most relevant location lines. Unrecognized
//! output produces nothing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const BUG_SUMMARY_FILE: &str = "bug_summary.txt";

/// Most stack frames kept in a summary.
pub const MAX_FRAMES: usize = 3;

static SANITIZER_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)==\d+==\s*(?:ERROR|WARNING): (AddressSanitizer|MemorySanitizer|ThreadSanitizer|LeakSanitizer|UndefinedBehaviorSanitizer|libFuzzer): (.*?)\s*$",
    )
    .expect("valid sanitizer header regex")
});

static UBSAN_RUNTIME_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(\S+): runtime error: (.*?)\s*$").expect("valid runtime error regex")
});

static STACK_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*#(\d+)\s+0x[0-9a-fA-F]+\s+(?:in\s+)?(.+?)\s*$").expect("valid frame regex")
});

/// Where a crash description ends and address/detail text begins.
const DESCRIPTION_CUTS: &[&str] = &[" on ", " (", " after ", ";"];

/// Lines that end a sanitizer report's first section.
const END_MARKERS: &[&str] = &["SUMMARY:", "ABORTING", "Shadow byte"];

/// Frames belonging to the sanitizer runtime or the fuzzing engine.
const INTERNAL_FRAME_PREFIXES: &[&str] = &[
    "__asan",
    "__msan",
    "__ubsan",
    "__tsan",
    "__lsan",
    "__sanitizer",
    "__interceptor",
    "fuzzer::",
    "__libc_start_main",
    "_start",
];

const INTERNAL_FRAME_PATHS: &[&str] = &["/compiler-rt/lib/"];

/// Structured form of a crash report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashSummary {
    /// e.g. `AddressSanitizer: heap-buffer-overflow`.
    pub crash_type: String,

    /// Location lines, most relevant first.
    pub locations: Vec<String>,
}

impl CrashSummary {
    /// Canonical `bug_summary.txt` contents.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(64 * (self.locations.len() + 1));
        out.push_str(&self.crash_type);
        out.push('\n');
        for location in &self.locations {
            out.push_str(location);
            out.push('\n');
        }
        out
    }
}

fn cut_description(description: &str) -> &str {
    let end = DESCRIPTION_CUTS
        .iter()
        .filter_map(|cut| description.find(cut))
        .min()
        .unwrap_or(description.len());
    description[..end].trim_end_matches([' ', ':'])
}

fn is_internal_frame(frame: &str) -> bool {
    INTERNAL_FRAME_PREFIXES
        .iter()
        .any(|prefix| frame.starts_with(prefix))
        || INTERNAL_FRAME_PATHS.iter().any(|path| frame.contains(path))
}

/// Relevant frames of the first stack trace in `report`.
fn first_stack_frames(report: &str) -> Vec<String> {
    let mut frames = Vec::new();
    let mut last_index: Option<u32> = None;

    for line in report.lines() {
        match STACK_FRAME.captures(line) {
            Some(caps) => {
                let index: u32 = caps[1].parse().unwrap_or(0);
                if matches!(last_index, Some(last) if index <= last) {
                    break;
                }
                last_index = Some(index);
                let frame = &caps[2];
                if !is_internal_frame(frame) && frames.len() < MAX_FRAMES {
                    frames.push(frame.to_string());
                }
            }
            None if last_index.is_some() => break,
            None => {
                let trimmed = line.trim_start();
                if END_MARKERS.iter().any(|marker| trimmed.starts_with(marker))
                    || trimmed.ends_with("==ABORTING")
                {
                    break;
                }
            }
        }
    }

    frames
        .into_iter()
        .enumerate()
        .map(|(i, frame)| format!("#{i} {frame}"))
        .collect()
}

/// Parse the first crash report in `raw`, if any.
///
/// A report needs a crash-type marker and at least one location line.
pub fn parse_crash_report(raw: &[u8]) -> Option<CrashSummary> {
    let text = String::from_utf8_lossy(raw);

    let sanitizer = SANITIZER_HEADER.captures(&text).map(|caps| {
        let start = caps.get(0).map_or(0, |m| m.start());
        let end = caps.get(0).map_or(0, |m| m.end());
        let crash_type = format!("{}: {}", &caps[1], cut_description(&caps[2]));
        (start, end, crash_type, None::<String>)
    });
    let ubsan = UBSAN_RUNTIME_ERROR.captures(&text).map(|caps| {
        let start = caps.get(0).map_or(0, |m| m.start());
        let end = caps.get(0).map_or(0, |m| m.end());
        let crash_type = format!("UndefinedBehaviorSanitizer: {}", &caps[2]);
        (start, end, crash_type, Some(caps[1].to_string()))
    });

    let (_, header_end, crash_type, location) = match (sanitizer, ubsan) {
        (Some(s), Some(u)) => {
            if u.0 < s.0 {
                u
            } else {
                s
            }
        }
        (Some(s), None) => s,
        (None, Some(u)) => u,
        (None, None) => return None,
    };

    let mut locations: Vec<String> = location.into_iter().collect();
    locations.extend(first_stack_frames(&text[header_end..]));
    if locations.is_empty() {
        return None;
    }

    Some(CrashSummary {
        crash_type,
        locations,
    })
}

/// Whether `raw` carries a sanitizer or libFuzzer crash header.
///
/// Weaker than [`parse_crash_report`]: a header without location lines
/// still counts.
pub fn has_crash_marker(raw: &[u8]) -> bool {
    let text = String::from_utf8_lossy(raw);
    SANITIZER_HEADER.is_match(&text) || UBSAN_RUNTIME_ERROR.is_match(&text)
}

/// Write `summary` to `bug_summary.txt` in `dir`, replacing any earlier one.
///
/// The file appears atomically: it is written under a temporary name first.
pub fn write_summary(summary: &CrashSummary, dir: &Path) -> std::io::Result<PathBuf> {
    let path = dir.join(BUG_SUMMARY_FILE);
    let tmp = dir.join(format!(".{BUG_SUMMARY_FILE}.tmp"));
    let result = fs::write(&tmp, summary.render()).and_then(|_| fs::rename(&tmp, &path));
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(path)
}

/// Parse `raw` and write the summary into `dir`.
///
/// Returns the summary and its path, or `None` when nothing was written.
pub fn record_crash(raw: &[u8], dir: &Path) -> Option<(CrashSummary, PathBuf)> {
    let Some(summary) = parse_crash_report(raw) else {
        debug!(bytes = raw.len(), "No crash report found in fuzzer output");
        return None;
    };
    match write_summary(&summary, dir) {
        Ok(path) => Some((summary, path)),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to write bug summary");
            None
        }
    }
}

/// Parse fuzzer output and write `bug_summary.txt` into `destination_dir`.
///
/// Never fails: unrecognized output and I/O errors leave the directory as
/// it was.
pub fn parse_fuzzer_output(raw: &[u8], destination_dir: &Path) {
    let _ = record_crash(raw, destination_dir);
}
