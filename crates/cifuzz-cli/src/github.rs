//! GitHub Actions environment helpers.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct PullRequest {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct Event {
    pull_request: Option<PullRequest>,
}

/// Merge ref of the pull request that triggered the workflow, if any.
///
/// Only `pull_request` events carry one; the number comes from the event
/// payload at `event_path`.
pub fn pr_ref_from_event(event_name: Option<&str>, event_path: Option<&Path>) -> Result<Option<String>> {
    if event_name != Some("pull_request") {
        return Ok(None);
    }
    let Some(path) = event_path else {
        return Ok(None);
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event payload {}", path.display()))?;
    let event: Event = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse event payload {}", path.display()))?;
    Ok(event
        .pull_request
        .map(|pr| format!("refs/pull/{}/merge", pr.number)))
}

/// Repository name without its owner (`owner/repo` -> `repo`).
pub fn repo_name(repository: &str) -> &str {
    repository
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(repository)
}

/// Clone URL of `owner/repo` on GitHub.
pub fn repository_url(repository: &str) -> String {
    format!("https://github.com/{}.git", repository.trim_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pr_ref_from_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(&path, r#"{"action":"opened","pull_request":{"number":1757}}"#).unwrap();

        assert_eq!(
            pr_ref_from_event(Some("pull_request"), Some(&path)).unwrap(),
            Some("refs/pull/1757/merge".to_string())
        );
        assert_eq!(pr_ref_from_event(Some("push"), Some(&path)).unwrap(), None);
        assert_eq!(pr_ref_from_event(Some("pull_request"), None).unwrap(), None);
    }

    #[test]
    fn test_pr_ref_from_bad_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(pr_ref_from_event(Some("pull_request"), Some(&path)).is_err());
        assert!(pr_ref_from_event(Some("pull_request"), Some(&dir.path().join("missing"))).is_err());
    }

    #[test]
    fn test_repo_name() {
        assert_eq!(repo_name("google/oss-fuzz"), "oss-fuzz");
        assert_eq!(repo_name("example"), "example");
        assert_eq!(repository_url("google/oss-fuzz"), "https://github.com/google/oss-fuzz.git");
    }
}
