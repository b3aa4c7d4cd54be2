//! Thin wrappers around the `git` CLI for commit metadata and diffs.
//!
//! Everything here shells out to `git -C <repo> show …` and parses the
//! output. Callers run these from a blocking context; the daemon wraps
//! them in `spawn_blocking`.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

/// Metadata for a single commit.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub sha: String,
    pub author: String,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
}

fn git_output(repo: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .output()
        .with_context(|| format!("run git {}", args.join(" ")))?;

    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Look up author, subject and committer date for a revision.
pub fn commit_info(repo: &Path, rev: &str) -> Result<CommitInfo> {
    // Unit separator between fields so subjects may contain anything
    // short of control characters.
    let raw = git_output(
        repo,
        &["show", "-s", "--format=%H%x1f%an <%ae>%x1f%s%x1f%cI", rev],
    )?;

    let line = raw.trim();
    let mut fields = line.split('\x1f');
    let (Some(sha), Some(author), Some(subject), Some(date)) = (
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
    ) else {
        bail!("unexpected git show output for {rev}: {line:?}");
    };

    let timestamp = DateTime::parse_from_rfc3339(date.trim())
        .with_context(|| format!("parse commit date {date:?}"))?
        .with_timezone(&Utc);

    Ok(CommitInfo {
        sha: sha.to_string(),
        author: author.to_string(),
        subject: subject.to_string(),
        timestamp,
    })
}

/// Paths touched by a commit, one per line.
pub fn files_changed(repo: &Path, rev: &str) -> Result<Vec<String>> {
    let raw = git_output(repo, &["show", "--format=", "--name-only", rev])?;
    Ok(raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.to_string())
        .collect())
}

/// Unified diff for a commit against its parent.
pub fn diff(repo: &Path, rev: &str) -> Result<String> {
    git_output(repo, &["show", "--format=", "--patch", rev])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn run_git(repo: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(args)
            .env("GIT_AUTHOR_NAME", "Test Author")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "Test Author")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo_with_commit(dir: &Path) {
        run_git(dir, &["init", "--quiet"]);
        fs::write(dir.join("hello.txt"), "hello\n").unwrap();
        run_git(dir, &["add", "hello.txt"]);
        run_git(dir, &["commit", "--quiet", "-m", "add hello"]);
    }

    #[test]
    fn commit_info_reads_head() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo_with_commit(dir.path());

        let info = commit_info(dir.path(), "HEAD").unwrap();
        assert_eq!(info.sha.len(), 40);
        assert!(info.author.contains("Test Author"));
        assert_eq!(info.subject, "add hello");
    }

    #[test]
    fn files_changed_lists_touched_paths() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo_with_commit(dir.path());

        let files = files_changed(dir.path(), "HEAD").unwrap();
        assert_eq!(files, vec!["hello.txt".to_string()]);
    }

    #[test]
    fn diff_contains_added_line() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo_with_commit(dir.path());

        let patch = diff(dir.path(), "HEAD").unwrap();
        assert!(patch.contains("+hello"));
    }

    #[test]
    fn commit_info_fails_outside_repo() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        assert!(commit_info(dir.path(), "HEAD").is_err());
    }
}
