//! Review prompt assembly.
//!
//! A prompt is markdown: commit metadata, the list of touched files, the
//! unified diff, optional excerpts of recent reviews in the same repo,
//! optional repository guidelines, and a fixed rubric. Git metadata is
//! best-effort — when the path is not a repository (or git fails) the
//! prompt degrades to a minimal header naming the SHA so the job can
//! still be dispatched.

use std::fmt::Write;
use std::path::Path;

use crate::git;

/// A recent review included in the prompt for context.
#[derive(Debug, Clone)]
pub struct ReviewContext {
    pub agent: String,
    pub output: String,
}

/// Review excerpts longer than this are truncated.
const EXCERPT_LIMIT: usize = 500;

/// Build a review prompt for `sha` in `repo_path`.
///
/// `fetch_recent` is called with `context_count` only when context is
/// requested; the caller decides where the excerpts come from.
pub fn build_prompt<F>(
    repo_path: &Path,
    sha: &str,
    context_count: usize,
    guidelines: Option<&str>,
    fetch_recent: F,
) -> String
where
    F: FnOnce(usize) -> Vec<ReviewContext>,
{
    let mut out = String::from("# Code Review Request\n\n");

    out.push_str("## Commit Details\n\n");
    match git::commit_info(repo_path, sha) {
        Ok(info) => {
            let _ = writeln!(out, "- **SHA**: {}", info.sha);
            let _ = writeln!(out, "- **Author**: {}", info.author);
            let _ = writeln!(out, "- **Subject**: {}", info.subject);
            let _ = writeln!(
                out,
                "- **Date**: {}",
                info.timestamp.format("%Y-%m-%d %H:%M:%S")
            );
        }
        Err(_) => {
            let _ = writeln!(out, "- **SHA**: {sha}");
            out.push_str("- (commit metadata unavailable)\n");
        }
    }
    out.push('\n');

    if let Ok(files) = git::files_changed(repo_path, sha) {
        out.push_str("## Files Changed\n\n");
        for f in &files {
            let _ = writeln!(out, "- {f}");
        }
        out.push('\n');
    }

    if let Ok(diff) = git::diff(repo_path, sha) {
        out.push_str("## Diff\n\n```diff\n");
        out.push_str(&diff);
        out.push_str("```\n\n");
    }

    if context_count > 0 {
        let recent = fetch_recent(context_count);
        if !recent.is_empty() {
            out.push_str("## Recent Reviews (for context)\n\n");
            for (i, r) in recent.iter().enumerate() {
                let _ = writeln!(out, "### Review {} (by {})\n", i + 1, r.agent);
                out.push_str(&truncate_excerpt(&r.output));
                out.push_str("\n\n");
            }
        }
    }

    if let Some(guidelines) = guidelines.filter(|g| !g.trim().is_empty()) {
        out.push_str("## Repository Guidelines\n\n");
        out.push_str(guidelines.trim_end());
        out.push_str("\n\n");
    }

    out.push_str("## Review Instructions\n\n");
    out.push_str("Please review this commit for:\n\n");
    out.push_str("1. **Correctness**: Logic errors, bugs, edge cases not handled\n");
    out.push_str(
        "2. **Behavior Regressions**: Changes that might break existing functionality\n",
    );
    out.push_str(
        "3. **Testing Gaps**: Missing tests, especially end-to-end tests for frontend changes\n",
    );
    out.push_str("4. **Security Issues**: Potential vulnerabilities (injection, XSS, etc.)\n");
    out.push_str("5. **Performance**: Obvious performance problems or improvements\n\n");
    out.push_str(
        "Focus on substantive issues. Don't comment on style unless it impacts readability significantly.\n\n",
    );
    out.push_str(
        "If the commit looks good, say so briefly. If there are issues, be specific about what and where.\n",
    );

    out
}

fn truncate_excerpt(output: &str) -> String {
    if output.len() <= EXCERPT_LIMIT {
        return output.to_string();
    }
    let mut end = EXCERPT_LIMIT;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &output[..end])
}
