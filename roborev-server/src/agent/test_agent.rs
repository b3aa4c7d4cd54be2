//! Deterministic in-process agent. Registered as `test` so end-to-end
//! flows (and operator smoke tests) can run without any external CLI or
//! inference server.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use roborev_core::config::ReasoningLevel;

use super::{Agent, AgentError, ProgressSink};

#[derive(Clone)]
pub struct TestAgent {
    pub delay: Duration,
    pub output: String,
    pub fail: bool,
}

impl TestAgent {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(100),
            output: "Test review output: This commit looks good. No issues found.".to_string(),
            fail: false,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }
}

impl Default for TestAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for TestAgent {
    fn name(&self) -> &str {
        "test"
    }

    async fn review(
        &self,
        repo_path: &Path,
        commit_sha: &str,
        _prompt: &str,
        sink: Option<&ProgressSink>,
    ) -> Result<String, AgentError> {
        tokio::time::sleep(self.delay).await;

        if self.fail {
            return Err(AgentError::Failed(
                "test agent configured to fail".to_string(),
            ));
        }

        let short_sha = &commit_sha[..commit_sha.len().min(7)];
        let output = format!(
            "{}\n\nCommit: {}\nRepo: {}",
            self.output,
            short_sha,
            repo_path.display()
        );
        if let Some(sink) = sink {
            sink.write_chunk(&output)
                .map_err(|e| AgentError::Stream(e.to_string()))?;
        }
        Ok(output)
    }

    fn with_model(self: Arc<Self>, _model: &str) -> Arc<dyn Agent> {
        self
    }

    fn with_reasoning(self: Arc<Self>, _level: ReasoningLevel) -> Arc<dyn Agent> {
        self
    }

    fn with_agentic(self: Arc<Self>, _agentic: bool) -> Arc<dyn Agent> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_commit_and_repo_details() {
        let agent = TestAgent::with_delay(Duration::from_millis(1));
        let output = agent
            .review(Path::new("/tmp/repo"), "abcdef1234567", "prompt", None)
            .await
            .unwrap();
        assert!(output.contains("Commit: abcdef1"));
        assert!(output.contains("Repo: /tmp/repo"));
    }

    #[tokio::test]
    async fn failing_variant_reports_configured_failure() {
        let mut agent = TestAgent::failing();
        agent.delay = Duration::from_millis(1);
        let err = agent
            .review(Path::new("/tmp"), "abc", "prompt", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("test agent configured to fail"));
    }

    #[tokio::test]
    async fn short_shas_do_not_panic() {
        let agent = TestAgent::with_delay(Duration::from_millis(1));
        let output = agent
            .review(Path::new("/tmp"), "ab", "prompt", None)
            .await
            .unwrap();
        assert!(output.contains("Commit: ab"));
    }
}
