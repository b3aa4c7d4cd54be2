//! Subprocess-backed agents: an external CLI gets the prompt on stdin
//! and prints the review on stdout.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use roborev_core::config::ReasoningLevel;

use super::{validate_model_name, Agent, AgentError, ProgressSink};

/// Argument shape of the underlying CLI.
#[derive(Debug, Clone, Copy)]
pub enum CliFlavor {
    /// `codex -c model_reasoning_effort="<effort>" --quiet [-m MODEL]`
    Codex,
    /// `claude --print [--model MODEL]`
    Claude,
}

#[derive(Clone)]
pub struct SubprocessAgent {
    name: String,
    command: String,
    flavor: CliFlavor,
    model: Option<String>,
    reasoning: ReasoningLevel,
}

impl SubprocessAgent {
    pub fn new(name: impl Into<String>, command: impl Into<String>, flavor: CliFlavor) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            flavor,
            model: None,
            reasoning: ReasoningLevel::default(),
        }
    }

    pub fn codex() -> Self {
        Self::new("codex", "codex", CliFlavor::Codex)
    }

    pub fn claude_code() -> Self {
        Self::new("claude-code", "claude", CliFlavor::Claude)
    }

    fn build_args(&self) -> Vec<String> {
        match self.flavor {
            CliFlavor::Codex => {
                let effort = match self.reasoning {
                    ReasoningLevel::Thorough => "high",
                    ReasoningLevel::Standard => "medium",
                    ReasoningLevel::Fast => "low",
                };
                let mut args = vec![
                    "-c".to_string(),
                    format!("model_reasoning_effort=\"{effort}\""),
                    "--quiet".to_string(),
                ];
                if let Some(model) = &self.model {
                    args.push("-m".to_string());
                    args.push(model.clone());
                }
                args
            }
            CliFlavor::Claude => {
                let mut args = vec!["--print".to_string()];
                if let Some(model) = &self.model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                args
            }
        }
    }
}

#[async_trait]
impl Agent for SubprocessAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn review(
        &self,
        repo_path: &Path,
        _commit_sha: &str,
        prompt: &str,
        sink: Option<&ProgressSink>,
    ) -> Result<String, AgentError> {
        if let Some(model) = &self.model {
            validate_model_name(model)?;
        }

        let mut child = Command::new(&self.command)
            .args(self.build_args())
            .current_dir(repo_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the future (deadline, cancellation) kills the child.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Failed(format!("spawn {}: {e}", self.command)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Failed("child stdin unavailable".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Failed("child stdout unavailable".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Failed("child stderr unavailable".to_string()))?;

        // Feed stdin from a task so a child that interleaves reading
        // and writing cannot deadlock against a full pipe. EPIPE just
        // means the child stopped reading; its exit status carries the
        // real story.
        let prompt_bytes = prompt.as_bytes().to_vec();
        let stdin_task = tokio::spawn(async move {
            let _ = stdin.write_all(&prompt_bytes).await;
        });

        let stderr_task = tokio::spawn(async move {
            let mut diagnostic = Vec::new();
            let _ = stderr.read_to_end(&mut diagnostic).await;
            diagnostic
        });

        // Forward stdout chunk by chunk as it arrives, accumulating
        // into the returned review.
        let mut output = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = stdout
                .read(&mut buf)
                .await
                .map_err(|e| AgentError::Failed(format!("read {} output: {e}", self.command)))?;
            if n == 0 {
                break;
            }
            output.extend_from_slice(&buf[..n]);
            if let Some(sink) = sink {
                sink.write_chunk(&String::from_utf8_lossy(&buf[..n]))
                    .map_err(|e| AgentError::Stream(e.to_string()))?;
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AgentError::Failed(format!("wait for {}: {e}", self.command)))?;
        let _ = stdin_task.await;
        let diagnostic = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(AgentError::Failed(format!(
                "{} failed with {}\nstderr: {}",
                self.name,
                status,
                String::from_utf8_lossy(&diagnostic).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    fn with_model(self: Arc<Self>, model: &str) -> Arc<dyn Agent> {
        if model.is_empty() {
            return self;
        }
        Arc::new(Self {
            model: Some(model.to_string()),
            ..(*self).clone()
        })
    }

    fn with_reasoning(self: Arc<Self>, level: ReasoningLevel) -> Arc<dyn Agent> {
        Arc::new(Self {
            reasoning: level,
            ..(*self).clone()
        })
    }

    fn with_agentic(self: Arc<Self>, _agentic: bool) -> Arc<dyn Agent> {
        // The CLIs drive their own tools; there is no separate mode.
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn codex_args_map_reasoning_to_effort() {
        let agent = SubprocessAgent::codex();
        assert_eq!(
            agent.build_args(),
            vec!["-c", "model_reasoning_effort=\"medium\"", "--quiet"]
        );

        let thorough: Arc<dyn Agent> =
            Arc::new(SubprocessAgent::codex()).with_reasoning(ReasoningLevel::Thorough);
        // Downcast via behavior: the configured copy is observable
        // through a fresh concrete value instead.
        let mut concrete = SubprocessAgent::codex();
        concrete.reasoning = ReasoningLevel::Thorough;
        concrete.model = Some("o3".to_string());
        assert_eq!(
            concrete.build_args(),
            vec![
                "-c",
                "model_reasoning_effort=\"high\"",
                "--quiet",
                "-m",
                "o3"
            ]
        );
        assert_eq!(thorough.name(), "codex");
    }

    #[test]
    fn claude_args_include_model_flag() {
        let mut agent = SubprocessAgent::claude_code();
        assert_eq!(agent.build_args(), vec!["--print"]);

        agent.model = Some("sonnet".to_string());
        assert_eq!(agent.build_args(), vec!["--print", "--model", "sonnet"]);
    }

    #[test]
    fn with_model_empty_returns_original() {
        let agent = Arc::new(SubprocessAgent::codex());
        let same = agent.clone().with_model("");
        let original: Arc<dyn Agent> = agent;
        assert!(Arc::ptr_eq(&original, &same));
    }

    #[tokio::test]
    async fn missing_executable_reports_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let agent = SubprocessAgent::new(
            "ghost",
            "roborev-no-such-binary-12345",
            CliFlavor::Claude,
        );

        let err = agent
            .review(dir.path(), "abc123", "prompt", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("spawn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdin_prompt_round_trips_through_a_fake_cli() {
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Mutex;

        struct VecSink(Arc<Mutex<Vec<u8>>>);
        impl std::io::Write for VecSink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake-reviewer");
        fs::write(&script, "#!/bin/sh\ncat\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let agent = SubprocessAgent::new(
            "fake",
            script.to_string_lossy().into_owned(),
            CliFlavor::Claude,
        );

        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = ProgressSink::new(VecSink(buf.clone()));
        let review = agent
            .review(dir.path(), "abc123", "the full prompt", Some(&sink))
            .await
            .unwrap();
        assert_eq!(review, "the full prompt");

        // The sink saw the same bytes the accumulator kept.
        assert_eq!(
            String::from_utf8(buf.lock().unwrap().clone()).unwrap(),
            "the full prompt"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_surfaces_stderr() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("broken-reviewer");
        fs::write(&script, "#!/bin/sh\necho 'credentials expired' >&2\nexit 3\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let agent = SubprocessAgent::new(
            "broken",
            script.to_string_lossy().into_owned(),
            CliFlavor::Claude,
        );

        let err = agent
            .review(dir.path(), "abc123", "prompt", None)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("broken failed"));
        assert!(msg.contains("credentials expired"));
    }
}
