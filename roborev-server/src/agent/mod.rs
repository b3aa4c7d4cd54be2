//! Review agents: named backends that turn a prompt into a review.
//!
//! An agent is looked up by name in the registry, optionally
//! reconfigured through the builder-style `with_*` operations (which
//! return a new value and never mutate the shared registry instance),
//! and invoked under a deadline owned by the worker. Dropping the
//! review future cancels outbound work: subprocess children are killed,
//! HTTP streams are abandoned.

mod ollama;
mod subprocess;
mod test_agent;

pub use ollama::{resolve_base_url, OllamaAgent, DEFAULT_BASE_URL};
pub use subprocess::{CliFlavor, SubprocessAgent};
pub use test_agent::TestAgent;

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use roborev_core::config::{GlobalConfig, ReasoningLevel};

/// Classified agent failures. Display strings double as the operator
/// messages recorded on failed jobs, so each names a concrete next step.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("invalid model name {model:?}: {reason}")]
    InvalidModel { model: String, reason: String },
    #[error("{0}")]
    Failed(String),
    #[error("server not reachable at {url}. Is Ollama running? Start it with: ollama serve")]
    ServerUnreachable { url: String },
    #[error("model {model:?} not found. Pull it with: ollama pull {model}")]
    ModelNotFound { model: String },
    #[error("server error (status {status}): {detail}")]
    ServerError { status: u16, detail: String },
    #[error("request timed out. Try a faster model or review a smaller commit")]
    Timeout,
    #[error("read stream: {0}")]
    Stream(String),
}

/// Write-only destination for partial agent output. The mutex makes
/// concurrent writers safe; the sink itself may simply be absent.
pub struct ProgressSink {
    inner: Mutex<Box<dyn Write + Send>>,
}

impl ProgressSink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Mutex::new(Box::new(writer)),
        }
    }

    pub fn write_chunk(&self, chunk: &str) -> std::io::Result<()> {
        let mut writer = self.inner.lock().unwrap();
        writer.write_all(chunk.as_bytes())?;
        writer.flush()
    }
}

/// A named review backend.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable identifier, e.g. `codex` or `ollama`.
    fn name(&self) -> &str;

    /// Run a review. Partial output goes to `sink` as it arrives when
    /// one is provided; the full review is the return value.
    async fn review(
        &self,
        repo_path: &Path,
        commit_sha: &str,
        prompt: &str,
        sink: Option<&ProgressSink>,
    ) -> Result<String, AgentError>;

    /// A copy configured for `model`. An empty model returns the
    /// original value unchanged.
    fn with_model(self: Arc<Self>, model: &str) -> Arc<dyn Agent>;

    /// A copy configured for `level`.
    fn with_reasoning(self: Arc<Self>, level: ReasoningLevel) -> Arc<dyn Agent>;

    /// A copy with agentic mode toggled. Drivers without an agentic
    /// variant return themselves.
    fn with_agentic(self: Arc<Self>, agentic: bool) -> Arc<dyn Agent>;
}

impl std::fmt::Debug for dyn Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Agent({})", self.name())
    }
}

/// Name-indexed set of agents, built once at daemon startup and
/// read-only afterwards.
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// The stock registry: the CLI drivers, an Ollama driver pointed at
    /// the resolved base URL, and the deterministic test agent.
    pub fn with_defaults(global: &GlobalConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SubprocessAgent::codex()));
        registry.register(Arc::new(SubprocessAgent::claude_code()));
        registry.register(Arc::new(OllamaAgent::new(resolve_base_url(
            global.ollama_base_url.as_deref(),
        ))));
        registry.register(Arc::new(TestAgent::new()));
        registry
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Agent>, AgentError> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::UnknownAgent(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Model names are alphanumeric plus `: . _ - /`, never empty.
/// Examples: `llama3`, `qwen2.5-coder:latest`, `library/llama3:latest`.
pub fn validate_model_name(model: &str) -> Result<(), AgentError> {
    if model.is_empty() {
        return Err(AgentError::InvalidModel {
            model: model.to_string(),
            reason: "model name cannot be empty".to_string(),
        });
    }
    for (i, c) in model.char_indices() {
        let ok = c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '.' | '/');
        if !ok {
            return Err(AgentError::InvalidModel {
                model: model.to_string(),
                reason: format!("invalid character {c:?} at position {i}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_default_agents() {
        let registry = AgentRegistry::with_defaults(&GlobalConfig::default());

        for name in ["codex", "claude-code", "ollama", "test"] {
            let agent = registry.get(name).unwrap();
            assert_eq!(agent.name(), name);
        }
        assert_eq!(
            registry.names(),
            vec!["claude-code", "codex", "ollama", "test"]
        );
    }

    #[test]
    fn unknown_agent_fails_loudly() {
        let registry = AgentRegistry::with_defaults(&GlobalConfig::default());
        let err = registry.get("unknown-agent").unwrap_err();
        assert!(err.to_string().contains("unknown agent: unknown-agent"));
    }

    #[test]
    fn model_name_validation() {
        for model in [
            "llama3",
            "qwen2.5-coder:latest",
            "mistral:7b-instruct",
            "library/llama3:latest",
            "model_name-v1.0:tag",
        ] {
            assert!(validate_model_name(model).is_ok(), "{model} should be valid");
        }

        for model in ["", "model with spaces", "model@version", "model\nname"] {
            assert!(validate_model_name(model).is_err(), "{model:?} should fail");
        }
    }

    #[test]
    fn sink_serializes_concurrent_writers() {
        struct SharedBuf(Arc<Mutex<Vec<u8>>>);
        impl Write for SharedBuf {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(ProgressSink::new(SharedBuf(buf.clone())));

        let mut handles = Vec::new();
        for i in 0..8 {
            let sink = sink.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    sink.write_chunk(&format!("[{i}]")).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Every 3-byte chunk lands intact: total length is exact and
        // the content is a clean sequence of bracketed digits.
        let contents = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        assert_eq!(contents.len(), 8 * 50 * 3);
        assert!(contents
            .as_bytes()
            .chunks(3)
            .all(|c| c[0] == b'[' && c[2] == b']'));
    }

    #[test]
    fn error_messages_carry_next_steps() {
        let err = AgentError::ModelNotFound {
            model: "llama9".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("ollama pull llama9"));

        let err = AgentError::ServerUnreachable {
            url: "http://localhost:11434".to_string(),
        };
        assert!(err.to_string().contains("ollama serve"));
    }
}
