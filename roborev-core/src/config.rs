//! TOML configuration: the global daemon config and per-repository
//! overrides.
//!
//! Two files are recognized. The global `<data_dir>/config.toml` sets
//! daemon-wide defaults; a repository may carry a `.roborev.toml` at its
//! root to override agent selection for its own commits. Unknown keys in
//! either file are ignored so older daemons tolerate newer configs.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Agent used when neither the request nor any config names one.
pub const DEFAULT_AGENT: &str = "codex";

/// Worker pool size when the global config does not set one.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Recent reviews included in a prompt when the repo config is silent.
pub const DEFAULT_REVIEW_CONTEXT_COUNT: usize = 5;

/// How much effort a backend should spend on a review. Each driver maps
/// this to its own knobs (sampling parameters, CLI flags).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningLevel {
    Fast,
    #[default]
    Standard,
    Thorough,
}

impl ReasoningLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningLevel::Fast => "fast",
            ReasoningLevel::Standard => "standard",
            ReasoningLevel::Thorough => "thorough",
        }
    }
}

impl fmt::Display for ReasoningLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasoningLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(ReasoningLevel::Fast),
            "standard" => Ok(ReasoningLevel::Standard),
            "thorough" => Ok(ReasoningLevel::Thorough),
            other => Err(format!(
                "invalid reasoning level {other:?} (expected fast, standard or thorough)"
            )),
        }
    }
}

/// Daemon-wide configuration from `<data_dir>/config.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Listen address, e.g. `127.0.0.1:7373`. Only the port is
    /// configurable; the daemon always binds loopback.
    pub server_addr: Option<String>,
    pub max_workers: usize,
    pub default_agent: Option<String>,
    pub default_model: Option<String>,
    pub ollama_base_url: Option<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            server_addr: None,
            max_workers: DEFAULT_MAX_WORKERS,
            default_agent: None,
            default_model: None,
            ollama_base_url: None,
        }
    }
}

impl GlobalConfig {
    /// Load from `<data_dir>/config.toml`. A missing file yields
    /// defaults; a malformed file is an error.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = crate::paths::global_config_path(data_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }

    /// Port from `server_addr`, if one is configured and parseable.
    pub fn configured_port(&self) -> Option<u16> {
        let addr = self.server_addr.as_deref()?;
        addr.rsplit(':').next()?.parse().ok()
    }
}

/// Per-repository overrides from `<repo>/.roborev.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub agent: Option<String>,
    pub model: Option<String>,
    pub reasoning: Option<ReasoningLevel>,
    pub review_context_count: Option<usize>,
    pub review_guidelines: Option<String>,
}

impl RepoConfig {
    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = repo_root.join(".roborev.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }

    pub fn context_count(&self) -> usize {
        self.review_context_count
            .unwrap_or(DEFAULT_REVIEW_CONTEXT_COUNT)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

/// Agent selection precedence: request argument, then the repo config,
/// then the global config, then the built-in default.
pub fn resolve_agent(
    requested: Option<&str>,
    repo: &RepoConfig,
    global: &GlobalConfig,
) -> String {
    non_empty(requested)
        .or_else(|| non_empty(repo.agent.as_deref()))
        .or_else(|| non_empty(global.default_agent.as_deref()))
        .unwrap_or(DEFAULT_AGENT)
        .to_string()
}

/// Model precedence mirrors agent precedence; `None` lets the driver
/// pick its own default.
pub fn resolve_model(
    requested: Option<&str>,
    repo: &RepoConfig,
    global: &GlobalConfig,
) -> Option<String> {
    non_empty(requested)
        .or_else(|| non_empty(repo.model.as_deref()))
        .or_else(|| non_empty(global.default_model.as_deref()))
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn global_defaults_when_file_missing() {
        let dir = TempDir::new().unwrap();
        let cfg = GlobalConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.max_workers, DEFAULT_MAX_WORKERS);
        assert!(cfg.default_agent.is_none());
        assert!(cfg.server_addr.is_none());
    }

    #[test]
    fn global_parses_known_keys_and_ignores_unknown() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.toml"),
            r#"
server_addr = "127.0.0.1:9999"
max_workers = 8
default_agent = "ollama"
default_model = "qwen2.5-coder:latest"
ollama_base_url = "http://gpu-box:11434"
some_future_knob = true
"#,
        )
        .unwrap();

        let cfg = GlobalConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.max_workers, 8);
        assert_eq!(cfg.default_agent.as_deref(), Some("ollama"));
        assert_eq!(cfg.configured_port(), Some(9999));
        assert_eq!(cfg.ollama_base_url.as_deref(), Some("http://gpu-box:11434"));
    }

    #[test]
    fn global_rejects_malformed_toml() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("config.toml"), "max_workers = [not toml").unwrap();
        assert!(GlobalConfig::load(dir.path()).is_err());
    }

    #[test]
    fn repo_config_defaults_and_parse() {
        let dir = TempDir::new().unwrap();
        let cfg = RepoConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.context_count(), DEFAULT_REVIEW_CONTEXT_COUNT);
        assert!(cfg.agent.is_none());

        fs::write(
            dir.path().join(".roborev.toml"),
            r#"
agent = "claude-code"
reasoning = "thorough"
review_context_count = 2
review_guidelines = """
Focus on error handling.
"""
"#,
        )
        .unwrap();

        let cfg = RepoConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.agent.as_deref(), Some("claude-code"));
        assert_eq!(cfg.reasoning, Some(ReasoningLevel::Thorough));
        assert_eq!(cfg.context_count(), 2);
        assert!(cfg
            .review_guidelines
            .as_deref()
            .unwrap()
            .contains("error handling"));
    }

    #[test]
    fn agent_precedence_request_repo_global_default() {
        let repo = RepoConfig {
            agent: Some("ollama".into()),
            ..Default::default()
        };
        let global = GlobalConfig {
            default_agent: Some("claude-code".into()),
            ..Default::default()
        };

        assert_eq!(resolve_agent(Some("test"), &repo, &global), "test");
        assert_eq!(resolve_agent(None, &repo, &global), "ollama");
        assert_eq!(
            resolve_agent(None, &RepoConfig::default(), &global),
            "claude-code"
        );
        assert_eq!(
            resolve_agent(None, &RepoConfig::default(), &GlobalConfig::default()),
            DEFAULT_AGENT
        );
        // Empty strings do not shadow lower-precedence sources.
        assert_eq!(resolve_agent(Some(""), &repo, &global), "ollama");
    }

    #[test]
    fn model_precedence_falls_back_to_none() {
        let repo = RepoConfig {
            model: Some("llama3:70b".into()),
            ..Default::default()
        };
        let global = GlobalConfig::default();

        assert_eq!(
            resolve_model(Some("o3"), &repo, &global).as_deref(),
            Some("o3")
        );
        assert_eq!(
            resolve_model(None, &repo, &global).as_deref(),
            Some("llama3:70b")
        );
        assert_eq!(
            resolve_model(None, &RepoConfig::default(), &global),
            None
        );
    }

    #[test]
    fn reasoning_level_round_trips() {
        for level in [
            ReasoningLevel::Fast,
            ReasoningLevel::Standard,
            ReasoningLevel::Thorough,
        ] {
            assert_eq!(level.as_str().parse::<ReasoningLevel>().unwrap(), level);
        }
        assert!("highest".parse::<ReasoningLevel>().is_err());
    }
}
