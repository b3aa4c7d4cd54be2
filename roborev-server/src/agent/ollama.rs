//! Ollama-backed agent: POST `/api/chat` with `stream: true` and
//! accumulate the newline-delimited JSON response.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use roborev_core::config::ReasoningLevel;

use super::{validate_model_name, Agent, AgentError, ProgressSink};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

const DEFAULT_MODEL: &str = "qwen2.5-coder:latest";

/// Liveness probe budget. Kept short so an absent server is reported
/// with the cheapest classification instead of a stalled chat request.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Malformed NDJSON lines tolerated before the response is treated as
/// non-JSON, provided no valid line has been seen yet.
const MAX_LEADING_PARSE_FAILURES: usize = 5;

#[derive(Clone)]
pub struct OllamaAgent {
    base_url: String,
    model: Option<String>,
    reasoning: ReasoningLevel,
    agentic: bool,
    client: reqwest::Client,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f64,
    top_p: f64,
}

#[derive(Debug, Deserialize, Default)]
struct ChatResponse {
    #[serde(default)]
    message: ChatMessage,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaAgent {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: if base_url.is_empty() {
                DEFAULT_BASE_URL.to_string()
            } else {
                base_url
            },
            model: None,
            reasoning: ReasoningLevel::default(),
            agentic: false,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    fn build_request(&self, prompt: &str) -> ChatRequest {
        let (temperature, top_p) = match self.reasoning {
            ReasoningLevel::Thorough => (0.3, 0.9),
            ReasoningLevel::Standard => (0.7, 0.95),
            ReasoningLevel::Fast => (1.0, 1.0),
        };

        ChatRequest {
            model: self.model().to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "You are a code review assistant. Analyze the provided code \
                              changes and provide constructive feedback."
                        .to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            stream: true,
            options: ChatOptions { temperature, top_p },
        }
    }

    /// Agentic mode only adds analysis capabilities to the prompt; the
    /// server has no tool-call execution loop.
    fn augment_prompt(&self, prompt: &str) -> String {
        if !self.agentic {
            return prompt.to_string();
        }
        format!(
            "{prompt}\n\nYou have access to the following analysis capabilities:\n\n\
             1. read_file(path: string) -> string\n   \
             Read the contents of a file at the given path.\n\n\
             Analyze the code thoroughly and describe any issues or suggestions clearly.\n"
        )
    }

    fn classify_transport(&self, err: reqwest::Error) -> AgentError {
        if err.is_timeout() {
            AgentError::Timeout
        } else if err.is_connect() {
            AgentError::ServerUnreachable {
                url: self.base_url.clone(),
            }
        } else {
            AgentError::Failed(format!("ollama request failed: {err}"))
        }
    }

    async fn check_health(&self) -> Result<(), AgentError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        if !response.status().is_success() {
            return Err(AgentError::ServerError {
                status: response.status().as_u16(),
                detail: "health check failed".to_string(),
            });
        }
        Ok(())
    }

    async fn parse_stream(
        &self,
        mut response: reqwest::Response,
        sink: Option<&ProgressSink>,
    ) -> Result<String, AgentError> {
        let mut accum = StreamAccum::default();
        let mut pending: Vec<u8> = Vec::new();

        'outer: loop {
            let chunk = response.chunk().await.map_err(|e| {
                if e.is_timeout() {
                    AgentError::Timeout
                } else {
                    AgentError::Stream(e.to_string())
                }
            })?;
            let Some(bytes) = chunk else { break };
            pending.extend_from_slice(&bytes);

            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                if accum.apply_line(line.trim(), sink)? {
                    break 'outer;
                }
            }
        }

        // Final line without a trailing newline.
        if !pending.is_empty() {
            let line = String::from_utf8_lossy(&pending).into_owned();
            accum.apply_line(line.trim(), sink)?;
        }

        if accum.result.is_empty() {
            Ok("No review output generated".to_string())
        } else {
            Ok(accum.result)
        }
    }
}

#[derive(Default)]
struct StreamAccum {
    result: String,
    parse_failures: usize,
    saw_valid: bool,
}

impl StreamAccum {
    /// Process one NDJSON line. Returns `true` when the stream is done.
    fn apply_line(
        &mut self,
        line: &str,
        sink: Option<&ProgressSink>,
    ) -> Result<bool, AgentError> {
        if line.is_empty() {
            return Ok(false);
        }

        let response: ChatResponse = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(_) => {
                self.parse_failures += 1;
                // Many failures before any valid line means the server is
                // returning an error page (e.g. HTML from a proxy).
                if !self.saw_valid && self.parse_failures >= MAX_LEADING_PARSE_FAILURES {
                    return Err(AgentError::Failed(format!(
                        "ollama returned non-JSON response (first line: {})",
                        truncate(line, 200)
                    )));
                }
                return Ok(false);
            }
        };
        self.saw_valid = true;
        self.parse_failures = 0;

        if let Some(error) = response.error.filter(|e| !e.is_empty()) {
            return Err(AgentError::Failed(format!("ollama error: {error}")));
        }

        if !response.message.content.is_empty() {
            self.result.push_str(&response.message.content);
            if let Some(sink) = sink {
                sink.write_chunk(&response.message.content)
                    .map_err(|e| AgentError::Stream(e.to_string()))?;
            }
        }

        Ok(response.done)
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[async_trait]
impl Agent for OllamaAgent {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn review(
        &self,
        _repo_path: &Path,
        _commit_sha: &str,
        prompt: &str,
        sink: Option<&ProgressSink>,
    ) -> Result<String, AgentError> {
        // Fast-fail when the server is down so the job records the
        // cheapest classification.
        self.check_health().await?;

        let prompt = self.augment_prompt(prompt);
        let request = self.build_request(&prompt);
        validate_model_name(&request.model)?;

        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                404 => AgentError::ModelNotFound {
                    model: request.model,
                },
                s if s >= 500 => AgentError::ServerError {
                    status: s,
                    detail: truncate(&body, 200),
                },
                s => AgentError::Failed(format!(
                    "ollama request failed (status {s}): {}",
                    truncate(&body, 200)
                )),
            });
        }

        self.parse_stream(response, sink).await
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

    fn with_agentic(self: Arc<Self>, agentic: bool) -> Arc<dyn Agent> {
        Arc::new(Self {
            agentic,
            ..(*self).clone()
        })
    }
}

/// Base-URL precedence: configuration, then `OLLAMA_HOST` (normalized
/// to carry a scheme), then the local default.
pub fn resolve_base_url(configured: Option<&str>) -> String {
    if let Some(url) = configured.filter(|u| !u.is_empty()) {
        return url.to_string();
    }
    if let Ok(env_url) = std::env::var("OLLAMA_HOST") {
        if !env_url.is_empty() {
            return normalize_url(&env_url);
        }
    }
    DEFAULT_BASE_URL.to_string()
}

/// `OLLAMA_HOST=myserver:11434` must not produce scheme-less request
/// URLs; assume http when none is given.
fn normalize_url(raw: &str) -> String {
    if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::Response;
    use axum::routing::{get, post};
    use axum::Router;
    use std::sync::Mutex;

    /// Serve `lines` as an NDJSON chat response on an ephemeral port,
    /// alongside a healthy `/api/tags`.
    async fn mock_server(status: StatusCode, body: String) -> String {
        let app = Router::new()
            .route("/api/tags", get(|| async { "{\"models\":[]}" }))
            .route(
                "/api/chat",
                post(move || {
                    let body = body.clone();
                    async move {
                        Response::builder()
                            .status(status)
                            .body(Body::from(body))
                            .unwrap()
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn ndjson(lines: &[&str]) -> String {
        let mut body = lines.join("\n");
        body.push('\n');
        body
    }

    #[tokio::test]
    async fn streaming_happy_path_accumulates_content() {
        let base = mock_server(
            StatusCode::OK,
            ndjson(&[
                r#"{"message":{"role":"assistant","content":"This "},"done":false}"#,
                r#"{"message":{"role":"assistant","content":"is "},"done":false}"#,
                r#"{"message":{"role":"assistant","content":"a test"},"done":false}"#,
                r#"{"message":{"role":"assistant","content":""},"done":true}"#,
            ]),
        )
        .await;

        let agent = OllamaAgent::new(base);
        let result = agent
            .review(Path::new("/tmp"), "abc123", "Review this code", None)
            .await
            .unwrap();
        assert_eq!(result, "This is a test");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let base = mock_server(
            StatusCode::OK,
            ndjson(&[
                r#"{"message":{"role":"assistant","content":"Good "},"done":false}"#,
                r#"{invalid json}"#,
                r#"{"message":{"role":"assistant","content":"line"},"done":false}"#,
                r#"{"message":{"role":"assistant","content":""},"done":true}"#,
            ]),
        )
        .await;

        let agent = OllamaAgent::new(base);
        let result = agent
            .review(Path::new("/tmp"), "abc123", "test", None)
            .await
            .unwrap();
        assert_eq!(result, "Good line");
    }

    #[tokio::test]
    async fn all_malformed_lines_fail_with_sample() {
        let base = mock_server(
            StatusCode::OK,
            ndjson(&[
                "<html>",
                "<body>",
                "502 Bad Gateway",
                "</body>",
                "</html>",
                "extra",
            ]),
        )
        .await;

        let agent = OllamaAgent::new(base);
        let err = agent
            .review(Path::new("/tmp"), "abc123", "test", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("non-JSON response"));
    }

    #[tokio::test]
    async fn empty_response_yields_placeholder() {
        let base = mock_server(
            StatusCode::OK,
            ndjson(&[r#"{"message":{"role":"assistant","content":""},"done":true}"#]),
        )
        .await;

        let agent = OllamaAgent::new(base);
        let result = agent
            .review(Path::new("/tmp"), "abc123", "test", None)
            .await
            .unwrap();
        assert_eq!(result, "No review output generated");
    }

    #[tokio::test]
    async fn in_band_error_field_fails_the_review() {
        let base = mock_server(
            StatusCode::OK,
            ndjson(&[r#"{"error":"model requires more system memory"}"#]),
        )
        .await;

        let agent = OllamaAgent::new(base);
        let err = agent
            .review(Path::new("/tmp"), "abc123", "test", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("more system memory"));
    }

    #[tokio::test]
    async fn http_404_classifies_as_model_not_found() {
        let base = mock_server(StatusCode::NOT_FOUND, r#"{"error":"model not found"}"#.into())
            .await;

        let agent: Arc<dyn Agent> =
            Arc::new(OllamaAgent::new(base)).with_model("nonexistent:model");
        let err = agent
            .review(Path::new("/tmp"), "abc123", "test", None)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("ollama pull nonexistent:model"));
    }

    #[tokio::test]
    async fn http_500_classifies_as_server_error() {
        let base = mock_server(
            StatusCode::INTERNAL_SERVER_ERROR,
            "model runner crashed".into(),
        )
        .await;

        let agent = OllamaAgent::new(base);
        let err = agent
            .review(Path::new("/tmp"), "abc123", "test", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ServerError { status: 500, .. }));
    }

    #[tokio::test]
    async fn connection_refused_classifies_as_unreachable() {
        // Nothing listens on port 1.
        let agent = OllamaAgent::new("http://127.0.0.1:1");
        let err = agent
            .review(Path::new("/tmp"), "abc123", "test", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ServerUnreachable { .. }));
        assert!(err.to_string().contains("ollama serve"));
    }

    #[tokio::test]
    async fn sink_receives_chunks_as_they_stream() {
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

        let base = mock_server(
            StatusCode::OK,
            ndjson(&[
                r#"{"message":{"role":"assistant","content":"chunk1 "},"done":false}"#,
                r#"{"message":{"role":"assistant","content":"chunk2"},"done":false}"#,
                r#"{"message":{"role":"assistant","content":""},"done":true}"#,
            ]),
        )
        .await;

        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = ProgressSink::new(VecSink(buf.clone()));
        let agent = OllamaAgent::new(base);
        let result = agent
            .review(Path::new("/tmp"), "abc123", "test", Some(&sink))
            .await
            .unwrap();

        assert_eq!(result, "chunk1 chunk2");
        assert_eq!(
            String::from_utf8(buf.lock().unwrap().clone()).unwrap(),
            "chunk1 chunk2"
        );
    }

    #[test]
    fn builders_return_configured_copies() {
        let agent = Arc::new(OllamaAgent::new(""));
        assert_eq!(agent.base_url(), DEFAULT_BASE_URL);
        assert_eq!(agent.model(), DEFAULT_MODEL);

        let configured = agent.clone().with_model("llama3:70b");
        // The original is untouched by the builder.
        assert_eq!(agent.model(), DEFAULT_MODEL);
        assert_eq!(configured.name(), "ollama");

        let same = agent.clone().with_model("");
        let original: Arc<dyn Agent> = agent;
        assert!(Arc::ptr_eq(&original, &same));
    }

    #[test]
    fn reasoning_maps_to_sampling_parameters() {
        let cases = [
            (ReasoningLevel::Thorough, 0.3, 0.9),
            (ReasoningLevel::Standard, 0.7, 0.95),
            (ReasoningLevel::Fast, 1.0, 1.0),
        ];
        for (level, temperature, top_p) in cases {
            let mut agent = OllamaAgent::new("");
            agent.reasoning = level;
            let request = agent.build_request("test prompt");
            assert_eq!(request.options.temperature, temperature);
            assert_eq!(request.options.top_p, top_p);
            assert!(request.stream);
            assert_eq!(request.messages.len(), 2);
            assert_eq!(request.messages[0].role, "system");
            assert_eq!(request.messages[1].content, "test prompt");
        }
    }

    #[test]
    fn agentic_mode_appends_capabilities() {
        let plain = OllamaAgent::new("");
        assert_eq!(plain.augment_prompt("Review this"), "Review this");

        let mut agentic = OllamaAgent::new("");
        agentic.agentic = true;
        let augmented = agentic.augment_prompt("Review this");
        assert!(augmented.starts_with("Review this"));
        assert!(augmented.contains("read_file"));
    }

    #[test]
    fn base_url_resolution_precedence() {
        // One test covers every OLLAMA_HOST case so parallel tests
        // never race on the environment variable.
        std::env::set_var("OLLAMA_HOST", "http://env-host:9999");
        assert_eq!(
            resolve_base_url(Some("http://config-host:8080")),
            "http://config-host:8080"
        );
        assert_eq!(resolve_base_url(None), "http://env-host:9999");
        assert_eq!(resolve_base_url(Some("")), "http://env-host:9999");

        // Scheme-less hosts are normalized.
        std::env::set_var("OLLAMA_HOST", "myserver:11434");
        assert_eq!(resolve_base_url(None), "http://myserver:11434");

        std::env::remove_var("OLLAMA_HOST");
        assert_eq!(resolve_base_url(None), DEFAULT_BASE_URL);
    }

    #[test]
    fn truncate_limits_and_marks() {
        assert_eq!(truncate("short", 200), "short");
        let long = "x".repeat(300);
        let out = truncate(&long, 200);
        assert_eq!(out.len(), 203);
        assert!(out.ends_with("..."));
    }
}
