//! Text-completion backends.
//!
//! Every pipeline step binds a fresh adapter through a [`BackendFactory`];
//! adapters are never shared between steps. The three variants are the
//! deterministic dummy, a local daemon speaking the Ollama protocol, and any
//! OpenAI-compatible chat-completions endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Marker the dummy backend puts on its first line.
pub const DUMMY_MARKER: &str = "Generated (dummy backend)";

/// A provider of text completions.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Single synchronous-style completion. No retries.
    async fn complete(&self, prompt: &str, model: &str) -> Result<String, BackendError>;
}

/// An adapter bound to the model it should use.
pub struct BoundBackend {
    backend: Box<dyn CompletionBackend>,
    model: String,
}

impl BoundBackend {
    pub fn new(backend: Box<dyn CompletionBackend>, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// True for the offline dummy backend.
    pub fn is_dummy(&self) -> bool {
        self.backend.name() == "dummy"
    }

    pub async fn complete(&self, prompt: &str) -> Result<String, BackendError> {
        tracing::debug!(
            backend = self.backend.name(),
            model = %self.model,
            prompt_chars = prompt.len(),
            "Completion request"
        );
        let text = self.backend.complete(prompt, &self.model).await?;
        tracing::debug!(backend = self.backend.name(), response_chars = text.len(), "Completion done");
        Ok(text)
    }
}

/// Creates one bound adapter per pipeline role ("planner", "bash", ...).
pub trait BackendFactory: Send + Sync {
    fn bind(&self, role: &str) -> BoundBackend;
}

impl<F> BackendFactory for F
where
    F: Fn(&str) -> BoundBackend + Send + Sync,
{
    fn bind(&self, role: &str) -> BoundBackend {
        self(role)
    }
}

/// Sampling and transport knobs shared by the HTTP variants.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 1024,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Which backend to build, with its connection details.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendSpec {
    Dummy,
    LocalDaemon {
        host: String,
    },
    OpenAiCompatible {
        base_url: String,
        api_key: String,
        system_prompt: Option<String>,
    },
}

impl BackendSpec {
    pub fn name(&self) -> &'static str {
        match self {
            BackendSpec::Dummy => "dummy",
            BackendSpec::LocalDaemon { .. } => "ollama",
            BackendSpec::OpenAiCompatible { .. } => "openai",
        }
    }

    pub fn build(&self, options: &GenerationOptions) -> Box<dyn CompletionBackend> {
        match self {
            BackendSpec::Dummy => Box::new(DummyBackend),
            BackendSpec::LocalDaemon { host } => {
                Box::new(LocalDaemonBackend::new(host, options.clone()))
            }
            BackendSpec::OpenAiCompatible {
                base_url,
                api_key,
                system_prompt,
            } => Box::new(OpenAiBackend::new(
                base_url,
                api_key,
                system_prompt.clone(),
                options.clone(),
            )),
        }
    }
}

/// Requests also carry the timeout themselves, so it holds even when the
/// configured client cannot be built and the plain one is used.
fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "HTTP client setup failed, using defaults");
            reqwest::Client::new()
        })
}

// ── Dummy ──────────────────────────────────────────────────────────────

/// Deterministic offline backend. The reply echoes the prompt as comment
/// lines so it stays syntactically inert in shell, Python and TOML files.
pub struct DummyBackend;

impl DummyBackend {
    pub fn render(prompt: &str) -> String {
        let mut out = format!("# {DUMMY_MARKER}\n#\n# Request:\n");
        for line in prompt.trim().lines() {
            let line = line.trim_end();
            if line.is_empty() {
                out.push_str("#\n");
            } else {
                out.push_str("# ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out.push_str("#\n# Response (template):\n");
        out.push_str("# - This is a deterministic placeholder used in tests.\n");
        out.push_str("# - Switch the backend to 'ollama' or 'openai' for real generation.\n");
        out
    }
}

#[async_trait]
impl CompletionBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn complete(&self, prompt: &str, _model: &str) -> Result<String, BackendError> {
        Ok(Self::render(prompt))
    }
}

// ── Local daemon (Ollama protocol) ─────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

pub struct LocalDaemonBackend {
    host: String,
    options: GenerationOptions,
    http: reqwest::Client,
}

impl LocalDaemonBackend {
    pub fn new(host: &str, options: GenerationOptions) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            http: http_client(options.timeout),
            options,
        }
    }
}

#[async_trait]
impl CompletionBackend for LocalDaemonBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn complete(&self, prompt: &str, model: &str) -> Result<String, BackendError> {
        let body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.options.temperature,
                "num_predict": self.options.max_tokens,
            },
        });

        let resp = self
            .http
            .post(format!("{}/api/generate", self.host))
            .timeout(self.options.timeout)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(parsed.response)
    }
}

// ── OpenAI-compatible ──────────────────────────────────────────────────

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful coding assistant.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

pub struct OpenAiBackend {
    base_url: String,
    api_key: String,
    system_prompt: String,
    options: GenerationOptions,
    http: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(
        base_url: &str,
        api_key: &str,
        system_prompt: Option<String>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            system_prompt: system_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            http: http_client(options.timeout),
            options,
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, prompt: &str, model: &str) -> Result<String, BackendError> {
        let messages = [
            ChatMessage {
                role: "system".to_string(),
                content: self.system_prompt.clone(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            },
        ];
        let body = serde_json::json!({
            "model": model,
            "temperature": self.options.temperature,
            "max_tokens": self.options.max_tokens,
            "messages": messages,
        });

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.options.timeout)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| BackendError::Decode("response has no choices".to_string()))
    }
}
