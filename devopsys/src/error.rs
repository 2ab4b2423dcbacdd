//! Error taxonomy for the pipeline.
//!
//! Only [`PlanningError`] aborts a request. [`GenerationError`] is recorded
//! on the failing step and the run moves on; [`BackendError`] always reaches
//! callers wrapped in one of the other two.

use std::path::PathBuf;

/// A text-completion call failed.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("backend request failed: {0}")]
    Transport(String),
    #[error("malformed backend response: {0}")]
    Decode(String),
    /// The backend answered 200 but reported a failure in the body.
    #[error("backend reported an error: {0}")]
    Remote(String),
}

impl BackendError {
    /// HTTP status, when the backend answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => BackendError::Status {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None if e.is_decode() => BackendError::Decode(e.to_string()),
            None => BackendError::Transport(e.to_string()),
        }
    }
}

/// One step could not produce its artifact.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("could not parse {agent} output: {reason}")]
    Parse { agent: String, reason: String },
    #[error("refusing to write outside the output root: {0}")]
    UnsafePath(String),
    #[error("refusing to overwrite existing file {}", .0.display())]
    Exists(PathBuf),
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The request could not be turned into something executable.
#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    #[error("planner backend failed: {0}")]
    Backend(#[source] BackendError),
    #[error("planner returned no usable plan")]
    Unparsable { raw: String },
    #[error("project architect failed: {0}")]
    Architect(#[source] GenerationError),
    #[error("cannot prepare project root {}: {source}", path.display())]
    ProjectRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PlanningError {
    /// Raw model output kept for diagnostics, if any.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            PlanningError::Unparsable { raw } => Some(raw),
            _ => None,
        }
    }
}

/// Settings could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bad config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unknown backend '{0}' (expected dummy, ollama, openai or deepseek)")]
    UnknownBackend(String),
    #[error("the {backend} backend needs an API key ({hint})")]
    MissingApiKey {
        backend: &'static str,
        hint: &'static str,
    },
    #[error("bad agent model override '{0}' (expected name=model)")]
    AgentModel(String),
}
