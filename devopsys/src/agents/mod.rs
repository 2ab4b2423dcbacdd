//! Capability-tagged agents and the selector that maps a plan step to one.
//!
//! Agents hold no state: each run builds a prompt from the subtask, makes a
//! single call on the backend it was handed, and shapes the reply into
//! either a file [`Artifact`] or, for the architect, a [`ProjectPlan`].

pub mod architect;
pub mod normalize;
pub mod prompts;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GenerationError;
use crate::llm::BoundBackend;
use crate::plan::Subtask;

pub use architect::{FileSpec, ProjectPlan};

/// The specialist kinds the pipeline knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Docker,
    Python,
    Rust,
    Bash,
    Linux,
    Universal,
    ProjectArchitect,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::Docker,
        Capability::Python,
        Capability::Rust,
        Capability::Bash,
        Capability::Linux,
        Capability::Universal,
        Capability::ProjectArchitect,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Capability::Docker => "docker",
            Capability::Python => "python",
            Capability::Rust => "rust",
            Capability::Bash => "bash",
            Capability::Linux => "linux",
            Capability::Universal => "universal",
            Capability::ProjectArchitect => "project_architect",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" | "dockerfile" => Ok(Capability::Docker),
            "python" | "py" => Ok(Capability::Python),
            "rust" | "rs" => Ok(Capability::Rust),
            "bash" | "shell" | "sh" => Ok(Capability::Bash),
            "linux" => Ok(Capability::Linux),
            "universal" | "any" => Ok(Capability::Universal),
            "project_architect" | "project-architect" | "architect" | "project" => {
                Ok(Capability::ProjectArchitect)
            }
            other => Err(format!("unknown capability '{other}'")),
        }
    }
}

/// What an agent hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    File,
    ProjectPlan,
}

/// Generated file content with the path it should be saved under.
///
/// `subtask_index` points back at the step that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub content: String,
    pub path: String,
    pub subtask_index: usize,
}

#[derive(Debug, Clone)]
pub enum AgentOutput {
    Artifact(Artifact),
    Project(ProjectPlan),
}

/// A stateless specialist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Agent {
    capability: Capability,
}

impl Agent {
    pub fn new(capability: Capability) -> Self {
        Self { capability }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn output_kind(&self) -> OutputKind {
        match self.capability {
            Capability::ProjectArchitect => OutputKind::ProjectPlan,
            _ => OutputKind::File,
        }
    }

    /// Default file name when the subtask does not pin a path.
    pub fn default_path(&self, subtask: &Subtask) -> String {
        match self.capability {
            Capability::Docker => "Dockerfile".to_string(),
            Capability::Bash => "script.sh".to_string(),
            Capability::Python => {
                if subtask.description.to_lowercase().contains("main.py") {
                    "main.py".to_string()
                } else {
                    "script.py".to_string()
                }
            }
            Capability::Rust => "rust_project.txt".to_string(),
            Capability::Linux => "linux_setup.txt".to_string(),
            Capability::Universal => "output.txt".to_string(),
            Capability::ProjectArchitect => "project_plan.json".to_string(),
        }
    }

    pub fn build_prompt(&self, subtask: &Subtask) -> String {
        prompts::render(self.capability, subtask)
    }

    /// Shape a raw completion into this agent's output.
    pub fn parse(&self, raw: &str, subtask: &Subtask) -> Result<AgentOutput, GenerationError> {
        let path = subtask
            .param("path")
            .map(str::to_string)
            .unwrap_or_else(|| self.default_path(subtask));

        let content = match self.capability {
            Capability::ProjectArchitect => {
                let plan = architect::parse_project_plan(raw)?;
                return Ok(AgentOutput::Project(plan));
            }
            Capability::Bash => normalize::bash_script(raw, &subtask.description),
            Capability::Python => normalize::python_script(raw, &subtask.description),
            Capability::Docker => self.require_text(normalize::dockerfile(raw))?,
            Capability::Universal => self.require_text(normalize::strip_code_fences(raw.trim()))?,
            Capability::Rust | Capability::Linux => self.require_text(raw.trim().to_string())?,
        };

        Ok(AgentOutput::Artifact(Artifact {
            content,
            path,
            subtask_index: subtask.index,
        }))
    }

    fn require_text(&self, text: String) -> Result<String, GenerationError> {
        if text.trim().is_empty() {
            return Err(GenerationError::Parse {
                agent: self.capability.to_string(),
                reason: "empty response".to_string(),
            });
        }
        Ok(text)
    }

    /// Prompt, call the backend once, parse.
    pub async fn run(
        &self,
        subtask: &Subtask,
        backend: &BoundBackend,
    ) -> Result<AgentOutput, GenerationError> {
        let prompt = self.build_prompt(subtask);
        tracing::debug!(agent = %self.capability, step = subtask.index, "Prompt built");
        let raw = backend.complete(&prompt).await?;
        self.parse(&raw, subtask)
    }
}

/// Selector outcome: the agent plus a note when the request was not honoured as written.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub agent: Agent,
    pub note: Option<String>,
}

/// Map a declared capability string to an agent. Unknown strings get the
/// universal agent and a note; this never fails.
pub fn select(capability: &str) -> Selection {
    let trimmed = capability.trim();
    if trimmed.is_empty() {
        return Selection {
            agent: Agent::new(Capability::Universal),
            note: None,
        };
    }
    match trimmed.parse::<Capability>() {
        Ok(cap) => Selection {
            agent: Agent::new(cap),
            note: None,
        },
        Err(reason) => Selection {
            agent: Agent::new(Capability::Universal),
            note: Some(format!("{reason}, using universal")),
        },
    }
}
