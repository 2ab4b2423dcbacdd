//! Orchestrator: plan, run every step in order, validate, report.
//!
//! One request moves through `planning → executing(i) → reporting → done`,
//! or lands in `failed` when planning breaks. Steps run strictly one after
//! another; each binds its own backend. A step that cannot produce its
//! artifact is recorded and the loop carries on.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::agents::{self, AgentOutput, Artifact, Capability};
use crate::config::{PLANNER_ROLE, Settings};
use crate::error::{GenerationError, PlanningError};
use crate::llm::BackendFactory;
use crate::plan::{LeadPlanner, Plan, Subtask};
use crate::project::ProjectOutcome;
use crate::validate::{ValidationResult, Validator};
use crate::workspace::{self, Workspace};

const SNAPSHOT_MAX_FILES: usize = 20;
const SNAPSHOT_MAX_BYTES: usize = 2000;

/// What the user asked for. Immutable once accepted.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub text: String,
    /// Skip planning and use this capability.
    pub agent: Option<String>,
    /// Target distribution for Linux steps.
    pub os: Option<String>,
    /// Save the last step's artifact here.
    pub output_path: Option<PathBuf>,
    /// Project mode: generate a multi-file project below this directory.
    pub project_root: Option<PathBuf>,
    /// Replace existing files under the project root.
    pub overwrite: bool,
    /// Project mode: provision a venv and try the entrypoint.
    pub run_project: bool,
}

impl Request {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(root.into());
        self
    }
}

/// Pipeline state.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Idle,
    Planning,
    Executing(usize),
    Reporting,
    Done,
    Failed(String),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Planning => write!(f, "planning"),
            Phase::Executing(i) => write!(f, "executing({i})"),
            Phase::Reporting => write!(f, "reporting"),
            Phase::Done => write!(f, "done"),
            Phase::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Per-step record. The ordered list of these is the report.
#[derive(Debug, Clone, Serialize)]
pub struct StepTrace {
    pub index: usize,
    pub description: String,
    /// Capability as the plan declared it.
    pub requested_capability: String,
    /// Agent that actually ran.
    pub agent: Capability,
    /// Set when the selector did not honour the request as written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub artifact: Option<Artifact>,
    pub persisted_path: Option<PathBuf>,
    pub error: Option<String>,
    pub validation: Option<ValidationResult>,
}

impl StepTrace {
    /// The step produced its artifact (and saved it, when asked to).
    pub fn succeeded(&self) -> bool {
        self.artifact.is_some() && self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub request: String,
    pub steps: Vec<StepTrace>,
    pub overall_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Report {
    pub(crate) fn assemble(
        request: &Request,
        steps: Vec<StepTrace>,
        project: Option<ProjectOutcome>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let overall_success = steps.iter().all(StepTrace::succeeded);
        Self {
            request: request.text.clone(),
            steps,
            overall_success,
            project,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Progress notifications, delivered synchronously in pipeline order.
#[derive(Debug)]
pub enum Event<'a> {
    Phase(&'a Phase),
    Planned(&'a Plan),
    StepStarted {
        index: usize,
        total: usize,
        agent: Capability,
        description: &'a str,
    },
    StepFinished(&'a StepTrace),
}

pub type Observer = Box<dyn Fn(&Event<'_>) + Send + Sync>;

/// Where a step's artifact goes.
pub(crate) enum Persist<'a> {
    Nowhere,
    Explicit(&'a Path),
    Workspace(&'a Workspace),
}

pub struct Orchestrator {
    pub(crate) factory: Arc<dyn BackendFactory>,
    pub(crate) validator: Validator,
    snapshot_root: Option<PathBuf>,
    observer: Option<Observer>,
    pub phase: Arc<Mutex<Phase>>,
}

impl Orchestrator {
    /// Build from resolved settings: they supply both the backends and the
    /// validator's external-check policy.
    pub fn new(settings: Settings) -> Self {
        let validator = Validator::new(settings.external_checks);
        Self::with_factory(Arc::new(settings), validator)
    }

    pub fn with_factory(factory: Arc<dyn BackendFactory>, validator: Validator) -> Self {
        Self {
            factory,
            validator,
            snapshot_root: None,
            observer: None,
            phase: Arc::new(Mutex::new(Phase::Idle)),
        }
    }

    /// Show the planner (and agents) a read-only snapshot of this directory.
    pub fn with_snapshot_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.snapshot_root = Some(root.into());
        self
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    pub async fn phase(&self) -> Phase {
        self.phase.lock().await.clone()
    }

    pub(crate) fn emit(&self, event: Event<'_>) {
        if let Some(observer) = &self.observer {
            observer(&event);
        }
    }

    pub(crate) async fn set_phase(&self, phase: Phase) {
        tracing::info!(phase = %phase, "Phase");
        self.emit(Event::Phase(&phase));
        *self.phase.lock().await = phase;
    }

    pub(crate) fn snapshot(&self, root: Option<&Path>) -> String {
        root.or(self.snapshot_root.as_deref())
            .map(|r| workspace::snapshot(r, SNAPSHOT_MAX_FILES, SNAPSHOT_MAX_BYTES))
            .unwrap_or_default()
    }

    /// Process one request. Only planning failures are returned as errors;
    /// everything else ends up in the report.
    pub async fn run(&self, request: &Request) -> Result<Report, PlanningError> {
        if let Some(root) = &request.project_root {
            return self.run_project(request, root).await;
        }

        let started_at = Utc::now();
        self.set_phase(Phase::Planning).await;
        let plan = match self.plan(request).await {
            Ok(plan) => plan,
            Err(e) => {
                self.set_phase(Phase::Failed(e.to_string())).await;
                return Err(e);
            }
        };
        tracing::info!(steps = plan.len(), "Plan ready");
        self.emit(Event::Planned(&plan));

        let total = plan.len();
        let mut steps = Vec::with_capacity(total);
        for subtask in &plan.subtasks {
            self.set_phase(Phase::Executing(subtask.index)).await;
            let persist = match &request.output_path {
                Some(path) if subtask.index + 1 == total => Persist::Explicit(path),
                _ => Persist::Nowhere,
            };
            steps.push(self.execute_step(subtask, total, persist).await);
        }

        self.set_phase(Phase::Reporting).await;
        let report = Report::assemble(request, steps, None, started_at);
        self.set_phase(Phase::Done).await;
        Ok(report)
    }

    async fn plan(&self, request: &Request) -> Result<Plan, PlanningError> {
        let snapshot = self.snapshot(None);
        let mut plan = match &request.agent {
            Some(agent) => Plan::forced(&request.text, agent),
            None => {
                let planner = LeadPlanner::new(self.factory.bind(PLANNER_ROLE));
                planner.plan(&request.text, &snapshot).await?
            }
        };
        if let Some(os) = &request.os {
            plan.tag_capability(Capability::Linux, "os", os);
        }
        if !snapshot.is_empty() {
            for subtask in &mut plan.subtasks {
                subtask.params.insert("workspace".to_string(), snapshot.clone());
            }
        }
        Ok(plan)
    }

    /// Select, generate, persist, validate. Never fails; problems land in the trace.
    pub(crate) async fn execute_step(
        &self,
        subtask: &Subtask,
        total: usize,
        persist: Persist<'_>,
    ) -> StepTrace {
        let selection = agents::select(&subtask.capability);
        let agent = selection.agent;
        if let Some(note) = &selection.note {
            tracing::warn!(step = subtask.index, "{note}");
        }
        self.emit(Event::StepStarted {
            index: subtask.index,
            total,
            agent: agent.capability(),
            description: &subtask.description,
        });
        tracing::info!(step = subtask.index, agent = %agent.capability(), "Step started");

        let mut trace = StepTrace {
            index: subtask.index,
            description: subtask.description.clone(),
            requested_capability: subtask.capability.clone(),
            agent: agent.capability(),
            note: selection.note,
            artifact: None,
            persisted_path: None,
            error: None,
            validation: None,
        };

        let backend = self.factory.bind(agent.capability().tag());
        let artifact = match agent.run(subtask, &backend).await {
            Ok(AgentOutput::Artifact(artifact)) => artifact,
            // An architect inside a regular plan reports its plan as JSON.
            Ok(AgentOutput::Project(plan)) => match serde_json::to_string_pretty(&plan) {
                Ok(content) => Artifact {
                    content,
                    path: subtask
                        .param("path")
                        .map(str::to_string)
                        .unwrap_or_else(|| agent.default_path(subtask)),
                    subtask_index: subtask.index,
                },
                Err(e) => {
                    trace.error = Some(format!("could not encode project plan: {e}"));
                    return self.finish_step(trace);
                }
            },
            Err(e) => {
                tracing::warn!(step = subtask.index, agent = %agent.capability(), error = %e, "Step failed");
                trace.error = Some(e.to_string());
                return self.finish_step(trace);
            }
        };

        let written: Result<Option<PathBuf>, GenerationError> = match persist {
            Persist::Nowhere => Ok(None),
            Persist::Explicit(path) => workspace::write_explicit(path, &artifact.content).await.map(Some),
            Persist::Workspace(ws) => ws.write_file(&artifact.path, &artifact.content).await.map(Some),
        };
        match written {
            Ok(path) => trace.persisted_path = path,
            Err(e) => {
                tracing::warn!(step = subtask.index, path = %artifact.path, error = %e, "Could not save artifact");
                trace.error = Some(e.to_string());
            }
        }

        trace.validation = Some(self.validator.validate(&artifact.path, &artifact.content).await);
        trace.artifact = Some(artifact);
        self.finish_step(trace)
    }

    fn finish_step(&self, trace: StepTrace) -> StepTrace {
        tracing::info!(
            step = trace.index,
            agent = %trace.agent,
            success = trace.succeeded(),
            status = %trace.validation.as_ref().map(|v| v.status.to_string()).unwrap_or_default(),
            "Step finished"
        );
        self.emit(Event::StepFinished(&trace));
        trace
    }
}
