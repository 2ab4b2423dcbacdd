//! Project materializer.
//!
//! The architect's call is the planning step of project mode: its failure
//! aborts the request. Each planned file then runs through the ordinary
//! generate, persist, validate cycle in declaration order, written directly
//! under the caller's root. Afterwards the entrypoint can optionally be
//! smoke-tested in a fresh virtualenv; that probe never fails the run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::agents::{Agent, AgentOutput, Capability, FileSpec, ProjectPlan};
use crate::error::{GenerationError, PlanningError};
use crate::orchestrator::{Event, Orchestrator, Persist, Phase, Report, Request};
use crate::plan::{Plan, Subtask};
use crate::workspace::{self, CommandError, CommandOutput, Workspace};

const VENV_TIMEOUT: Duration = Duration::from_secs(120);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
const RUN_TIMEOUT: Duration = Duration::from_secs(45);
const OUTPUT_LIMIT: usize = 2000;

/// How to start the generated project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum Entrypoint {
    /// A Python file relative to the root.
    File(String),
    /// `python -m <module>`.
    Module(String),
    /// A console script installed from `[project.scripts]`.
    Script(String),
}

impl Entrypoint {
    fn from_declared(value: &str) -> Result<Self, String> {
        let value = value.trim();
        let entry = if value.ends_with(".py") {
            Entrypoint::File(value.to_string())
        } else if let Some((module, _)) = value.split_once(':') {
            Entrypoint::Module(module.trim().to_string())
        } else {
            Entrypoint::Script(value.to_string())
        };
        entry.confined()?;
        Ok(entry)
    }

    /// Files must stay below the root and scripts must be a bare name
    /// inside `.venv/bin`.
    pub fn confined(&self) -> Result<(), String> {
        let ok = match self {
            Entrypoint::File(file) => workspace::safe_relative(file).is_ok(),
            Entrypoint::Module(module) => {
                !module.is_empty()
                    && module.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.')
            }
            Entrypoint::Script(script) => workspace::safe_relative(script)
                .is_ok_and(|rel| rel.components().count() == 1),
        };
        if ok {
            Ok(())
        } else {
            Err(format!("entrypoint '{self}' points outside the project"))
        }
    }
}

impl fmt::Display for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entrypoint::File(file) => write!(f, "python {file}"),
            Entrypoint::Module(module) => write!(f, "python -m {module}"),
            Entrypoint::Script(script) => write!(f, "{script}"),
        }
    }
}

/// Outcome of the optional runtime smoke test.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeProbe {
    pub success: bool,
    /// Commands that ran, in order.
    pub commands: Vec<String>,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectOutcome {
    pub root: PathBuf,
    pub name: String,
    pub slug: String,
    pub summary: String,
    pub files: Vec<String>,
    pub entrypoint: Option<Entrypoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeProbe>,
}

/// Context block handed to the agent generating `file`.
pub fn file_context(plan: &ProjectPlan, file: &FileSpec, ready: &[String]) -> String {
    let mut lines = vec![format!("Project: {} ({})", plan.project_name, plan.language)];
    let described = plan.describe();
    if !described.is_empty() {
        lines.push(described);
    }
    if !file.goal.is_empty() {
        lines.push(format!("File goal: {}", file.goal));
    }
    let capabilities: Vec<&str> = plan.files.iter().map(|f| f.capability.tag()).collect();
    lines.push(format!("Agents involved: {}", dedup(&capabilities).join(", ")));
    if !ready.is_empty() {
        lines.push("Existing files:".to_string());
        lines.extend(ready.iter().map(|f| format!("- {f}")));
    }
    lines.join("\n")
}

fn dedup<'a>(items: &[&'a str]) -> Vec<&'a str> {
    let mut out: Vec<&str> = Vec::new();
    for item in items {
        if !out.contains(item) {
            out.push(item);
        }
    }
    out
}

/// The single-file subtask for one planned file.
pub fn file_subtask(plan: &ProjectPlan, file: &FileSpec, index: usize, ready: &[String]) -> Subtask {
    Subtask::new(index, plan.build_instruction(file), file.capability.tag())
        .with_reason(format!("file {} of {} in project '{}'", index + 1, plan.files.len(), plan.project_name))
        .with_param("path", file.path.clone())
        .with_param("context", file_context(plan, file, ready))
}

/// Declared entrypoint, else the first `[project.scripts]` entry of a
/// generated `pyproject.toml`, else a generated `main.py`. A target that
/// would run something outside the project is an error.
pub async fn detect_entrypoint(plan: &ProjectPlan, root: &Path) -> Result<Option<Entrypoint>, String> {
    if let Some(declared) = &plan.entrypoint {
        return Entrypoint::from_declared(declared).map(Some);
    }
    if let Ok(text) = tokio::fs::read_to_string(root.join("pyproject.toml")).await
        && let Ok(doc) = text.parse::<toml::Table>()
        && let Some(name) = doc
            .get("project")
            .and_then(|p| p.get("scripts"))
            .and_then(|s| s.as_table())
            .and_then(|t| t.keys().next())
    {
        let script = Entrypoint::Script(name.clone());
        script.confined()?;
        return Ok(Some(script));
    }
    if tokio::fs::try_exists(root.join("main.py")).await.unwrap_or(false) {
        return Ok(Some(Entrypoint::File("main.py".to_string())));
    }
    Ok(None)
}

struct ProbeLog {
    commands: Vec<String>,
    output: Vec<String>,
}

impl ProbeLog {
    fn new() -> Self {
        Self {
            commands: Vec::new(),
            output: Vec::new(),
        }
    }

    /// A probe that stopped before running anything.
    fn refused(reason: impl Into<String>) -> RuntimeProbe {
        let mut log = Self::new();
        log.output.push(reason.into());
        log.finish(false)
    }

    fn record(&mut self, program: &str, args: &[&str], result: &Result<CommandOutput, CommandError>) {
        let mut line = program.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.commands.push(line);
        match result {
            Ok(out) => {
                let text = out.combined(OUTPUT_LIMIT);
                if !text.is_empty() {
                    self.output.push(text);
                }
            }
            Err(e) => self.output.push(format!("{program}: {e}")),
        }
    }

    fn finish(self, success: bool) -> RuntimeProbe {
        RuntimeProbe {
            success,
            commands: self.commands,
            output: self.output.join("\n"),
        }
    }
}

async fn step(
    log: &mut ProbeLog,
    root: &Path,
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let result = workspace::run_command(program, args, Some(root), timeout).await;
    log.record(program, args, &result);
    result
}

/// Provision `.venv` (uv, else `python3 -m venv`), install the project when
/// it has a `pyproject.toml`, then run the entrypoint with `--help`.
pub async fn probe_runtime(root: &Path, entrypoint: Option<&Entrypoint>) -> RuntimeProbe {
    let Some(entrypoint) = entrypoint else {
        return ProbeLog::refused("no entrypoint found");
    };
    if let Err(reason) = entrypoint.confined() {
        return ProbeLog::refused(reason);
    }
    let mut log = ProbeLog::new();

    let uv = match step(&mut log, root, "uv", &["venv", ".venv"], VENV_TIMEOUT).await {
        Ok(out) if out.success() => true,
        Err(CommandError::NotFound) => false,
        Ok(_) | Err(_) => {
            log.output.push("uv venv failed, trying python3 -m venv".to_string());
            false
        }
    };
    if !uv {
        match step(&mut log, root, "python3", &["-m", "venv", ".venv"], VENV_TIMEOUT).await {
            Ok(out) if out.success() => {}
            _ => return log.finish(false),
        }
    }

    let bin = root.join(".venv").join("bin");
    let python = bin.join("python").to_string_lossy().into_owned();

    if tokio::fs::try_exists(root.join("pyproject.toml")).await.unwrap_or(false) {
        let installed = if uv {
            step(
                &mut log,
                root,
                "uv",
                &["pip", "install", "--python", python.as_str(), "-e", "."],
                INSTALL_TIMEOUT,
            )
            .await
        } else {
            step(&mut log, root, &python, &["-m", "pip", "install", "-e", "."], INSTALL_TIMEOUT).await
        };
        if !matches!(&installed, Ok(out) if out.success()) {
            return log.finish(false);
        }
    }

    let run = match entrypoint {
        Entrypoint::File(file) => step(&mut log, root, &python, &[file.as_str(), "--help"], RUN_TIMEOUT).await,
        Entrypoint::Module(module) => {
            step(&mut log, root, &python, &["-m", module.as_str(), "--help"], RUN_TIMEOUT).await
        }
        Entrypoint::Script(script) => {
            let exe = bin.join(script).to_string_lossy().into_owned();
            step(&mut log, root, &exe, &["--help"], RUN_TIMEOUT).await
        }
    };
    let success = matches!(&run, Ok(out) if out.success());
    log.finish(success)
}

impl Orchestrator {
    /// Project mode: architect, then one generation cycle per planned file.
    pub(crate) async fn run_project(&self, request: &Request, root: &Path) -> Result<Report, PlanningError> {
        let started_at = Utc::now();
        self.set_phase(Phase::Planning).await;

        let ws = match Workspace::open(root, request.overwrite).await {
            Ok(ws) => ws,
            Err(source) => {
                let err = PlanningError::ProjectRoot {
                    path: root.to_path_buf(),
                    source,
                };
                self.set_phase(Phase::Failed(err.to_string())).await;
                return Err(err);
            }
        };

        let plan = match self.architect(request, root).await {
            Ok(plan) => plan,
            Err(e) => {
                let err = PlanningError::Architect(e);
                self.set_phase(Phase::Failed(err.to_string())).await;
                return Err(err);
            }
        };
        tracing::info!(project = %plan.project_name, files = plan.files.len(), "Project plan ready");

        let planned = Plan {
            subtasks: plan
                .files
                .iter()
                .enumerate()
                .map(|(i, file)| file_subtask(&plan, file, i, &[]))
                .collect(),
        };
        self.emit(Event::Planned(&planned));

        let total = plan.files.len();
        let mut steps = Vec::with_capacity(total);
        let mut created: Vec<String> = Vec::new();
        for (i, file) in plan.files.iter().enumerate() {
            self.set_phase(Phase::Executing(i)).await;
            // Later files see only what actually made it to disk.
            let subtask = file_subtask(&plan, file, i, &created);
            let trace = self.execute_step(&subtask, total, Persist::Workspace(&ws)).await;
            if trace.persisted_path.is_some() {
                created.push(file.path.clone());
            }
            steps.push(trace);
        }

        self.set_phase(Phase::Reporting).await;
        let entrypoint = detect_entrypoint(&plan, root).await;
        if let Err(reason) = &entrypoint {
            tracing::warn!(%reason, "Ignoring project entrypoint");
        }
        let runtime = if request.run_project {
            let probe = match &entrypoint {
                Ok(entry) => probe_runtime(root, entry.as_ref()).await,
                Err(reason) => ProbeLog::refused(reason.as_str()),
            };
            tracing::info!(success = probe.success, "Runtime probe finished");
            Some(probe)
        } else {
            None
        };

        let outcome = ProjectOutcome {
            root: root.to_path_buf(),
            name: plan.project_name.clone(),
            slug: plan.slug(),
            summary: plan.summary.clone(),
            files: created,
            entrypoint: entrypoint.ok().flatten(),
            runtime,
        };
        let report = Report::assemble(request, steps, Some(outcome), started_at);
        self.set_phase(Phase::Done).await;
        Ok(report)
    }

    async fn architect(&self, request: &Request, root: &Path) -> Result<ProjectPlan, GenerationError> {
        let mut subtask =
            Subtask::new(0, request.text.trim(), Capability::ProjectArchitect.tag()).with_reason("project mode");
        let snapshot = self.snapshot(Some(root));
        if !snapshot.is_empty() {
            subtask = subtask.with_param("workspace", snapshot);
        }
        let backend = self.factory.bind(Capability::ProjectArchitect.tag());
        match Agent::new(Capability::ProjectArchitect).run(&subtask, &backend).await? {
            AgentOutput::Project(plan) => Ok(plan),
            AgentOutput::Artifact(_) => Err(GenerationError::Parse {
                agent: Capability::ProjectArchitect.to_string(),
                reason: "architect returned a file instead of a plan".to_string(),
            }),
        }
    }
}
