//! Plans, subtasks and the lead planner.
//!
//! A plan is produced once per request and never mutated afterwards. The
//! planner asks the model for `{"plan": [{"agent", "instruction", "reason"}]}`;
//! anything it cannot turn into at least one step is a [`PlanningError`]
//! carrying the raw reply. Nothing is guessed.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::agents::Capability;
use crate::error::PlanningError;
use crate::llm::BoundBackend;
use crate::router::{self, Route};

/// One step of a plan. `index` is its position and defines execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subtask {
    pub index: usize,
    pub description: String,
    /// Capability tag as declared; may be unknown, the selector decides.
    pub capability: String,
    pub reason: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl Subtask {
    pub fn new(index: usize, description: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            index,
            description: description.into(),
            capability: capability.into(),
            reason: String::new(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub subtasks: Vec<Subtask>,
}

impl Plan {
    /// A single-step plan for an explicit `--agent` override. No model call.
    pub fn forced(request: &str, agent: &str) -> Self {
        Self {
            subtasks: vec![Subtask::new(0, request.trim(), agent.trim()).with_reason("forced by user")],
        }
    }

    /// A single-step plan taken from the keyword router.
    pub fn routed(request: &str, route: &Route) -> Self {
        Self {
            subtasks: vec![
                Subtask::new(0, request.trim(), route.capability.tag())
                    .with_reason(route.reason.clone()),
            ],
        }
    }

    /// Final shaping of a model plan against the router's pick: a docker
    /// route keeps only the docker steps (when there are any), the routed
    /// capability moves to the front, and each capability runs once.
    /// Indices are renumbered to the new positions.
    pub fn pruned(self, route: &Route) -> Self {
        let key = |s: &Subtask| {
            s.capability
                .parse::<Capability>()
                .map(|c| c.tag().to_string())
                .unwrap_or_else(|_| s.capability.trim().to_lowercase())
        };
        let routed = route.capability.tag();

        let mut subtasks = self.subtasks;
        if route.capability == Capability::Docker && subtasks.iter().any(|s| key(s) == routed) {
            subtasks.retain(|s| key(s) == routed);
        }
        let (first, rest): (Vec<_>, Vec<_>) = subtasks.into_iter().partition(|s| key(s) == routed);

        let mut seen = HashSet::new();
        let subtasks = first
            .into_iter()
            .chain(rest)
            .filter(|s| seen.insert(key(s)))
            .enumerate()
            .map(|(index, subtask)| Subtask { index, ..subtask })
            .collect();
        Self { subtasks }
    }

    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    /// Attach `key=value` to every subtask whose declared capability is `capability`.
    pub fn tag_capability(&mut self, capability: Capability, key: &str, value: &str) {
        for subtask in &mut self.subtasks {
            if subtask.capability.parse::<Capability>().ok() == Some(capability) {
                subtask.params.insert(key.to_string(), value.to_string());
            }
        }
    }
}

const PLAN_PROMPT: &str = "\
You are the lead planner in a multi-agent DevOps system.
Available specialised agents: {agents}.
Keyword router suggestion: {hint}.

Analyse the user request and break it down into an ordered plan with the minimum number of steps.
Only include an agent if its contribution is essential for the final result. Prefer a single specialist when possible.
Each plan step must be a JSON object with fields: agent, instruction, reason.
Linux steps may add an \"os\" field (ubuntu or arch).
Use only the allowed agent names.

Workspace snapshot (read-only context):
{workspace}

Return a JSON object with the exact shape:
{\"plan\": [{\"agent\": \"name\", \"instruction\": \"...\", \"reason\": \"...\"}]}

User request:
{task}
";

/// The lead agent: turns a request into a [`Plan`].
pub struct LeadPlanner {
    backend: BoundBackend,
}

impl LeadPlanner {
    pub fn new(backend: BoundBackend) -> Self {
        Self { backend }
    }

    pub fn build_prompt(request: &str, hint: &Route, snapshot: &str) -> String {
        let agents = Capability::ALL
            .iter()
            .filter(|c| **c != Capability::ProjectArchitect)
            .map(|c| c.tag())
            .collect::<Vec<_>>()
            .join(", ");
        let snapshot = if snapshot.trim().is_empty() {
            "(empty)"
        } else {
            snapshot
        };
        PLAN_PROMPT
            .replace("{agents}", &agents)
            .replace("{hint}", &format!("{} ({})", hint.capability, hint.reason))
            .replace("{workspace}", snapshot)
            .replace("{task}", request.trim())
    }

    /// Produce a plan for `request`.
    ///
    /// The dummy backend cannot plan, so it gets the router's single-step
    /// plan instead of a model call.
    pub async fn plan(&self, request: &str, snapshot: &str) -> Result<Plan, PlanningError> {
        let hint = router::classify(request);
        tracing::info!(hint = %hint.capability, score = hint.score, "Routing hint");

        if self.backend.is_dummy() {
            return Ok(Plan::routed(request, &hint));
        }

        let prompt = Self::build_prompt(request, &hint, snapshot);
        let raw = self
            .backend
            .complete(&prompt)
            .await
            .map_err(PlanningError::Backend)?;
        let plan = parse_plan(&raw, request)?;
        let steps = plan.len();
        let plan = plan.pruned(&hint);
        if plan.len() != steps {
            tracing::info!(from = steps, to = plan.len(), "Pruned plan");
        }
        Ok(plan)
    }
}

fn object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"))
}

fn array_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\[.*\]").expect("valid regex"))
}

fn extract_json(raw: &str) -> Option<Value> {
    let text = raw.trim();
    let candidates = [
        Some(text),
        object_re().find(text).map(|m| m.as_str()),
        array_re().find(text).map(|m| m.as_str()),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|c| serde_json::from_str::<Value>(c).ok())
}

fn text_field(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Parse a planner reply. An empty instruction means "use the request text".
pub fn parse_plan(raw: &str, request: &str) -> Result<Plan, PlanningError> {
    let unparsable = || PlanningError::Unparsable {
        raw: raw.to_string(),
    };

    let value = extract_json(raw).ok_or_else(unparsable)?;
    let items = match &value {
        Value::Object(obj) => obj.get("plan").and_then(Value::as_array),
        Value::Array(items) => Some(items),
        _ => None,
    }
    .ok_or_else(unparsable)?;

    let mut subtasks = Vec::new();
    for item in items {
        let Value::Object(obj) = item else { continue };
        let agent = text_field(obj, &["agent", "capability"]);
        let instruction = text_field(obj, &["instruction", "task"]);
        if agent.is_empty() && instruction.is_empty() {
            continue;
        }
        let description = if instruction.is_empty() {
            request.trim().to_string()
        } else {
            instruction
        };
        let agent = if agent.is_empty() { "any".to_string() } else { agent.to_lowercase() };
        let mut subtask = Subtask::new(subtasks.len(), description, agent)
            .with_reason(text_field(obj, &["reason"]));
        let os = text_field(obj, &["os"]);
        if !os.is_empty() {
            subtask = subtask.with_param("os", os.to_lowercase());
        }
        subtasks.push(subtask);
    }

    if subtasks.is_empty() {
        return Err(unparsable());
    }
    Ok(Plan { subtasks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::llm::{CompletionBackend, DummyBackend};

    struct Scripted(&'static str);

    #[async_trait::async_trait]
    impl CompletionBackend for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }
        async fn complete(&self, _prompt: &str, _model: &str) -> Result<String, BackendError> {
            Ok(self.0.to_string())
        }
    }

    struct Down;

    #[async_trait::async_trait]
    impl CompletionBackend for Down {
        fn name(&self) -> &'static str {
            "down"
        }
        async fn complete(&self, _prompt: &str, _model: &str) -> Result<String, BackendError> {
            Err(BackendError::Status {
                status: 502,
                message: "bad gateway".into(),
            })
        }
    }

    #[test]
    fn parses_wrapped_plan() {
        let raw = r#"Sure, here it is:
{"plan": [
  {"agent": "docker", "instruction": "Write a Dockerfile", "reason": "container"},
  {"agent": "Bash", "instruction": "", "reason": "launcher"},
  {"agent": "linux", "instruction": "Install docker", "os": "Arch"}
]}
Good luck!"#;
        let plan = parse_plan(raw, "ship my app").unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.subtasks[0].capability, "docker");
        assert_eq!(plan.subtasks[1].capability, "bash");
        assert_eq!(plan.subtasks[1].description, "ship my app");
        assert_eq!(plan.subtasks[2].param("os"), Some("arch"));
        let indices: Vec<usize> = plan.subtasks.iter().map(|s| s.index).collect();
        assert_eq!(indices, [0, 1, 2]);
    }

    #[test]
    fn accepts_bare_array_and_keeps_unknown_agents() {
        let plan = parse_plan(r#"[{"agent": "kubernetes", "instruction": "deploy"}]"#, "x").unwrap();
        assert_eq!(plan.subtasks[0].capability, "kubernetes");
    }

    #[test]
    fn garbage_is_unparsable_with_raw_text() {
        let err = parse_plan("I cannot help with that", "x").unwrap_err();
        assert_eq!(err.raw_response(), Some("I cannot help with that"));

        let err = parse_plan(r#"{"plan": []}"#, "x").unwrap_err();
        assert!(matches!(err, PlanningError::Unparsable { .. }));
    }

    fn route(capability: Capability) -> Route {
        Route {
            capability,
            score: 1,
            reason: "test".into(),
        }
    }

    fn tags(plan: &Plan) -> Vec<&str> {
        plan.subtasks.iter().map(|s| s.capability.as_str()).collect()
    }

    #[test]
    fn pruning_moves_routed_agent_first_and_drops_repeats() {
        let plan = parse_plan(
            r#"[{"agent": "linux", "instruction": "a"},
                {"agent": "bash", "instruction": "b"},
                {"agent": "shell", "instruction": "c"},
                {"agent": "python", "instruction": "d"},
                {"agent": "python", "instruction": "e"}]"#,
            "x",
        )
        .unwrap()
        .pruned(&route(Capability::Python));
        assert_eq!(tags(&plan), ["python", "linux", "bash"]);
        assert_eq!(plan.subtasks[0].description, "d");
        let indices: Vec<usize> = plan.subtasks.iter().map(|s| s.index).collect();
        assert_eq!(indices, [0, 1, 2]);
    }

    #[test]
    fn docker_route_keeps_only_docker_steps() {
        let raw = r#"[{"agent": "bash", "instruction": "a"}, {"agent": "docker", "instruction": "b"}]"#;
        let plan = parse_plan(raw, "x").unwrap().pruned(&route(Capability::Docker));
        assert_eq!(tags(&plan), ["docker"]);
        assert_eq!(plan.subtasks[0].index, 0);

        let no_docker = r#"[{"agent": "bash", "instruction": "a"}, {"agent": "linux", "instruction": "b"}]"#;
        let plan = parse_plan(no_docker, "x").unwrap().pruned(&route(Capability::Docker));
        assert_eq!(tags(&plan), ["bash", "linux"]);
    }

    #[tokio::test]
    async fn planner_prunes_model_plan() {
        let backend = BoundBackend::new(
            Box::new(Scripted(
                r#"{"plan": [{"agent": "bash", "instruction": "run"}, {"agent": "docker", "instruction": "image"}]}"#,
            )),
            "m",
        );
        let plan = LeadPlanner::new(backend).plan("write a Dockerfile", "").await.unwrap();
        assert_eq!(tags(&plan), ["docker"]);
    }

    #[test]
    fn forced_plan_has_one_step() {
        let plan = Plan::forced("generate a bash script", "bash");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.subtasks[0].capability, "bash");
        assert_eq!(plan.subtasks[0].reason, "forced by user");
    }

    #[test]
    fn os_hint_only_tags_linux_steps() {
        let mut plan = parse_plan(
            r#"{"plan": [{"agent": "linux", "instruction": "a"}, {"agent": "bash", "instruction": "b"}]}"#,
            "x",
        )
        .unwrap();
        plan.tag_capability(Capability::Linux, "os", "ubuntu");
        assert_eq!(plan.subtasks[0].param("os"), Some("ubuntu"));
        assert_eq!(plan.subtasks[1].param("os"), None);
    }

    #[test]
    fn prompt_lists_agents_and_hint() {
        let hint = router::classify("write a Dockerfile");
        let prompt = LeadPlanner::build_prompt("write a Dockerfile", &hint, "");
        assert!(prompt.contains("docker, python, rust, bash, linux, universal"));
        assert!(prompt.contains("Keyword router suggestion: docker"));
        assert!(prompt.contains("(empty)"));
    }

    #[tokio::test]
    async fn planner_uses_model_reply() {
        let backend = BoundBackend::new(
            Box::new(Scripted(r#"{"plan": [{"agent": "python", "instruction": "plot"}]}"#)),
            "m",
        );
        let plan = LeadPlanner::new(backend).plan("draw a chart", "").await.unwrap();
        assert_eq!(plan.subtasks[0].capability, "python");
    }

    #[tokio::test]
    async fn planner_backend_failure_is_fatal() {
        let backend = BoundBackend::new(Box::new(Down), "m");
        let err = LeadPlanner::new(backend).plan("anything", "").await.unwrap_err();
        assert!(matches!(err, PlanningError::Backend(_)));
    }

    #[tokio::test]
    async fn dummy_planner_follows_the_router() {
        let backend = BoundBackend::new(Box::new(DummyBackend), "m");
        let plan = LeadPlanner::new(backend)
            .plan("Write a Dockerfile for FastAPI", "")
            .await
            .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.subtasks[0].capability, "docker");
    }
}
