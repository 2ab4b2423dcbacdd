//! End-to-end runs of the pipeline with in-process backends.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use devopsys::agents::Capability;
use devopsys::config::PLANNER_ROLE;
use devopsys::error::{BackendError, PlanningError};
use devopsys::llm::{BoundBackend, CompletionBackend, DummyBackend};
use devopsys::orchestrator::{Orchestrator, Phase, Request};
use devopsys::validate::{ValidationStatus, Validator};

/// Replies with a fixed text and counts calls.
struct Canned {
    reply: &'static str,
    calls: Arc<Mutex<usize>>,
}

#[async_trait]
impl CompletionBackend for Canned {
    fn name(&self) -> &'static str {
        "canned"
    }

    async fn complete(&self, _prompt: &str, _model: &str) -> Result<String, BackendError> {
        *self.calls.lock().unwrap() += 1;
        Ok(self.reply.to_string())
    }
}

struct Refusing;

#[async_trait]
impl CompletionBackend for Refusing {
    fn name(&self) -> &'static str {
        "refusing"
    }

    async fn complete(&self, _prompt: &str, _model: &str) -> Result<String, BackendError> {
        Err(BackendError::Transport("connection refused".into()))
    }
}

fn dummy() -> BoundBackend {
    BoundBackend::new(Box::new(DummyBackend), "dummy")
}

/// Architect role answers with `plan`; every other role gets the dummy.
fn project_orchestrator(plan: &'static str) -> (Orchestrator, Arc<Mutex<usize>>) {
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    let factory = move |role: &str| -> BoundBackend {
        if role == Capability::ProjectArchitect.tag() {
            BoundBackend::new(
                Box::new(Canned {
                    reply: plan,
                    calls: counter.clone(),
                }),
                "architect",
            )
        } else {
            dummy()
        }
    };
    (
        Orchestrator::with_factory(Arc::new(factory), Validator::builtin_only()),
        calls,
    )
}

#[tokio::test]
async fn forced_bash_on_dummy_backend() {
    let orch = Orchestrator::with_factory(Arc::new(|_: &str| dummy()), Validator::builtin_only());
    let report = orch
        .run(&Request::new("generate a bash script").with_agent("bash"))
        .await
        .unwrap();

    assert_eq!(report.steps.len(), 1);
    let step = &report.steps[0];
    assert_eq!(step.agent, Capability::Bash);
    let artifact = step.artifact.as_ref().unwrap();
    assert!(!artifact.content.trim().is_empty());
    assert_eq!(artifact.path, "script.sh");
    let status = step.validation.as_ref().unwrap().status;
    assert!(matches!(status, ValidationStatus::Pass | ValidationStatus::Skipped));
    assert!(report.overall_success);
}

#[tokio::test]
async fn dummy_runs_are_deterministic() {
    let orch = Orchestrator::with_factory(Arc::new(|_: &str| dummy()), Validator::builtin_only());
    let request = Request::new("run the flask app in a docker container");
    let first = orch.run(&request).await.unwrap();
    let second = orch.run(&request).await.unwrap();

    let contents = |r: &devopsys::Report| -> Vec<String> {
        r.steps
            .iter()
            .map(|s| s.artifact.as_ref().map(|a| a.content.clone()).unwrap_or_default())
            .collect()
    };
    assert_eq!(contents(&first), contents(&second));
    let validations = |r: &devopsys::Report| -> Vec<_> {
        r.steps.iter().map(|s| s.validation.clone()).collect()
    };
    assert_eq!(validations(&first), validations(&second));
    assert!(first.steps.iter().all(|s| s.validation.is_some()));
    assert_eq!(first.steps[0].agent, Capability::Docker);
}

#[tokio::test]
async fn project_files_are_written_in_declared_order() {
    let (orch, calls) = project_orchestrator(
        r#"```json
        {
          "project_name": "Hello Service",
          "language": "python",
          "summary": "Serves hello.",
          "files": [
            {"path": "Dockerfile", "goal": "container image"},
            {"path": "app.py", "goal": "http handler", "requirements": ["stdlib only"]},
          ]
        }
        ```"#,
    );
    let root = tempfile::tempdir().unwrap();
    let report = orch
        .run(&Request::new("hello world web service").with_project_root(root.path()))
        .await
        .unwrap();

    assert_eq!(*calls.lock().unwrap(), 1);
    let paths: Vec<&str> = report
        .steps
        .iter()
        .map(|s| s.artifact.as_ref().unwrap().path.as_str())
        .collect();
    assert_eq!(paths, ["Dockerfile", "app.py"]);
    assert_eq!(report.steps[0].agent, Capability::Docker);
    assert_eq!(report.steps[1].agent, Capability::Python);
    assert!(root.path().join("Dockerfile").is_file());
    assert!(root.path().join("app.py").is_file());

    let project = report.project.as_ref().unwrap();
    assert_eq!(project.files, ["Dockerfile", "app.py"]);
    assert_eq!(project.slug, "hello-service");
    assert!(project.runtime.is_none());
    assert!(report.overall_success);
    assert_eq!(orch.phase().await, Phase::Done);
}

#[tokio::test]
async fn project_refuses_to_clobber_without_force() {
    let plan = r#"{"project_name": "x", "files": [{"path": "app.py", "goal": "entry"}]}"#;
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("app.py"), "keep me\n").unwrap();

    let (orch, _) = project_orchestrator(plan);
    let report = orch
        .run(&Request::new("app").with_project_root(root.path()))
        .await
        .unwrap();
    assert!(!report.overall_success);
    assert!(report.steps[0].error.as_ref().unwrap().contains("refusing to overwrite"));
    assert_eq!(std::fs::read_to_string(root.path().join("app.py")).unwrap(), "keep me\n");

    let (orch, _) = project_orchestrator(plan);
    let mut forced = Request::new("app").with_project_root(root.path());
    forced.overwrite = true;
    let report = orch.run(&forced).await.unwrap();
    assert!(report.overall_success);
    assert_ne!(std::fs::read_to_string(root.path().join("app.py")).unwrap(), "keep me\n");
}

#[tokio::test]
async fn escaping_project_path_fails_only_that_step() {
    let (orch, _) = project_orchestrator(
        r#"{"project_name": "x", "files": [
            {"path": "../escape.py", "goal": "nope"},
            {"path": "ok.py", "goal": "fine"}
        ]}"#,
    );
    let parent = tempfile::tempdir().unwrap();
    let root = parent.path().join("proj");
    let report = orch
        .run(&Request::new("x").with_project_root(&root))
        .await
        .unwrap();

    assert_eq!(report.steps.len(), 2);
    assert!(!report.steps[0].succeeded());
    assert!(report.steps[0].persisted_path.is_none());
    assert!(!parent.path().join("escape.py").exists());
    assert!(report.steps[1].succeeded());
    assert!(root.join("ok.py").is_file());
    assert!(!report.overall_success);
}

#[tokio::test]
async fn architect_failure_is_a_planning_error() {
    let (orch, _) = project_orchestrator("I would rather not.");
    let root = tempfile::tempdir().unwrap();
    let err = orch
        .run(&Request::new("x").with_project_root(root.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, PlanningError::Architect(_)));
    assert!(matches!(orch.phase().await, Phase::Failed(_)));
}

#[tokio::test]
async fn unreachable_agent_backend_is_a_partial_failure() {
    let plan: &'static str = r#"[
        {"agent": "docker", "instruction": "write a Dockerfile"},
        {"agent": "bash", "instruction": "write a deploy script"},
        {"agent": "linux", "instruction": "install docker"}
    ]"#;
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    let factory = move |role: &str| -> BoundBackend {
        match role {
            PLANNER_ROLE => BoundBackend::new(
                Box::new(Canned {
                    reply: plan,
                    calls: counter.clone(),
                }),
                "planner",
            ),
            "bash" => BoundBackend::new(Box::new(Refusing), "m"),
            _ => dummy(),
        }
    };
    let orch = Orchestrator::with_factory(Arc::new(factory), Validator::builtin_only());
    let report = orch.run(&Request::new("deploy my app")).await.unwrap();

    let agents: Vec<Capability> = report.steps.iter().map(|s| s.agent).collect();
    assert_eq!(agents, [Capability::Docker, Capability::Bash, Capability::Linux]);
    assert!(report.steps[0].succeeded());
    assert!(report.steps[1].artifact.is_none());
    assert!(report.steps[1].error.as_ref().unwrap().contains("connection refused"));
    assert!(report.steps[2].succeeded());
    assert!(!report.overall_success);
}

#[tokio::test]
async fn validation_is_repeatable_and_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deploy.sh");
    let script = "#!/usr/bin/env bash\nset -euo pipefail\nif [ -n \"$1\" ]; then echo hi; fi\n";
    std::fs::write(&path, script).unwrap();

    let validator = Validator::new(true);
    let first = validator.validate_file(&path).await;
    let second = validator.validate_file(&path).await;
    assert_eq!(first, second);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), script);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}
