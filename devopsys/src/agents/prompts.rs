//! Prompt text per capability.
//!
//! Every prompt carries the task, the planner's context (the subtask
//! `reason` plus any `context` parameter) and the read-only workspace
//! snapshot when one was attached. A `path` parameter pins the file the
//! agent must produce.

use super::Capability;
use crate::plan::Subtask;

const BASH_RULES: &str = "\
- Target: bash (#!/usr/bin/env bash) with set -euo pipefail.
- Include usage() help and argument parsing (getopts or simple parsing).
- Add comments, safety checks and meaningful exit codes.
- Avoid GNU-only features when portability matters.

Return only the final Bash script content.";

const DOCKER_RULES: &str = "\
- Use multi-stage builds when appropriate.
- Pin base images or use slim variants.
- Avoid running as root where possible.
- Include a HEALTHCHECK if meaningful.
- Keep layers small: combine RUN commands and clean caches.
- Add brief comments explaining key steps.
- If the task mentions Astral's uv, install it per the official instructions and use `uv pip install` / `uv run`.
- For Python projects use pyproject.toml and the src/ layout; never add requirements.txt or setup.py unless asked.

Return only the Dockerfile content.";

const PYTHON_RULES: &str = "\
- Implement exactly what the task requests; avoid unrelated features.
- Write clean, idiomatic Python 3.11+ using only the standard library unless the task names a package.
- Always include a main() and an if __name__ == \"__main__\": guard.
- If the task implies command-line usage, use minimal argparse.

Return ONLY executable Python code. No Markdown, prose or explanations.";

const RUST_RULES: &str = "\
- Use stable Rust, edition 2021.
- Provide Cargo.toml and src/main.rs.
- Keep dependencies minimal; parse arguments with clap or std::env.
- Comment the key parts.

Output a Cargo.toml block followed by a src/main.rs block. No extra explanatory text.";

const LINUX_RULES: &str = "\
- Provide step-by-step commands with a brief explanation per step.
- Prefer idempotent operations. Use sudo as needed.
- Ubuntu uses apt and systemd; Arch uses pacman and systemd. Mention differences when relevant.
- If Docker is involved, include the official repository setup and post-install steps.

Return plain text with shell blocks where relevant.";

const UNIVERSAL_RULES: &str = "\
- Return only the raw file contents with no Markdown fences or explanations.
- Match the requested format (Markdown, TOML, YAML, ...) precisely.
- Keep placeholders minimal; prefer working, ready-to-use content.";

const ARCHITECT_RULES: &str = "\
Respond with a single JSON object and nothing else:
{
  \"project_name\": \"short-kebab-name\",
  \"language\": \"python\",
  \"summary\": \"one paragraph\",
  \"tasks\": [\"high level task\", \"...\"],
  \"entrypoint\": \"main.py or package.module:function, optional\",
  \"files\": [
    {\"path\": \"relative/path\", \"goal\": \"what the file does\", \"agent\": \"python|bash|docker|rust|linux|universal\", \"requirements\": \"details\"}
  ]
}

Rules:
- Paths are relative, unique, and use forward slashes.
- List files in the order they should be generated.
- Prefer pyproject.toml and a src/ layout for Python projects.
- Include a README.md.";

fn role(cap: Capability) -> &'static str {
    match cap {
        Capability::Docker => "You are a senior DevOps engineer in a multi-agent team. Produce a production-grade Dockerfile.",
        Capability::Python => "You are a senior Python engineer working in a multi-agent team.",
        Capability::Rust => "You are a senior Rust engineer in a multi-agent pipeline. Generate a minimal Rust CLI app for the task.",
        Capability::Bash => "You are a senior SRE collaborating with other agents. Generate a Bash script for the request.",
        Capability::Linux => "You are a Linux DevOps engineer collaborating with other agents. Prepare commands and a checklist for system setup.",
        Capability::Universal => "You are a senior software engineer and technical writer. Generate the exact file contents requested.",
        Capability::ProjectArchitect => "You are a software architect. Break the request down into a small project and list every file it needs.",
    }
}

fn rules(cap: Capability) -> &'static str {
    match cap {
        Capability::Docker => DOCKER_RULES,
        Capability::Python => PYTHON_RULES,
        Capability::Rust => RUST_RULES,
        Capability::Bash => BASH_RULES,
        Capability::Linux => LINUX_RULES,
        Capability::Universal => UNIVERSAL_RULES,
        Capability::ProjectArchitect => ARCHITECT_RULES,
    }
}

fn planner_context(subtask: &Subtask) -> String {
    let mut parts = Vec::new();
    if !subtask.reason.trim().is_empty() {
        parts.push(subtask.reason.trim().to_string());
    }
    if let Some(ctx) = subtask.param("context")
        && !ctx.trim().is_empty()
    {
        parts.push(ctx.trim().to_string());
    }
    parts.join("\n")
}

/// Render the full prompt for `cap`.
pub fn render(cap: Capability, subtask: &Subtask) -> String {
    let mut out = String::new();
    out.push_str(role(cap));
    out.push_str("\n\n");

    if let Some(path) = subtask.param("path") {
        out.push_str(&format!("File path: {path}\n"));
        out.push_str("Produce exactly this one file.\n\n");
    }

    out.push_str("Primary user task:\n");
    out.push_str(subtask.description.trim());
    out.push_str("\n\n");

    if cap == Capability::Linux {
        let os = subtask.param("os").unwrap_or("ubuntu or arch (detect from the task)");
        out.push_str(&format!("Target distribution: {os}\n\n"));
    }

    out.push_str("Planner context (may be empty):\n");
    out.push_str(&planner_context(subtask));
    out.push_str("\n\n");

    if cap != Capability::Python
        && let Some(snapshot) = subtask.param("workspace")
    {
        out.push_str("Workspace snapshot (read-only):\n");
        out.push_str(snapshot);
        out.push_str("\n\n");
    }

    out.push_str("Constraints:\n");
    out.push_str(rules(cap));
    out.push('\n');
    out
}
