//! Terminal output.
//!
//! Progress lines go to stderr while the pipeline runs; the final report
//! goes to stdout, either as readable text or as JSON.

use std::io::{self, Write};

use crate::orchestrator::{Event, Report, StepTrace};
use crate::validate::ValidationStatus;

/// Lines of artifact content shown inline before truncating.
const MAX_CONTENT_LINES: usize = 40;
const MAX_FILES: usize = 20;

/// One status line, prefixed with the role that produced it.
pub fn status(out: &mut impl Write, role: &str, emoji: &str, text: &str) -> io::Result<()> {
    writeln!(out, "[{role}] {emoji} {text}")
}

/// Render a progress event as a single status line.
pub fn progress(out: &mut impl Write, event: &Event<'_>) -> io::Result<()> {
    match event {
        Event::Phase(phase) => status(out, "orchestrator", "📋", &format!("Phase: {phase}")),
        Event::Planned(plan) => {
            status(out, "planner", "🗺️", &format!("Plan with {} step(s)", plan.len()))?;
            for subtask in &plan.subtasks {
                let line = first_line(&subtask.description, 80);
                writeln!(out, "  {}. [{}] {line}", subtask.index + 1, subtask.capability)?;
            }
            Ok(())
        }
        Event::StepStarted {
            index,
            total,
            agent,
            description,
        } => status(
            out,
            agent.tag(),
            "⚙️",
            &format!("Step {}/{total}: {}", index + 1, first_line(description, 60)),
        ),
        Event::StepFinished(trace) => {
            let (emoji, text) = step_summary(trace);
            status(out, trace.agent.tag(), emoji, &text)
        }
    }
}

fn first_line(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    let cut: String = line.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{cut}...")
}

fn step_summary(trace: &StepTrace) -> (&'static str, String) {
    if let Some(error) = &trace.error {
        return ("❌", error.clone());
    }
    let path = trace
        .persisted_path
        .as_ref()
        .map(|p| p.display().to_string())
        .or_else(|| trace.artifact.as_ref().map(|a| a.path.clone()))
        .unwrap_or_default();
    match trace.validation.as_ref().map(|v| v.status) {
        Some(ValidationStatus::Pass) => ("✅", format!("{path} (validation: pass)")),
        Some(ValidationStatus::Fail) => ("⚠️", format!("{path} (validation: fail)")),
        Some(ValidationStatus::Skipped) | None => ("✅", format!("{path} (validation: skipped)")),
    }
}

/// Render an artifact's content, truncated after `max_lines`.
pub fn code(out: &mut impl Write, filename: &str, content: &str, max_lines: usize) -> io::Result<()> {
    let lines: Vec<&str> = content.lines().collect();
    writeln!(out, "📄 {filename} ({} lines)", lines.len())?;
    for line in lines.iter().take(max_lines) {
        writeln!(out, "  {line}")?;
    }
    if lines.len() > max_lines {
        writeln!(out, "  ... ({} more lines)", lines.len() - max_lines)?;
    }
    Ok(())
}

/// A file listing, capped.
pub fn file_tree(out: &mut impl Write, files: &[String]) -> io::Result<()> {
    writeln!(out, "📁 Project files ({})", files.len())?;
    for f in files.iter().take(MAX_FILES) {
        writeln!(out, "  {f}")?;
    }
    if files.len() > MAX_FILES {
        writeln!(out, "  ... and {} more", files.len() - MAX_FILES)?;
    }
    Ok(())
}

/// Human-readable report. Every step is listed, failed ones included.
pub fn render_report(out: &mut impl Write, report: &Report) -> io::Result<()> {
    let single = report.steps.len() == 1 && report.project.is_none();

    for trace in &report.steps {
        writeln!(out)?;
        writeln!(
            out,
            "── Step {} [{}] {}",
            trace.index + 1,
            trace.agent,
            first_line(&trace.description, 70)
        )?;
        if let Some(note) = &trace.note {
            writeln!(out, "   note: {note}")?;
        }
        if let Some(error) = &trace.error {
            writeln!(out, "   ❌ {error}")?;
        }
        if let Some(path) = &trace.persisted_path {
            writeln!(out, "   saved to {}", path.display())?;
        }
        if let Some(v) = &trace.validation {
            writeln!(out, "   validation: {} ({})", v.status, v.checker)?;
            for diag in &v.diagnostics {
                writeln!(out, "     {diag}")?;
            }
        }
        // Unsaved output is the whole point of a single-step run: show it.
        if let Some(artifact) = &trace.artifact
            && trace.persisted_path.is_none()
        {
            let max = if single { usize::MAX } else { MAX_CONTENT_LINES };
            code(out, &artifact.path, &artifact.content, max)?;
        }
    }

    if let Some(project) = &report.project {
        writeln!(out)?;
        writeln!(out, "Project '{}' at {}", project.name, project.root.display())?;
        if !project.summary.is_empty() {
            writeln!(out, "{}", project.summary)?;
        }
        file_tree(out, &project.files)?;
        match &project.entrypoint {
            Some(entry) => writeln!(out, "entrypoint: {entry}")?,
            None => writeln!(out, "entrypoint: none found")?,
        }
        if let Some(probe) = &project.runtime {
            let verdict = if probe.success { "ok" } else { "failed" };
            writeln!(out, "runtime probe: {verdict}")?;
            for cmd in &probe.commands {
                writeln!(out, "  $ {cmd}")?;
            }
            for line in probe.output.lines().take(MAX_CONTENT_LINES) {
                writeln!(out, "    {line}")?;
            }
        }
    }

    let failed = report.steps.iter().filter(|s| !s.succeeded()).count();
    writeln!(out)?;
    if report.overall_success {
        writeln!(out, "✅ {} step(s) completed", report.steps.len())
    } else {
        writeln!(out, "❌ {failed} of {} step(s) failed", report.steps.len())
    }
}

/// The report as pretty-printed JSON.
pub fn render_json(out: &mut impl Write, report: &Report) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, report)?;
    writeln!(out)
}
