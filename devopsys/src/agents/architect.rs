//! Project plans produced by the architect agent.
//!
//! Models rarely return clean JSON. Parsing tries, in order: the text as-is
//! (fences stripped, curly quotes straightened), with `//` and `/* */`
//! comments removed, with trailing commas removed, and the outermost
//! `{...}` span. If none of those yield files, every `{...}` object that
//! mentions a `path` is salvaged on its own.

use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Capability;
use super::normalize::strip_code_fences;
use crate::error::GenerationError;

/// One file the project needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSpec {
    pub path: String,
    pub goal: String,
    pub requirements: Vec<String>,
    pub capability: Capability,
}

/// The architect's answer: ordered, path-unique list of files plus metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectPlan {
    pub project_name: String,
    pub language: String,
    pub summary: String,
    pub tasks: Vec<String>,
    pub entrypoint: Option<String>,
    pub files: Vec<FileSpec>,
}

impl ProjectPlan {
    pub fn slug(&self) -> String {
        let mut slug = String::new();
        for c in self.project_name.to_lowercase().chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c);
            } else if !slug.ends_with('-') {
                slug.push('-');
            }
        }
        let slug = slug.trim_matches('-');
        if slug.is_empty() {
            "project".to_string()
        } else {
            slug.to_string()
        }
    }

    /// Summary followed by the key capabilities.
    pub fn describe(&self) -> String {
        let mut lines = Vec::new();
        if !self.summary.is_empty() {
            lines.push(self.summary.clone());
        }
        if !self.tasks.is_empty() {
            lines.push("Key capabilities:".to_string());
            lines.extend(self.tasks.iter().map(|t| format!("- {t}")));
        }
        lines.join("\n")
    }

    /// Task text for the agent generating `file`.
    pub fn build_instruction(&self, file: &FileSpec) -> String {
        let mut lines = vec![format!(
            "Create the file '{}' for the project '{}'.",
            file.path, self.project_name
        )];
        if !file.goal.is_empty() {
            lines.push(format!("Goal: {}.", file.goal));
        }
        if !self.summary.is_empty() {
            lines.push(format!("Project summary: {}.", self.summary));
        }
        if !self.language.is_empty() {
            lines.push(format!("Primary language: {}.", self.language));
        }
        if !self.tasks.is_empty() {
            lines.push("Key capabilities:".to_string());
            lines.extend(self.tasks.iter().map(|t| format!("- {t}")));
        }
        if !file.requirements.is_empty() {
            lines.push("File requirements:".to_string());
            lines.extend(file.requirements.iter().map(|r| format!("- {r}")));
        }
        lines.push(
            "Ensure the file is production-ready and consistent with the rest of the project."
                .to_string(),
        );
        lines.join("\n")
    }
}

/// Pick the agent for a file: a known hint wins, otherwise the extension decides.
pub fn capability_for(path: &str, hint: Option<&str>, goal: &str, language: &str) -> Capability {
    if let Some(cap) = hint.and_then(|h| h.parse::<Capability>().ok())
        && cap != Capability::ProjectArchitect
    {
        return cap;
    }

    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
        .to_lowercase();
    if name == "dockerfile" || name.ends_with(".dockerfile") {
        return Capability::Docker;
    }
    match Path::new(&name).extension().and_then(|e| e.to_str()) {
        Some("py") => Capability::Python,
        Some("rs") => Capability::Rust,
        Some("sh") | Some("bash") => Capability::Bash,
        None if language == "python" && goal.to_lowercase().starts_with("module") => {
            Capability::Python
        }
        _ => Capability::Universal,
    }
}

// ── Parsing ────────────────────────────────────────────────────────────

/// Top-level fields stay loosely typed so one odd field (a string `tasks`,
/// a numeric name) does not reject the whole document.
#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    project_name: Value,
    #[serde(default)]
    language: Value,
    #[serde(default)]
    summary: Value,
    #[serde(default)]
    tasks: Value,
    #[serde(default)]
    entrypoint: Value,
    #[serde(default)]
    files: Value,
}

impl RawPlan {
    fn file_entries(&self) -> &[Value] {
        match &self.files {
            Value::Array(items) => items,
            _ => &[],
        }
    }
}

fn replace_curly_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect()
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex is valid"))
}

fn strip_json_comments(text: &str) -> String {
    static LINE: OnceLock<Regex> = OnceLock::new();
    static BLOCK: OnceLock<Regex> = OnceLock::new();
    let no_line = regex(&LINE, r"(?m)//.*$").replace_all(text, "");
    regex(&BLOCK, r"(?s)/\*.*?\*/")
        .replace_all(&no_line, "")
        .into_owned()
}

fn remove_trailing_commas(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = regex(&RE, r",(\s*[}\]])");
    let mut current = text.to_string();
    loop {
        let next = re.replace_all(&current, "$1").into_owned();
        if next == current {
            return current;
        }
        current = next;
    }
}

fn outer_object(text: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?s)\{.*\}").find(text).map(|m| m.as_str())
}

fn value_to_lines(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => s
            .lines()
            .map(|l| l.trim().trim_start_matches("- ").trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        Value::Array(items) => items.iter().flat_map(value_to_lines).collect(),
        Value::Null => Vec::new(),
        other => vec![other.to_string()],
    }
}

/// Scalar as trimmed text; empty and non-scalar values give `None`.
fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    Some(text).filter(|t| !t.is_empty())
}

fn str_field<'a>(obj: &'a serde_json::Map<String, Value>, key: &str) -> &'a str {
    obj.get(key).and_then(Value::as_str).map(str::trim).unwrap_or("")
}

fn try_json(candidate: &str) -> Option<RawPlan> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return None;
    }
    serde_json::from_str::<RawPlan>(candidate).ok().or_else(|| {
        outer_object(candidate)
            .and_then(|obj| serde_json::from_str(&remove_trailing_commas(obj)).ok())
    })
}

/// Salvage per-file objects and top-level strings when the whole document
/// is not valid JSON.
fn regex_fallback(text: &str) -> Option<RawPlan> {
    static FILE: OnceLock<Regex> = OnceLock::new();
    static PATH: OnceLock<Regex> = OnceLock::new();
    static GOAL: OnceLock<Regex> = OnceLock::new();
    static AGENT: OnceLock<Regex> = OnceLock::new();
    static REQS: OnceLock<Regex> = OnceLock::new();
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    static NAME: OnceLock<Regex> = OnceLock::new();
    static LANG: OnceLock<Regex> = OnceLock::new();
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    static TASKS: OnceLock<Regex> = OnceLock::new();
    static ENTRY: OnceLock<Regex> = OnceLock::new();

    let capture = |re: &Regex, hay: &str| {
        re.captures(hay)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let quoted = regex(&QUOTED, r#""([^"]+)""#);

    let mut files = Vec::new();
    for block in regex(&FILE, r#"(?s)\{[^{}]*?"path"\s*:\s*"[^"]+"[^{}]*?\}"#).find_iter(text) {
        let cleaned = remove_trailing_commas(&strip_json_comments(block.as_str()));
        if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(&cleaned) {
            files.push(v);
            continue;
        }
        let block = block.as_str();
        let Some(path) = capture(regex(&PATH, r#""path"\s*:\s*"([^"]+)""#), block) else {
            continue;
        };
        let mut entry = serde_json::Map::new();
        entry.insert("path".into(), Value::String(path));
        if let Some(goal) = capture(regex(&GOAL, r#""goal"\s*:\s*"([^"]*)""#), block) {
            entry.insert("goal".into(), Value::String(goal));
        }
        if let Some(agent) = capture(regex(&AGENT, r#""agent"\s*:\s*"([^"]*)""#), block) {
            entry.insert("agent".into(), Value::String(agent));
        }
        if let Some(reqs) = regex(&REQS, r#"(?s)"requirements"\s*:\s*\[(.*?)\]"#)
            .captures(block)
            .and_then(|c| c.get(1))
        {
            let items: Vec<Value> = quoted
                .captures_iter(reqs.as_str())
                .filter_map(|c| c.get(1))
                .map(|m| Value::String(m.as_str().to_string()))
                .collect();
            entry.insert("requirements".into(), Value::Array(items));
        }
        files.push(Value::Object(entry));
    }

    if files.is_empty() {
        return None;
    }
    let field = |cell: &'static OnceLock<Regex>, pattern: &str| {
        capture(regex(cell, pattern), text).map_or(Value::Null, Value::String)
    };
    Some(RawPlan {
        project_name: field(&NAME, r#""project_name"\s*:\s*"([^"]+)""#),
        language: field(&LANG, r#""language"\s*:\s*"([^"]+)""#),
        summary: field(&SUMMARY, r#""summary"\s*:\s*"([^"]*)""#),
        tasks: field(&TASKS, r#""tasks"\s*:\s*"([^"]+)""#),
        entrypoint: field(&ENTRY, r#""entrypoint"\s*:\s*"([^"]+)""#),
        files: Value::Array(files),
    })
}

fn into_plan(raw: RawPlan) -> ProjectPlan {
    let language = scalar_text(&raw.language)
        .map(|l| l.to_lowercase())
        .unwrap_or_else(|| "python".to_string());

    let mut seen = HashSet::new();
    let mut files = Vec::new();
    for item in raw.file_entries() {
        let Value::Object(obj) = item else { continue };
        let path = str_field(obj, "path").replace('\\', "/");
        if path.is_empty() {
            continue;
        }
        if !seen.insert(path.clone()) {
            tracing::warn!(path = %path, "Duplicate file in project plan, keeping the first");
            continue;
        }
        let goal = str_field(obj, "goal").to_string();
        let hint = Some(str_field(obj, "agent")).filter(|h| !h.is_empty());
        let requirements = obj.get("requirements").map(value_to_lines).unwrap_or_default();
        files.push(FileSpec {
            capability: capability_for(&path, hint, &goal, &language),
            path,
            goal,
            requirements,
        });
    }

    ProjectPlan {
        project_name: scalar_text(&raw.project_name).unwrap_or_else(|| "project".to_string()),
        language,
        summary: scalar_text(&raw.summary).unwrap_or_default(),
        tasks: value_to_lines(&raw.tasks),
        entrypoint: scalar_text(&raw.entrypoint),
        files,
    }
}

pub fn parse_project_plan(raw: &str) -> Result<ProjectPlan, GenerationError> {
    let parse_err = |reason: &str| GenerationError::Parse {
        agent: Capability::ProjectArchitect.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(parse_err("empty response"));
    }
    let base = replace_curly_quotes(&strip_code_fences(trimmed));

    let candidates = [
        base.clone(),
        strip_json_comments(&base),
        remove_trailing_commas(&base),
        remove_trailing_commas(&strip_json_comments(&base)),
    ];
    let parsed = candidates
        .iter()
        .filter_map(|c| try_json(c))
        .find(|p| !p.file_entries().is_empty());

    let plan = parsed
        .or_else(|| regex_fallback(&replace_curly_quotes(trimmed)))
        .map(into_plan)
        .ok_or_else(|| parse_err("no JSON project plan found"))?;

    if plan.files.is_empty() {
        return Err(parse_err("project plan lists no files"));
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json() {
        let raw = r#"{
            "project_name": "Log Shipper",
            "language": "python",
            "summary": "Ships logs.",
            "tasks": ["tail files", "post batches"],
            "entrypoint": "main.py",
            "files": [
                {"path": "Dockerfile", "goal": "container image"},
                {"path": "app.py", "goal": "service", "requirements": ["use asyncio"]}
            ]
        }"#;
        let plan = parse_project_plan(raw).unwrap();
        assert_eq!(plan.project_name, "Log Shipper");
        assert_eq!(plan.slug(), "log-shipper");
        assert_eq!(plan.entrypoint.as_deref(), Some("main.py"));
        let paths: Vec<&str> = plan.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["Dockerfile", "app.py"]);
        assert_eq!(plan.files[0].capability, Capability::Docker);
        assert_eq!(plan.files[1].capability, Capability::Python);
        assert_eq!(plan.files[1].requirements, ["use asyncio"]);
    }

    #[test]
    fn tolerates_fences_comments_and_trailing_commas() {
        let raw = "```json\n{\n  // layout\n  \u{201C}project_name\u{201D}: \"demo\",\n  \"files\": [\n    {\"path\": \"run.sh\", \"requirements\": \"- strict mode\\n- logging\",},\n  ],\n}\n```";
        let plan = parse_project_plan(raw).unwrap();
        assert_eq!(plan.project_name, "demo");
        assert_eq!(plan.files[0].capability, Capability::Bash);
        assert_eq!(plan.files[0].requirements, ["strict mode", "logging"]);
    }

    #[test]
    fn salvages_file_objects_from_broken_json() {
        let raw = r#"Here is the plan: {"project_name": "x", "files": [ {"path": "README.md", "goal": "docs"}, {"path": "src/x/cli.py", "agent": "python", "requirements": ["argparse"]} ] oops"#;
        let plan = parse_project_plan(raw).unwrap();
        assert_eq!(plan.files.len(), 2);
        assert_eq!(plan.files[0].capability, Capability::Universal);
        assert_eq!(plan.files[1].path, "src/x/cli.py");
        assert_eq!(plan.files[1].requirements, ["argparse"]);
    }

    #[test]
    fn loosely_typed_fields_survive() {
        let plan = parse_project_plan(
            r#"{"project_name": 42, "tasks": "serve hello\n- log requests", "entrypoint": "app.py", "files": [{"path": "app.py"}]}"#,
        )
        .unwrap();
        assert_eq!(plan.project_name, "42");
        assert_eq!(plan.tasks, ["serve hello", "log requests"]);
        assert_eq!(plan.entrypoint.as_deref(), Some("app.py"));
        assert_eq!(plan.files.len(), 1);
    }

    #[test]
    fn duplicate_paths_keep_the_first() {
        let raw = r#"{"files": [
            {"path": "app.py", "goal": "first"},
            {"path": "app.py", "goal": "second"},
            {"path": "README.md"}
        ]}"#;
        let plan = parse_project_plan(raw).unwrap();
        assert_eq!(plan.files.len(), 2);
        assert_eq!(plan.files[0].goal, "first");
    }

    #[test]
    fn no_files_is_an_error() {
        assert!(parse_project_plan(r#"{"project_name": "empty", "files": []}"#).is_err());
        assert!(parse_project_plan("# Generated (dummy backend)\n# nothing").is_err());
        assert!(parse_project_plan("").is_err());
    }

    #[test]
    fn hint_beats_extension() {
        assert_eq!(
            capability_for("setup.txt", Some("bash"), "", "python"),
            Capability::Bash
        );
        assert_eq!(
            capability_for("setup.txt", Some("wizard"), "", "python"),
            Capability::Universal
        );
        assert_eq!(
            capability_for("src/pkg/core", None, "Module with helpers", "python"),
            Capability::Python
        );
    }

    #[test]
    fn instruction_mentions_file_and_requirements() {
        let plan = parse_project_plan(
            r#"{"project_name": "demo", "summary": "A demo", "files": [{"path": "a.py", "goal": "entry", "requirements": ["print hi"]}]}"#,
        )
        .unwrap();
        let text = plan.build_instruction(&plan.files[0]);
        assert!(text.starts_with("Create the file 'a.py' for the project 'demo'."));
        assert!(text.contains("Project summary: A demo."));
        assert!(text.contains("- print hi"));
    }
}
