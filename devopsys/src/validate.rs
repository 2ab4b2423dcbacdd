//! Syntax validation of generated files.
//!
//! Each file kind resolves once to a [`Checker`]: an external tool when it
//! is installed, otherwise a built-in structural rule, otherwise nothing.
//! The resolution is cached for the life of the [`Validator`]. External
//! tools always run on a temporary copy, so validation never touches the
//! workspace and repeated runs over the same content agree.

use std::collections::HashMap;
use std::fmt;
use std::iter::Peekable;
use std::path::Path;
use std::str::Chars;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::workspace::{self, CommandError};

const CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_DIAGNOSTICS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Python,
    Shell,
    Dockerfile,
    Json,
    Toml,
    Yaml,
    Rust,
    Markdown,
    Text,
}

impl FileKind {
    /// Infer the kind from the file name, then the shebang.
    pub fn detect(path: &str, content: &str) -> Self {
        let name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path)
            .to_lowercase();
        if name == "dockerfile" || name.starts_with("dockerfile.") || name.ends_with(".dockerfile") {
            return FileKind::Dockerfile;
        }
        let by_ext = match Path::new(&name).extension().and_then(|e| e.to_str()) {
            Some("py") => Some(FileKind::Python),
            Some("sh") | Some("bash") => Some(FileKind::Shell),
            Some("json") => Some(FileKind::Json),
            Some("toml") => Some(FileKind::Toml),
            Some("yml") | Some("yaml") => Some(FileKind::Yaml),
            Some("rs") => Some(FileKind::Rust),
            Some("md") | Some("markdown") => Some(FileKind::Markdown),
            Some(_) => Some(FileKind::Text),
            None => None,
        };
        if let Some(kind) = by_ext {
            return kind;
        }
        let first = content.trim_start().lines().next().unwrap_or("");
        if first.starts_with("#!") {
            if first.contains("python") {
                return FileKind::Python;
            }
            if first.contains("bash") || first.ends_with("/sh") || first.ends_with(" sh") {
                return FileKind::Shell;
            }
        }
        FileKind::Text
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileKind::Python => "python",
            FileKind::Shell => "shell",
            FileKind::Dockerfile => "dockerfile",
            FileKind::Json => "json",
            FileKind::Toml => "toml",
            FileKind::Yaml => "yaml",
            FileKind::Rust => "rust",
            FileKind::Markdown => "markdown",
            FileKind::Text => "text",
        }
    }

    fn external_tool(&self) -> Option<ExternalTool> {
        match self {
            FileKind::Python => Some(ExternalTool {
                program: "python3",
                args: &["-m", "py_compile"],
            }),
            FileKind::Shell => Some(ExternalTool {
                program: "bash",
                args: &["-n"],
            }),
            FileKind::Dockerfile => Some(ExternalTool {
                program: "hadolint",
                args: &["--failure-threshold", "error"],
            }),
            _ => None,
        }
    }

    fn has_builtin(&self) -> bool {
        !matches!(self, FileKind::Text)
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Pass,
    Fail,
    Skipped,
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStatus::Pass => write!(f, "pass"),
            ValidationStatus::Fail => write!(f, "fail"),
            ValidationStatus::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub path: String,
    pub kind: FileKind,
    /// Tool or rule that produced the verdict.
    pub checker: String,
    pub status: ValidationStatus,
    pub diagnostics: Vec<String>,
}

/// An installed program invoked as `program args... <file>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalTool {
    pub program: &'static str,
    pub args: &'static [&'static str],
}

impl ExternalTool {
    fn describe(&self) -> String {
        let mut parts = vec![self.program];
        parts.extend(self.args.iter().copied());
        parts.join(" ")
    }
}

/// How files of one kind get checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checker {
    External(ExternalTool),
    Builtin(FileKind),
    None,
}

pub struct Validator {
    external_checks: bool,
    strategies: Mutex<HashMap<FileKind, Checker>>,
}

impl Validator {
    pub fn new(external_checks: bool) -> Self {
        Self {
            external_checks,
            strategies: Mutex::new(HashMap::new()),
        }
    }

    /// Never shells out. Results depend only on content.
    pub fn builtin_only() -> Self {
        Self::new(false)
    }

    /// Resolve (once) the checker for `kind`.
    pub async fn strategy(&self, kind: FileKind) -> Checker {
        let mut cache = self.strategies.lock().await;
        if let Some(checker) = cache.get(&kind) {
            return *checker;
        }
        let checker = self.probe(kind).await;
        tracing::debug!(kind = %kind, checker = ?checker, "Resolved checker");
        cache.insert(kind, checker);
        checker
    }

    async fn probe(&self, kind: FileKind) -> Checker {
        if self.external_checks
            && let Some(tool) = kind.external_tool()
        {
            match workspace::run_command(tool.program, &["--version"], None, PROBE_TIMEOUT).await {
                Ok(_) => return Checker::External(tool),
                Err(e) => tracing::debug!(program = tool.program, error = %e, "Checker not available"),
            }
        }
        if kind.has_builtin() {
            Checker::Builtin(kind)
        } else {
            Checker::None
        }
    }

    /// Validate `content` as if it were saved at `path`. Never fails.
    pub async fn validate(&self, path: &str, content: &str) -> ValidationResult {
        let kind = FileKind::detect(path, content);
        let checker = self.strategy(kind).await;

        let (checker_name, status, diagnostics) = match checker {
            Checker::None => ("none".to_string(), ValidationStatus::Skipped, Vec::new()),
            Checker::Builtin(kind) => {
                let (status, diags) = builtin_check(kind, content);
                (format!("builtin:{kind}"), status, diags)
            }
            Checker::External(tool) => match run_external(tool, path, content).await {
                Ok((status, diags)) => (tool.describe(), status, diags),
                Err(e) => {
                    let (status, mut diags) = builtin_check(kind, content);
                    diags.insert(0, format!("{} unusable ({e}), used built-in rules", tool.program));
                    (format!("builtin:{kind}"), status, diags)
                }
            },
        };

        let mut diagnostics = diagnostics;
        diagnostics.truncate(MAX_DIAGNOSTICS);
        tracing::info!(path = %path, kind = %kind, status = %status, "Validated");
        ValidationResult {
            path: path.to_string(),
            kind,
            checker: checker_name,
            status,
            diagnostics,
        }
    }

    /// Validate a file already on disk. An unreadable file fails.
    pub async fn validate_file(&self, path: &Path) -> ValidationResult {
        let display = path.display().to_string();
        match tokio::fs::read(path).await {
            Ok(bytes) => self.validate(&display, &String::from_utf8_lossy(&bytes)).await,
            Err(e) => ValidationResult {
                kind: FileKind::detect(&display, ""),
                path: display,
                checker: "none".to_string(),
                status: ValidationStatus::Fail,
                diagnostics: vec![format!("cannot read file: {e}")],
            },
        }
    }
}

async fn run_external(
    tool: ExternalTool,
    path: &str,
    content: &str,
) -> Result<(ValidationStatus, Vec<String>), CommandError> {
    let dir = tempfile::Builder::new()
        .prefix("devopsys-check")
        .tempdir()
        .map_err(CommandError::Io)?;
    let file_name = Path::new(path)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "artifact".into());
    let copy = dir.path().join(file_name);
    tokio::fs::write(&copy, content)
        .await
        .map_err(CommandError::Io)?;

    let copy_str = copy.to_string_lossy().into_owned();
    let mut args: Vec<&str> = tool.args.to_vec();
    args.push(&copy_str);
    let output = workspace::run_command(tool.program, &args, Some(dir.path()), CHECK_TIMEOUT).await?;

    if output.success() {
        return Ok((ValidationStatus::Pass, Vec::new()));
    }
    let diagnostics = output
        .combined(4000)
        .replace(&copy_str, path)
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    let diagnostics = if diagnostics.is_empty() {
        vec![format!("{} exited with {:?}", tool.program, output.code)]
    } else {
        diagnostics
    };
    Ok((ValidationStatus::Fail, diagnostics))
}

// ── Built-in rules ─────────────────────────────────────────────────────

/// Comment and quoting rules for the delimiter scan.
struct Lexing {
    hash_comments: bool,
    slash_comments: bool,
    single_quotes: bool,
    /// Python `"""` and `'''` strings, which may span lines.
    triple_quotes: bool,
    pairs: &'static [(char, char)],
}

const ALL_PAIRS: &[(char, char)] = &[('(', ')'), ('[', ']'), ('{', '}')];
// `case` patterns leave `)` unmatched in shell.
const SHELL_PAIRS: &[(char, char)] = &[('[', ']'), ('{', '}')];

fn lexing(kind: FileKind) -> Lexing {
    match kind {
        FileKind::Rust => Lexing {
            hash_comments: false,
            slash_comments: true,
            single_quotes: false,
            triple_quotes: false,
            pairs: ALL_PAIRS,
        },
        FileKind::Shell => Lexing {
            hash_comments: true,
            slash_comments: false,
            single_quotes: true,
            triple_quotes: false,
            pairs: SHELL_PAIRS,
        },
        FileKind::Yaml => Lexing {
            hash_comments: true,
            slash_comments: false,
            single_quotes: true,
            triple_quotes: false,
            pairs: &[('[', ']'), ('{', '}')],
        },
        _ => Lexing {
            hash_comments: true,
            slash_comments: false,
            single_quotes: true,
            triple_quotes: kind == FileKind::Python,
            pairs: ALL_PAIRS,
        },
    }
}

/// Consume the two quotes following `q` when they complete a triple.
fn take_triple(chars: &mut Peekable<Chars<'_>>, q: char) -> bool {
    let mut ahead = chars.clone();
    if ahead.next() == Some(q) && ahead.next() == Some(q) {
        chars.next();
        chars.next();
        true
    } else {
        false
    }
}

/// Report unbalanced delimiters outside comments and string literals.
/// Ordinary quote state resets at each line end; triple-quoted strings
/// carry over.
pub fn delimiter_diagnostics(kind: FileKind, content: &str) -> Vec<String> {
    let lex = lexing(kind);
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut diags = Vec::new();
    let mut block_comment = false;
    let mut triple: Option<(char, usize)> = None;

    for (lineno, line) in content.lines().enumerate() {
        let lineno = lineno + 1;
        let mut quote: Option<char> = None;
        let mut prev: Option<char> = None;
        let mut chars = line.chars().peekable();

        while let Some(c) = chars.next() {
            if let Some((q, _)) = triple {
                if c == '\\' {
                    chars.next();
                } else if c == q && take_triple(&mut chars, q) {
                    triple = None;
                }
                prev = Some(c);
                continue;
            }
            if block_comment {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    block_comment = false;
                }
                prev = Some(c);
                continue;
            }
            if let Some(q) = quote {
                if c == '\\' && q != '\'' {
                    chars.next();
                } else if c == q {
                    quote = None;
                }
                prev = Some(c);
                continue;
            }
            match c {
                '\\' => {
                    chars.next();
                }
                '"' | '\'' if lex.triple_quotes && take_triple(&mut chars, c) => {
                    triple = Some((c, lineno));
                }
                '"' => quote = Some('"'),
                '\'' if lex.single_quotes => quote = Some('\''),
                '#' if lex.hash_comments && prev.is_none_or(char::is_whitespace) => break,
                '/' if lex.slash_comments && chars.peek() == Some(&'/') => break,
                '/' if lex.slash_comments && chars.peek() == Some(&'*') => {
                    chars.next();
                    block_comment = true;
                }
                _ => {
                    if lex.pairs.iter().any(|(open, _)| *open == c) {
                        stack.push((c, lineno));
                    } else if let Some((open, _)) = lex.pairs.iter().find(|(_, close)| *close == c) {
                        match stack.pop() {
                            Some((top, _)) if top == *open => {}
                            Some((top, at)) => diags.push(format!(
                                "line {lineno}: '{c}' does not match '{top}' opened on line {at}"
                            )),
                            None => diags.push(format!("line {lineno}: unmatched '{c}'")),
                        }
                    }
                }
            }
            prev = Some(c);
        }
    }

    if let Some((q, at)) = triple {
        diags.push(format!("line {at}: string {q}{q}{q} is never closed"));
    }
    for (open, at) in stack {
        diags.push(format!("line {at}: '{open}' is never closed"));
    }
    diags
}

const DOCKER_INSTRUCTIONS: &[&str] = &[
    "FROM", "RUN", "CMD", "LABEL", "MAINTAINER", "EXPOSE", "ENV", "ADD", "COPY", "ENTRYPOINT",
    "VOLUME", "USER", "WORKDIR", "ARG", "ONBUILD", "STOPSIGNAL", "HEALTHCHECK", "SHELL",
];

fn dockerfile_diagnostics(content: &str) -> Vec<String> {
    let mut diags = Vec::new();
    let mut first: Option<String> = None;
    let mut continued = false;
    let mut heredoc: Option<String> = None;

    for (lineno, line) in content.lines().enumerate() {
        let lineno = lineno + 1;
        let trimmed = line.trim();
        if let Some(end) = &heredoc {
            if trimmed == end {
                heredoc = None;
            }
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let was_continued = continued;
        continued = trimmed.ends_with('\\');
        if was_continued {
            continue;
        }

        let word = trimmed
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_uppercase();
        if !DOCKER_INSTRUCTIONS.contains(&word.as_str()) {
            diags.push(format!("line {lineno}: unknown instruction '{word}'"));
        }
        if let Some(pos) = trimmed.find("<<") {
            let marker: String = trimmed[pos + 2..]
                .trim_start_matches('-')
                .trim_matches(|c| c == '"' || c == '\'')
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !marker.is_empty() {
                heredoc = Some(marker);
            }
        }
        if first.is_none() {
            first = Some(word);
        }
    }

    match first.as_deref() {
        None => diags.insert(0, "no instructions found".to_string()),
        Some("FROM") | Some("ARG") => {}
        Some(other) => diags.insert(0, format!("first instruction must be FROM or ARG, found {other}")),
    }
    diags
}

fn yaml_diagnostics(content: &str) -> Vec<String> {
    let mut diags: Vec<String> = content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            line.chars()
                .take_while(|c| c.is_whitespace())
                .any(|c| c == '\t')
        })
        .map(|(i, _)| format!("line {}: tab used for indentation", i + 1))
        .collect();
    diags.extend(delimiter_diagnostics(FileKind::Yaml, content));
    diags
}

/// Structural rule for `kind`. Pure: depends only on `content`.
pub fn builtin_check(kind: FileKind, content: &str) -> (ValidationStatus, Vec<String>) {
    let empty = content.trim().is_empty();
    let diags = match kind {
        FileKind::Text => return (ValidationStatus::Skipped, Vec::new()),
        FileKind::Markdown => {
            if empty {
                vec!["file is empty".to_string()]
            } else {
                Vec::new()
            }
        }
        FileKind::Json => match serde_json::from_str::<serde_json::Value>(content) {
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("invalid JSON: {e}")],
        },
        FileKind::Toml => match content.parse::<toml::Table>() {
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("invalid TOML: {}", e.message())],
        },
        FileKind::Yaml => yaml_diagnostics(content),
        FileKind::Dockerfile => dockerfile_diagnostics(content),
        FileKind::Python | FileKind::Shell | FileKind::Rust => {
            if empty {
                vec!["file is empty".to_string()]
            } else {
                delimiter_diagnostics(kind, content)
            }
        }
    };
    if diags.is_empty() {
        (ValidationStatus::Pass, diags)
    } else {
        (ValidationStatus::Fail, diags)
    }
}
