//! Cleanup of raw model replies into file contents.
//!
//! Models wrap code in Markdown fences, add prose before and after, or
//! answer with something that is not the requested language at all. These
//! helpers recover the file body, and fall back to a scaffold for bash and
//! python when nothing usable came back.

use std::sync::OnceLock;

use regex::Regex;

use crate::llm::DUMMY_MARKER;

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"```(?P<lang>[A-Za-z0-9_+-]+)?[ \t]*\r?\n(?P<body>[\s\S]*?)```")
            .expect("fence regex is valid")
    })
}

/// `(language hint, body)` for every fenced block, in order.
pub fn fenced_blocks(text: &str) -> Vec<(String, String)> {
    fence_re()
        .captures_iter(text)
        .map(|c| {
            let lang = c
                .name("lang")
                .map(|m| m.as_str().to_lowercase())
                .unwrap_or_default();
            let body = c.name("body").map(|m| m.as_str()).unwrap_or_default();
            (lang, body.to_string())
        })
        .collect()
}

/// Drop an outer fence when the text starts with one.
pub fn strip_code_fences(text: &str) -> String {
    if !text.starts_with("```") {
        return text.to_string();
    }
    let lines: Vec<&str> = text.lines().collect();
    let closing = (1..lines.len()).rev().find(|&i| lines[i].starts_with("```"));
    let body = match closing {
        Some(end) => &lines[1..end],
        None => &lines[1..],
    };
    body.join("\n").trim().to_string()
}

/// Longest block tagged with one of `langs`, else the longest block.
fn pick_block(blocks: &[(String, String)], langs: &[&str]) -> Option<String> {
    let tagged: Vec<&(String, String)> = blocks
        .iter()
        .filter(|(lang, _)| langs.contains(&lang.as_str()))
        .collect();
    let pool: Vec<&(String, String)> = if tagged.is_empty() {
        blocks.iter().collect()
    } else {
        tagged
    };
    pool.into_iter()
        .map(|(_, body)| body.trim().to_string())
        .max_by_key(|b| b.len())
}

/// Single-quote a string for bash.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ── Bash ───────────────────────────────────────────────────────────────

const BASH_SCAFFOLD: &str = r#"#!/usr/bin/env bash
set -euo pipefail

usage() {
  cat <<'EOF'
Usage: ${0##*/} [-o OUTPUT]

This scaffolded script was generated automatically and must be customised
for the task stored in TASK below.

Options:
  -o  Save the task description to the specified file
  -h  Show this help message and exit
EOF
}

log() {
  printf '[%s] %s\n' "$(date '+%Y-%m-%d %H:%M:%S')" "$*"
}

abort() {
  local msg=$1
  local code=${2:-1}
  printf '[%s] ERROR: %s\n' "$(date '+%Y-%m-%d %H:%M:%S')" "${msg}" >&2
  exit "${code}"
}

TASK=__TASK__
OUTPUT=""

while getopts ':o:h' opt; do
  case "${opt}" in
    o) OUTPUT=${OPTARG} ;;
    h) usage; exit 0 ;;
    :) abort "Option -${OPTARG} requires an argument." 64 ;;
    *) abort "Unknown option -${OPTARG}." 64 ;;
  esac
done

shift $((OPTIND - 1))

MESSAGE="TODO: Implement the following task in Bash -> ${TASK}"

if [[ -n "${OUTPUT}" ]]; then
  mkdir -p "$(dirname "${OUTPUT}")"
  printf '%s\n' "${MESSAGE}" >"${OUTPUT}"
  log "Placeholder instructions saved to ${OUTPUT}"
else
  log "Placeholder instructions"
  printf '%s\n' "${MESSAGE}"
fi

exit 0
"#;

/// The scaffold used when the model did not return a usable script.
pub fn bash_scaffold(task: &str) -> String {
    BASH_SCAFFOLD.replace("__TASK__", &shell_quote(task.trim()))
}

fn looks_like_bash(code: &str) -> bool {
    let head = code.trim_start();
    let shebang = head.starts_with("#!/usr/bin/env bash") || head.starts_with("#!/bin/bash");
    shebang && code.contains("set -euo pipefail") && !code.contains("[PYTHON]")
}

pub fn bash_script(raw: &str, task: &str) -> String {
    let text = raw.trim();
    let blocks = fenced_blocks(text);
    let code = pick_block(&blocks, &["bash", "sh", "shell"]).unwrap_or_else(|| text.to_string());

    if looks_like_bash(&code) {
        let mut code = code.trim().to_string();
        code.push('\n');
        return code;
    }
    tracing::debug!("Bash reply is not a strict-mode script, using scaffold");
    bash_scaffold(task)
}

// ── Python ─────────────────────────────────────────────────────────────

/// The scaffold used when the model returned nothing usable.
pub fn python_scaffold(task: &str) -> String {
    let mut out = String::from("# Python scaffold for task:\n");
    for line in task.trim().lines() {
        out.push_str("#   ");
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out.push_str(
        "#\n# The model did not return valid Python; implement the solution here.\n\n\n\
         def main() -> None:\n    raise NotImplementedError(\"generated scaffold\")\n\n\n\
         if __name__ == \"__main__\":\n    main()\n",
    );
    out
}

fn strip_fence_noise(code: &str) -> String {
    let mut lines: Vec<&str> = code
        .lines()
        .filter(|l| !l.trim_start().starts_with("```"))
        .collect();
    if lines
        .first()
        .is_some_and(|l| matches!(l.trim().to_lowercase().as_str(), "python" | "py"))
    {
        lines.remove(0);
    }
    lines.join("\n").trim().to_string()
}

fn has_main_guard(code: &str) -> bool {
    code.contains("if __name__ == \"__main__\":") || code.contains("if __name__ == '__main__':")
}

pub fn python_script(raw: &str, task: &str) -> String {
    let text = raw.trim();
    if text.is_empty() {
        return python_scaffold(task);
    }
    if text.contains(DUMMY_MARKER) {
        return format!("{text}\n");
    }

    let blocks = fenced_blocks(text);
    let candidate = pick_block(&blocks, &["python", "py"]).unwrap_or_else(|| text.to_string());
    let mut code = strip_fence_noise(&candidate);
    if code.is_empty() {
        return python_scaffold(task);
    }

    if code.contains("def main(") && !has_main_guard(&code) {
        code.push_str("\n\n\nif __name__ == \"__main__\":\n    main()");
    }
    code.push('\n');
    code
}

// ── Dockerfile ─────────────────────────────────────────────────────────

fn dockerfile_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)```(?:dockerfile)?\s*(.*?)```").expect("valid regex"))
}

/// Keep everything from the first comment, `FROM` or `ARG` line onwards.
pub fn dockerfile(raw: &str) -> String {
    let raw = raw.trim();
    let code = dockerfile_fence_re()
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw);

    let mut started = false;
    let mut kept = Vec::new();
    for line in code.lines() {
        let stripped = line.trim();
        if !started {
            let upper = stripped.to_uppercase();
            if stripped.starts_with('#') || upper.starts_with("FROM ") || upper.starts_with("ARG ") {
                started = true;
            } else {
                continue;
            }
        }
        kept.push(line.trim_end());
    }

    let cleaned = kept.join("\n").trim().to_string();
    if cleaned.is_empty() {
        code.trim().to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_outer_fence() {
        assert_eq!(strip_code_fences("```toml\n[a]\nb = 1\n```"), "[a]\nb = 1");
        assert_eq!(strip_code_fences("```\nno close"), "no close");
        assert_eq!(strip_code_fences("plain"), "plain");
    }

    #[test]
    fn collects_fenced_blocks() {
        let text = "intro\n```python\nprint(1)\n```\nmiddle\n```\nx\n```";
        let blocks = fenced_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].0, "python");
        assert_eq!(blocks[0].1.trim(), "print(1)");
        assert_eq!(blocks[1].0, "");
    }

    #[test]
    fn quotes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn valid_bash_passes_through() {
        let script = "```bash\n#!/usr/bin/env bash\nset -euo pipefail\necho hi\n```\nThis prints hi.";
        let out = bash_script(script, "say hi");
        assert!(out.starts_with("#!/usr/bin/env bash"));
        assert!(out.contains("echo hi"));
        assert!(!out.contains("This prints"));
    }

    #[test]
    fn junk_bash_becomes_scaffold() {
        let out = bash_script("[PYTHON]\nprint('nope')\n[/PYTHON]", "rotate 'nginx' logs");
        assert!(out.starts_with("#!/usr/bin/env bash\nset -euo pipefail"));
        assert!(out.contains(r"TASK='rotate '\''nginx'\'' logs'"));
    }

    #[test]
    fn python_prefers_tagged_block_and_adds_guard() {
        let raw = "Here you go:\n```python\ndef main():\n    print('hi')\n```\nEnjoy!";
        let out = python_script(raw, "greet");
        assert!(out.starts_with("def main():"));
        assert!(out.contains("if __name__ == \"__main__\":\n    main()"));
        assert!(!out.contains("Enjoy"));
    }

    #[test]
    fn python_keeps_existing_guard() {
        let raw = "def main():\n    pass\n\nif __name__ == '__main__':\n    main()\n";
        let out = python_script(raw, "noop");
        assert_eq!(out.matches("__main__").count(), 1);
    }

    #[test]
    fn empty_python_becomes_scaffold() {
        let out = python_script("   ", "parse logs");
        assert!(out.contains("#   parse logs"));
        assert!(out.contains("def main() -> None:"));
    }

    #[test]
    fn dockerfile_drops_leading_prose() {
        let raw = "Sure! Here is the file:\n\n```dockerfile\nFROM python:3.11-slim\nRUN pip install uv\n```\nDone.";
        assert_eq!(dockerfile(raw), "FROM python:3.11-slim\nRUN pip install uv");

        let unfenced = "Explanation first\nFROM alpine:3.20\nCMD [\"sh\"]";
        assert_eq!(dockerfile(unfenced), "FROM alpine:3.20\nCMD [\"sh\"]");
    }
}
