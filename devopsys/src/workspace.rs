//! Filesystem access for generated artifacts.
//!
//! All writes go through a [`Workspace`] rooted at a caller-supplied
//! directory. Paths must be relative and may not climb out with `..`.
//! Existing files are only replaced when the caller asked for it.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::GenerationError;

/// Directories never listed or snapshotted.
const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".venv",
    "__pycache__",
    ".mypy_cache",
    ".pytest_cache",
    "node_modules",
    "target",
];

/// Check that `path` is relative and stays below its root.
pub fn safe_relative(path: &str) -> Result<PathBuf, GenerationError> {
    let unsafe_path = || GenerationError::UnsafePath(path.to_string());
    let normalized = path.trim().replace('\\', "/");
    if normalized.is_empty() || normalized.starts_with('/') {
        return Err(unsafe_path());
    }

    let mut out = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path());
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(unsafe_path());
    }
    Ok(out)
}

/// Create parent directories and write `content` to `full`.
async fn write_bytes(full: &Path, content: &str) -> Result<(), GenerationError> {
    let io_err = |source| GenerationError::Write {
        path: full.to_path_buf(),
        source,
    };
    if let Some(parent) = full.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    tokio::fs::write(full, content).await.map_err(io_err)
}

/// Write to a path the user named explicitly (`--out`). Replacing an
/// existing file there is the point of the flag.
pub async fn write_explicit(path: &Path, content: &str) -> Result<PathBuf, GenerationError> {
    write_bytes(path, content).await?;
    tracing::info!(path = %path.display(), bytes = content.len(), "Wrote output file");
    Ok(path.to_path_buf())
}

/// A directory that generated files are written into.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    overwrite: bool,
}

impl Workspace {
    /// Create the root directory if needed.
    pub async fn open(root: &Path, overwrite: bool) -> io::Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        Ok(Self {
            root: root.to_path_buf(),
            overwrite,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a relative path, after the safety check.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, GenerationError> {
        Ok(self.root.join(safe_relative(path)?))
    }

    /// Write a file relative to the root.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<PathBuf, GenerationError> {
        let full = self.resolve(path)?;
        if !self.overwrite && tokio::fs::try_exists(&full).await.unwrap_or(false) {
            return Err(GenerationError::Exists(full));
        }
        write_bytes(&full, content).await?;
        tracing::info!(path = %path, bytes = content.len(), "Wrote file");
        Ok(full)
    }

    /// List files recursively, relative to the root.
    pub async fn list_files(&self) -> Vec<String> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || list_files_sync(&root))
            .await
            .unwrap_or_default()
    }
}

/// Sorted relative paths of every file under `root`, skipping tool caches.
pub fn list_files_sync(root: &Path) -> Vec<String> {
    fn walk(dir: &Path, root: &Path, result: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let name = entry.file_name();
                if IGNORED_DIRS.iter().any(|d| name == *d) {
                    continue;
                }
                walk(&path, root, result);
            } else if let Ok(rel) = path.strip_prefix(root) {
                result.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }

    let mut result = Vec::new();
    walk(root, root, &mut result);
    result.sort();
    result
}

fn truncate_chars(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Read-only view of a directory for prompts: up to `max_files` files with
/// their sizes, then a truncated excerpt of each.
pub fn snapshot(root: &Path, max_files: usize, max_bytes: usize) -> String {
    let files: Vec<String> = list_files_sync(root).into_iter().take(max_files).collect();

    let mut lines = vec![
        format!("Workspace root: {}", root.display()),
        "Files observed:".to_string(),
    ];
    if files.is_empty() {
        lines.push("- (no files detected)".to_string());
    }
    for rel in &files {
        match std::fs::metadata(root.join(rel)) {
            Ok(meta) => lines.push(format!("- {rel} ({} bytes)", meta.len())),
            Err(_) => lines.push(format!("- {rel} (size unavailable)")),
        }
    }

    lines.push(String::new());
    lines.push("File excerpts (truncated):".to_string());
    for rel in &files {
        let Ok(bytes) = std::fs::read(root.join(rel)) else {
            continue;
        };
        let text = String::from_utf8_lossy(&bytes);
        let excerpt = truncate_chars(&text, max_bytes).trim_end();
        if excerpt.is_empty() {
            continue;
        }
        lines.push(format!("--- {rel} ---"));
        lines.push(excerpt.to_string());
    }
    lines.join("\n")
}

/// Result of a finished subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr merged for display, capped in length.
    pub fn combined(&self, limit: usize) -> String {
        let mut result = self.stdout.trim_end().to_string();
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str(stderr);
        }
        if result.len() > limit {
            let cut = truncate_chars(&result, limit).len();
            result.truncate(cut);
            result.push_str("\n... (truncated)");
        }
        result
    }
}

/// How a subprocess run ended.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The program is not installed.
    #[error("command not found")]
    NotFound,
    #[error("command timed out")]
    TimedOut,
    #[error("failed to execute command: {0}")]
    Io(#[source] io::Error),
}

/// Run `program args...` in `cwd` with a hard timeout. The child is killed
/// when the timeout fires.
pub async fn run_command(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => return Err(CommandError::TimedOut),
        Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => return Err(CommandError::NotFound),
        Ok(Err(e)) => return Err(CommandError::Io(e)),
        Ok(Ok(output)) => output,
    };

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_paths() {
        for bad in ["/etc/passwd", "../up.txt", "a/../../b", "", "  ", "./", "\\\\server\\share"] {
            assert!(safe_relative(bad).is_err(), "{bad:?} should be rejected");
        }
        assert_eq!(safe_relative("./src/app.py").unwrap(), PathBuf::from("src/app.py"));
        assert_eq!(safe_relative("pkg\\mod.py").unwrap(), PathBuf::from("pkg/mod.py"));
    }

    #[tokio::test]
    async fn writes_nested_files_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path(), false).await.unwrap();

        let full = ws.write_file("src/demo/__init__.py", "").await.unwrap();
        assert!(full.exists());
        assert!(full.starts_with(dir.path()));

        let err = ws.write_file("src/demo/__init__.py", "again").await.unwrap_err();
        assert!(matches!(err, GenerationError::Exists(_)));

        let err = ws.write_file("../escape.txt", "x").await.unwrap_err();
        assert!(matches!(err, GenerationError::UnsafePath(_)));
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn overwrite_when_forced() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path(), true).await.unwrap();
        ws.write_file("a.txt", "one").await.unwrap();
        ws.write_file("a.txt", "two").await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "two");
    }

    #[tokio::test]
    async fn lists_files_skipping_caches() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path(), false).await.unwrap();
        ws.write_file("b.txt", "b").await.unwrap();
        ws.write_file("a/c.py", "c").await.unwrap();
        ws.write_file(".venv/bin/python", "").await.unwrap();
        assert_eq!(ws.list_files().await, ["a/c.py", "b.txt"]);
    }

    #[test]
    fn snapshot_lists_sizes_and_excerpts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "# Demo\nhello").unwrap();
        let text = snapshot(dir.path(), 20, 6);
        assert!(text.contains("- README.md (12 bytes)"));
        assert!(text.contains("--- README.md ---\n# Demo"));
        assert!(!text.contains("hello"));

        let empty = tempfile::tempdir().unwrap();
        assert!(snapshot(empty.path(), 20, 100).contains("(no files detected)"));
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let err = run_command(
            "devopsys-no-such-tool",
            &["--version"],
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::NotFound));
    }

    #[test]
    fn combined_output_is_capped() {
        let out = CommandOutput {
            code: Some(1),
            stdout: "x".repeat(50),
            stderr: "boom".into(),
        };
        assert!(!out.success());
        let text = out.combined(10);
        assert!(text.ends_with("... (truncated)"));
    }
}
