//! Model management on a local Ollama daemon.
//!
//! `list` reads `/api/tags`; `pull` posts to `/api/pull` and reports each
//! newline-delimited progress object as it arrives.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::error::BackendError;

const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// One installed model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
    pub parameter_size: Option<String>,
    pub families: Vec<String>,
    pub modified_at: Option<String>,
}

impl ModelInfo {
    /// `name (7B, llama) [3.8 GB]`
    pub fn describe(&self) -> String {
        let mut meta = Vec::new();
        if let Some(params) = &self.parameter_size {
            meta.push(params.clone());
        }
        if !self.families.is_empty() {
            meta.push(self.families.join("/"));
        }
        let meta = if meta.is_empty() {
            String::new()
        } else {
            format!(" ({})", meta.join(", "))
        };
        format!("{}{meta} [{}]", self.name, format_size(self.size))
    }
}

/// Human-readable byte count; whole bytes below 1 KB, one decimal above.
pub fn format_size(bytes: Option<u64>) -> String {
    let Some(bytes) = bytes.filter(|b| *b > 0) else {
        return "?".to_string();
    };
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut size = bytes as f64;
    for unit in ["KB", "MB", "GB"] {
        size /= 1024.0;
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
    }
    format!("{:.1} TB", size / 1024.0)
}

/// Progress line from a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullEvent {
    pub status: String,
    pub digest: Option<String>,
    pub completed: Option<u64>,
    pub total: Option<u64>,
}

impl PullEvent {
    pub fn describe(&self) -> String {
        let mut parts = vec![self.status.clone()];
        if let Some(digest) = &self.digest {
            parts.push(digest.clone());
        }
        if let (Some(done), Some(total)) = (self.completed, self.total.filter(|t| *t > 0)) {
            parts.push(format!("{done}/{total}"));
        }
        parts.join(" · ")
    }
}

fn opt_str(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Models listed in a `/api/tags` reply. Entries of the wrong shape are skipped.
pub fn parse_tags(payload: &Value) -> Vec<ModelInfo> {
    let Some(items) = payload.get("models").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_object)
        .map(|item| {
            let details = item.get("details").and_then(Value::as_object);
            let families = match details.and_then(|d| d.get("families")) {
                Some(Value::Array(list)) => list
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => details
                    .and_then(|d| opt_str(d, "family"))
                    .into_iter()
                    .collect(),
            };
            ModelInfo {
                name: opt_str(item, "name").unwrap_or_default(),
                size: item.get("size").and_then(Value::as_u64),
                digest: opt_str(item, "digest"),
                parameter_size: details.and_then(|d| opt_str(d, "parameter_size")),
                families,
                modified_at: opt_str(item, "modified_at"),
            }
        })
        .collect()
}

/// One line of a pull stream. Blank, unparsable and status-less lines
/// give `None`; an `error` field ends the pull.
pub fn parse_pull_line(line: &str) -> Option<Result<PullEvent, BackendError>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object()?;
    if let Some(error) = opt_str(obj, "error") {
        return Some(Err(BackendError::Remote(error)));
    }
    let status = opt_str(obj, "status").filter(|s| !s.is_empty())?;
    Some(Ok(PullEvent {
        status,
        digest: opt_str(obj, "digest"),
        completed: obj.get("completed").and_then(Value::as_u64),
        total: obj.get("total").and_then(Value::as_u64),
    }))
}

/// Client for the daemon's model endpoints.
pub struct ModelAdmin {
    host: String,
    http: reqwest::Client,
}

impl ModelAdmin {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(BackendError::Status {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, BackendError> {
        let resp = self
            .http
            .get(format!("{}/api/tags", self.host))
            .timeout(LIST_TIMEOUT)
            .send()
            .await?;
        let payload: Value = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(parse_tags(&payload))
    }

    /// Pull `model`, calling `on_event` for every progress line.
    pub async fn pull_model(
        &self,
        model: &str,
        mut on_event: impl FnMut(&PullEvent),
    ) -> Result<(), BackendError> {
        tracing::info!(model, host = %self.host, "Pulling model");
        let resp = self
            .http
            .post(format!("{}/api/pull", self.host))
            .timeout(PULL_TIMEOUT)
            .json(&serde_json::json!({ "name": model, "stream": true }))
            .send()
            .await?;
        let mut resp = Self::check(resp).await?;

        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            buf.extend_from_slice(&chunk);
            while let Some(end) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=end).collect();
                if let Some(event) = parse_pull_line(&String::from_utf8_lossy(&line)) {
                    on_event(&event?);
                }
            }
        }
        if let Some(event) = parse_pull_line(&String::from_utf8_lossy(&buf)) {
            on_event(&event?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer one HTTP request with `status` and `body`, then close.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request).to_lowercase();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let reply = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn sizes() {
        assert_eq!(format_size(None), "?");
        assert_eq!(format_size(Some(0)), "?");
        assert_eq!(format_size(Some(512)), "512 B");
        assert_eq!(format_size(Some(2048)), "2.0 KB");
        assert_eq!(format_size(Some(3_825_819_519)), "3.6 GB");
    }

    #[test]
    fn tags_tolerate_odd_entries() {
        let payload = serde_json::json!({"models": [
            {"name": "llama3:8b", "size": 4_661_224_676u64, "details": {"parameter_size": "8.0B", "family": "llama"}},
            {"name": "qwen", "details": {"families": ["qwen2", "clip"]}},
            "garbage",
        ]});
        let models = parse_tags(&payload);
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].describe(), "llama3:8b (8.0B, llama) [4.3 GB]");
        assert_eq!(models[1].describe(), "qwen (qwen2/clip) [?]");
        assert!(parse_tags(&serde_json::json!(["nope"])).is_empty());
    }

    #[test]
    fn pull_lines() {
        assert!(parse_pull_line("").is_none());
        assert!(parse_pull_line("not json").is_none());
        assert!(parse_pull_line(r#"{"digest": "x"}"#).is_none());

        let event = parse_pull_line(r#"{"status": "pulling", "digest": "sha256:ab", "completed": 5, "total": 10}"#)
            .unwrap()
            .unwrap();
        assert_eq!(event.describe(), "pulling · sha256:ab · 5/10");

        let err = parse_pull_line(r#"{"error": "pull model manifest: file does not exist"}"#)
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BackendError::Remote(_)));
    }

    #[tokio::test]
    async fn lists_models_from_daemon() {
        let host = serve_once("200 OK", r#"{"models": [{"name": "codellama:7b-instruct", "size": 1024}]}"#).await;
        let models = ModelAdmin::new(&host).list_models().await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "codellama:7b-instruct");
        assert_eq!(models[0].size, Some(1024));
    }

    #[tokio::test]
    async fn pull_reports_each_line() {
        let host = serve_once(
            "200 OK",
            "{\"status\": \"pulling manifest\"}\n\n{\"status\": \"downloading\", \"completed\": 1, \"total\": 2}\n{\"status\": \"success\"}",
        )
        .await;
        let mut seen = Vec::new();
        ModelAdmin::new(&host)
            .pull_model("llama3", |e| seen.push(e.status.clone()))
            .await
            .unwrap();
        assert_eq!(seen, ["pulling manifest", "downloading", "success"]);
    }

    #[tokio::test]
    async fn pull_surfaces_daemon_errors() {
        let host = serve_once("200 OK", "{\"status\": \"pulling manifest\"}\n{\"error\": \"model not found\"}\n").await;
        let err = ModelAdmin::new(&host).pull_model("nope", |_| {}).await.unwrap_err();
        assert_eq!(err.to_string(), "backend reported an error: model not found");

        let host = serve_once("404 Not Found", r#"{"error": "missing"}"#).await;
        let err = ModelAdmin::new(&host).list_models().await.unwrap_err();
        assert_eq!(err.status(), Some(404));
    }
}
