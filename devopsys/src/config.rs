//! Configuration.
//!
//! Config file lives at `~/.config/devopsys/config.toml` unless `--config`
//! points elsewhere. Values merge as CLI/env > config file > defaults; clap
//! already folds `DEVOPSYS_*` variables into the CLI layer. The resolved
//! [`Settings`] is handed to the orchestrator and is the only place backend
//! connection details live.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::Capability;
use crate::error::ConfigError;
use crate::llm::{BackendFactory, BackendSpec, BoundBackend, GenerationOptions};

pub const DEFAULT_MODEL: &str = "codellama:7b-instruct";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_HOST: &str = "http://127.0.0.1:11434";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_DEEPSEEK_MODEL: &str = "deepseek-coder";
pub const DEFAULT_DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";
const LOCAL_TIMEOUT_SECS: u64 = 300;
const OPENAI_TIMEOUT_SECS: u64 = 120;

/// Role name the planner binds its backend under.
pub const PLANNER_ROLE: &str = "planner";

/// Contents of the config file. Everything is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    /// `dummy`, `ollama`, `openai` or `deepseek`.
    pub backend: Option<String>,
    pub model: Option<String>,
    pub host: Option<String>,
    pub openai_base_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_system_prompt: Option<String>,
    pub deepseek_base_url: Option<String>,
    pub deepseek_api_key: Option<String>,
    /// Falls back to `openai_system_prompt`.
    pub deepseek_system_prompt: Option<String>,
    pub planner_model: Option<String>,
    /// Per-capability model, e.g. `python = "qwen2.5-coder:7b"`.
    pub agent_models: BTreeMap<String, String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub external_checks: Option<bool>,
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devopsys")
        .join("config.toml")
}

impl FileConfig {
    /// Load `path`, or the default location when `None`. A missing default
    /// file yields an empty config; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (default_config_path(), false),
        };
        if !explicit && !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config =
            toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
        tracing::debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }
}

/// Values given on the command line (or through the environment).
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backend: Option<String>,
    pub model: Option<String>,
    pub host: Option<String>,
    pub openai_base_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub deepseek_api_key: Option<String>,
    pub planner_model: Option<String>,
    /// Raw `name=model` pairs.
    pub agent_models: Vec<String>,
    pub no_external_checks: bool,
}

/// Fully resolved backend configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: BackendSpec,
    pub model: String,
    pub planner_model: Option<String>,
    pub agent_models: BTreeMap<String, String>,
    pub options: GenerationOptions,
    pub external_checks: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendSpec::Dummy,
            model: DEFAULT_MODEL.to_string(),
            planner_model: None,
            agent_models: BTreeMap::new(),
            options: GenerationOptions::default(),
            external_checks: true,
        }
    }
}

/// Parse `name=model`; the name must be a capability or `planner`.
pub fn parse_agent_model(pair: &str) -> Result<(String, String), ConfigError> {
    let bad = || ConfigError::AgentModel(pair.to_string());
    let (name, model) = pair.split_once('=').ok_or_else(bad)?;
    let (name, model) = (name.trim(), model.trim());
    if name.is_empty() || model.is_empty() {
        return Err(bad());
    }
    normalize_role(name)
        .map(|role| (role, model.to_string()))
        .ok_or_else(bad)
}

fn normalize_role(name: &str) -> Option<String> {
    if name.eq_ignore_ascii_case(PLANNER_ROLE) {
        return Some(PLANNER_ROLE.to_string());
    }
    name.parse::<Capability>().ok().map(|c| c.tag().to_string())
}

/// Local daemon address: `--host`, then the file, then the default.
pub fn daemon_host(cli: &Overrides, file: &FileConfig) -> String {
    cli.host
        .clone()
        .or_else(|| file.host.clone())
        .unwrap_or_else(|| DEFAULT_HOST.to_string())
}

impl Settings {
    /// Merge CLI/env over file over defaults.
    pub fn resolve(cli: &Overrides, file: &FileConfig) -> Result<Self, ConfigError> {
        let backend_name = cli
            .backend
            .clone()
            .or_else(|| file.backend.clone())
            .unwrap_or_else(|| "dummy".to_string())
            .to_lowercase();

        let is_openai = matches!(backend_name.as_str(), "openai" | "openai-compatible" | "deepseek");
        let backend = match backend_name.as_str() {
            "dummy" => BackendSpec::Dummy,
            "ollama" | "local" => BackendSpec::LocalDaemon {
                host: daemon_host(cli, file),
            },
            "openai" | "openai-compatible" => BackendSpec::OpenAiCompatible {
                base_url: cli
                    .openai_base_url
                    .clone()
                    .or_else(|| file.openai_base_url.clone())
                    .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
                api_key: cli
                    .openai_api_key
                    .clone()
                    .or_else(|| file.openai_api_key.clone())
                    .filter(|k| !k.trim().is_empty())
                    .ok_or(ConfigError::MissingApiKey {
                        backend: "openai",
                        hint: "--openai-api-key or OPENAI_API_KEY",
                    })?,
                system_prompt: file.openai_system_prompt.clone(),
            },
            // DeepSeek speaks the OpenAI chat protocol on its own endpoint.
            "deepseek" => BackendSpec::OpenAiCompatible {
                base_url: file
                    .deepseek_base_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DEEPSEEK_BASE_URL.to_string()),
                api_key: cli
                    .deepseek_api_key
                    .clone()
                    .or_else(|| file.deepseek_api_key.clone())
                    .filter(|k| !k.trim().is_empty())
                    .ok_or(ConfigError::MissingApiKey {
                        backend: "deepseek",
                        hint: "--deepseek-api-key or DEVOPSYS_DEEPSEEK_API_KEY",
                    })?,
                system_prompt: file
                    .deepseek_system_prompt
                    .clone()
                    .or_else(|| file.openai_system_prompt.clone()),
            },
            other => return Err(ConfigError::UnknownBackend(other.to_string())),
        };

        let default_model = match backend_name.as_str() {
            "deepseek" => DEFAULT_DEEPSEEK_MODEL,
            _ if is_openai => DEFAULT_OPENAI_MODEL,
            _ => DEFAULT_MODEL,
        };
        let model = cli
            .model
            .clone()
            .or_else(|| file.model.clone())
            .unwrap_or_else(|| default_model.to_string());

        let mut agent_models = BTreeMap::new();
        for (name, model) in &file.agent_models {
            let (role, model) = parse_agent_model(&format!("{name}={model}"))?;
            agent_models.insert(role, model);
        }
        for pair in &cli.agent_models {
            let (role, model) = parse_agent_model(pair)?;
            agent_models.insert(role, model);
        }

        let planner_model = cli
            .planner_model
            .clone()
            .or_else(|| file.planner_model.clone())
            .or_else(|| agent_models.remove(PLANNER_ROLE));

        let defaults = GenerationOptions::default();
        let timeout_secs = file.timeout_secs.unwrap_or(if is_openai {
            OPENAI_TIMEOUT_SECS
        } else {
            LOCAL_TIMEOUT_SECS
        });
        let options = GenerationOptions {
            temperature: file.temperature.unwrap_or(defaults.temperature),
            max_tokens: file.max_tokens.unwrap_or(defaults.max_tokens),
            timeout: Duration::from_secs(timeout_secs),
        };

        Ok(Self {
            backend,
            model,
            planner_model,
            agent_models,
            options,
            external_checks: !cli.no_external_checks && file.external_checks.unwrap_or(true),
        })
    }

    /// Model id for a role: planner override, per-capability override, else the default.
    pub fn model_for(&self, role: &str) -> &str {
        if role == PLANNER_ROLE
            && let Some(model) = &self.planner_model
        {
            return model;
        }
        self.agent_models
            .get(role)
            .map(String::as_str)
            .unwrap_or(&self.model)
    }
}

impl BackendFactory for Settings {
    fn bind(&self, role: &str) -> BoundBackend {
        BoundBackend::new(self.backend.build(&self.options), self.model_for(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_dummy() {
        let settings = Settings::resolve(&Overrides::default(), &FileConfig::default()).unwrap();
        assert_eq!(settings.backend, BackendSpec::Dummy);
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert!(settings.external_checks);
        assert_eq!(settings.options.timeout, Duration::from_secs(300));
    }

    #[test]
    fn cli_beats_file() {
        let file = FileConfig {
            backend: Some("ollama".into()),
            host: Some("http://gpu-box:11434".into()),
            model: Some("llama3".into()),
            ..Default::default()
        };
        let cli = Overrides {
            model: Some("qwen2.5-coder:7b".into()),
            ..Default::default()
        };
        let settings = Settings::resolve(&cli, &file).unwrap();
        assert_eq!(
            settings.backend,
            BackendSpec::LocalDaemon {
                host: "http://gpu-box:11434".into()
            }
        );
        assert_eq!(settings.model, "qwen2.5-coder:7b");
    }

    #[test]
    fn openai_requires_a_key() {
        let cli = Overrides {
            backend: Some("openai".into()),
            ..Default::default()
        };
        let err = Settings::resolve(&cli, &FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingApiKey { backend: "openai", .. }));

        let cli = Overrides {
            openai_api_key: Some("sk-test".into()),
            ..cli
        };
        let settings = Settings::resolve(&cli, &FileConfig::default()).unwrap();
        assert_eq!(settings.model, DEFAULT_OPENAI_MODEL);
        assert_eq!(settings.options.timeout, Duration::from_secs(120));
    }

    #[test]
    fn deepseek_preset() {
        let cli = Overrides {
            backend: Some("deepseek".into()),
            openai_api_key: Some("sk-openai".into()),
            ..Default::default()
        };
        let err = Settings::resolve(&cli, &FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("DEVOPSYS_DEEPSEEK_API_KEY"));

        let file = FileConfig {
            deepseek_api_key: Some("ds-key".into()),
            openai_system_prompt: Some("be terse".into()),
            ..Default::default()
        };
        let settings = Settings::resolve(&cli, &file).unwrap();
        assert_eq!(
            settings.backend,
            BackendSpec::OpenAiCompatible {
                base_url: DEFAULT_DEEPSEEK_BASE_URL.into(),
                api_key: "ds-key".into(),
                system_prompt: Some("be terse".into()),
            }
        );
        assert_eq!(settings.model, DEFAULT_DEEPSEEK_MODEL);
        assert_eq!(settings.options.timeout, Duration::from_secs(120));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let cli = Overrides {
            backend: Some("claude".into()),
            ..Default::default()
        };
        assert!(matches!(
            Settings::resolve(&cli, &FileConfig::default()),
            Err(ConfigError::UnknownBackend(_))
        ));
    }

    #[test]
    fn per_role_models() {
        let cli = Overrides {
            planner_model: Some("big".into()),
            agent_models: vec!["py=coder".into(), "Docker = tiny".into()],
            ..Default::default()
        };
        let settings = Settings::resolve(&cli, &FileConfig::default()).unwrap();
        assert_eq!(settings.model_for(PLANNER_ROLE), "big");
        assert_eq!(settings.model_for("python"), "coder");
        assert_eq!(settings.model_for("docker"), "tiny");
        assert_eq!(settings.model_for("bash"), DEFAULT_MODEL);
        assert_eq!(settings.bind("python").model(), "coder");
    }

    #[test]
    fn bad_agent_model_pairs() {
        assert!(parse_agent_model("python").is_err());
        assert!(parse_agent_model("wizard=gpt").is_err());
        assert!(parse_agent_model("bash=").is_err());
        assert_eq!(
            parse_agent_model("planner=m").unwrap(),
            ("planner".to_string(), "m".to_string())
        );
    }

    #[test]
    fn loads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "backend = \"ollama\"\nexternal_checks = false\n\n[agent_models]\nbash = \"small\"\n",
        )
        .unwrap();
        let file = FileConfig::load(Some(&path)).unwrap();
        assert_eq!(file.backend.as_deref(), Some("ollama"));
        let settings = Settings::resolve(&Overrides::default(), &file).unwrap();
        assert!(!settings.external_checks);
        assert_eq!(settings.model_for("bash"), "small");

        assert!(FileConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
