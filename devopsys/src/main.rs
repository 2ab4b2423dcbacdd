//! devopsys: plan a DevOps request, generate the artifacts, validate them.
//!
//!   devopsys ask "backup /etc nightly" --agent bash --out backup.sh
//!   devopsys project "fastapi todo service" --root ./todo --run
//!   devopsys check ./Dockerfile
//!   devopsys ollama pull codellama:7b-instruct
//!
//! Backend defaults to the offline dummy. Pass `--backend ollama`,
//! `--backend openai` (with OPENAI_API_KEY) or `--backend deepseek` (with
//! DEVOPSYS_DEEPSEEK_API_KEY) for real generations. The dummy cannot
//! design a file layout, so `project` needs one of the real backends.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use devopsys::config::{self, FileConfig, Overrides, Settings};
use devopsys::ollama::ModelAdmin;
use devopsys::orchestrator::{Orchestrator, Request};
use devopsys::output;
use devopsys::validate::{ValidationStatus, Validator};

#[derive(Parser)]
#[command(name = "devopsys", version, about = "Multi-agent DevOps assistant")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Completion backend: dummy, ollama, openai or deepseek
    #[arg(long, global = true, env = "DEVOPSYS_BACKEND")]
    backend: Option<String>,

    /// Default model for every role
    #[arg(long, global = true, env = "DEVOPSYS_MODEL")]
    model: Option<String>,

    /// Local daemon address
    #[arg(long, global = true, env = "DEVOPSYS_HOST")]
    host: Option<String>,

    /// Base URL of an OpenAI-compatible API
    #[arg(long, global = true, env = "DEVOPSYS_OPENAI_BASE_URL")]
    openai_base_url: Option<String>,

    /// API key for the OpenAI-compatible backend
    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// API key for the DeepSeek backend
    #[arg(long, global = true, env = "DEVOPSYS_DEEPSEEK_API_KEY", hide_env_values = true)]
    deepseek_api_key: Option<String>,

    /// Config file (default: ~/.config/devopsys/config.toml)
    #[arg(long, global = true, env = "DEVOPSYS_CONFIG")]
    config: Option<PathBuf>,

    /// Only use the builtin validation rules
    #[arg(long, global = true)]
    no_external_checks: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Plan a request and run every step
    Ask {
        /// What to build
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,

        /// Skip planning and use this agent
        #[arg(long)]
        agent: Option<String>,

        /// Target distribution for Linux steps (ubuntu, arch)
        #[arg(long)]
        os: Option<String>,

        /// Save the final artifact here
        #[arg(long)]
        out: Option<PathBuf>,

        /// Model used by the planner
        #[arg(long)]
        planner_model: Option<String>,

        /// Per-agent model, e.g. python=qwen2.5-coder:7b (repeatable)
        #[arg(long = "agent-model", value_name = "NAME=MODEL")]
        agent_models: Vec<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate a multi-file project under a root directory.
    ///
    /// The layout comes from the model, so this needs a real backend
    /// (ollama, openai or deepseek); the dummy backend always fails here.
    Project {
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,

        /// Directory the project is written into
        #[arg(long)]
        root: PathBuf,

        /// Provision a virtualenv and try the entrypoint
        #[arg(long)]
        run: bool,

        /// Replace files that already exist under the root
        #[arg(long)]
        force: bool,

        #[arg(long)]
        json: bool,
    },
    /// Validate an existing file
    Check {
        file: PathBuf,

        #[arg(long)]
        json: bool,
    },
    /// Manage models on the local Ollama daemon (uses --host)
    Ollama {
        #[command(subcommand)]
        action: OllamaAction,
    },
}

#[derive(Subcommand)]
enum OllamaAction {
    /// List installed models
    List {
        #[arg(long)]
        json: bool,
    },
    /// Download a model
    Pull { model: String },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "devopsys=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.global.log_json);

    let file_config = FileConfig::load(cli.global.config.as_deref()).context("loading config file")?;

    match cli.command {
        Command::Check { file, json } => {
            let validator = if cli.global.no_external_checks
                || file_config.external_checks == Some(false)
            {
                Validator::builtin_only()
            } else {
                Validator::new(true)
            };
            let result = validator.validate_file(&file).await;
            let mut stdout = io::stdout().lock();
            if json {
                serde_json::to_writer_pretty(&mut stdout, &result)?;
                writeln!(stdout)?;
            } else {
                writeln!(stdout, "{}: {} ({})", result.path, result.status, result.checker)?;
                for diag in &result.diagnostics {
                    writeln!(stdout, "  {diag}")?;
                }
            }
            Ok(if result.status == ValidationStatus::Fail {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Command::Ollama { action } => {
            let host = config::daemon_host(&overrides(&cli.global, None, Vec::new()), &file_config);
            ollama(&ModelAdmin::new(&host), action).await
        }
        Command::Ask {
            task,
            agent,
            os,
            out,
            planner_model,
            agent_models,
            json,
        } => {
            let overrides = overrides(&cli.global, planner_model, agent_models);
            let mut request = Request::new(task.join(" "));
            request.agent = agent;
            request.os = os;
            request.output_path = out;
            run(overrides, &file_config, &request, json).await
        }
        Command::Project {
            task,
            root,
            run: run_project,
            force,
            json,
        } => {
            let overrides = overrides(&cli.global, None, Vec::new());
            let mut request = Request::new(task.join(" ")).with_project_root(root);
            request.overwrite = force;
            request.run_project = run_project;
            run(overrides, &file_config, &request, json).await
        }
    }
}

fn overrides(global: &GlobalArgs, planner_model: Option<String>, agent_models: Vec<String>) -> Overrides {
    Overrides {
        backend: global.backend.clone(),
        model: global.model.clone(),
        host: global.host.clone(),
        openai_base_url: global.openai_base_url.clone(),
        openai_api_key: global.openai_api_key.clone(),
        deepseek_api_key: global.deepseek_api_key.clone(),
        planner_model,
        agent_models,
        no_external_checks: global.no_external_checks,
    }
}

async fn ollama(admin: &ModelAdmin, action: OllamaAction) -> Result<ExitCode> {
    match action {
        OllamaAction::List { json } => {
            let models = admin
                .list_models()
                .await
                .with_context(|| format!("listing models on {}", admin.host()))?;
            let mut stdout = io::stdout().lock();
            if json {
                serde_json::to_writer_pretty(&mut stdout, &models)?;
                writeln!(stdout)?;
            } else if models.is_empty() {
                writeln!(stdout, "No models found on {}.", admin.host())?;
            } else {
                writeln!(stdout, "Models on {}", admin.host())?;
                for model in &models {
                    writeln!(stdout, "- {}", model.describe())?;
                }
            }
        }
        OllamaAction::Pull { model } => {
            admin
                .pull_model(&model, |event| {
                    let _ = output::status(&mut io::stderr().lock(), "Ollama", "⬇️", &event.describe());
                })
                .await
                .with_context(|| format!("pulling {model}"))?;
            println!("Model ready: {model}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run(overrides: Overrides, file_config: &FileConfig, request: &Request, json: bool) -> Result<ExitCode> {
    let settings = Settings::resolve(&overrides, file_config).context("resolving settings")?;
    tracing::info!(
        backend = settings.backend.name(),
        model = %settings.model,
        "Starting devopsys"
    );

    let cwd = std::env::current_dir().context("reading current directory")?;
    let orchestrator = Orchestrator::new(settings)
        .with_snapshot_root(cwd)
        .with_observer(Box::new(|event| {
            let _ = output::progress(&mut io::stderr().lock(), event);
        }));

    let report = match orchestrator.run(request).await {
        Ok(report) => report,
        Err(e) => {
            if let Some(raw) = e.raw_response() {
                eprintln!("Raw planner response:\n{raw}");
            }
            return Err(e).context("planning failed");
        }
    };

    let mut stdout = io::stdout().lock();
    if json {
        output::render_json(&mut stdout, &report)?;
    } else {
        output::render_report(&mut stdout, &report)?;
    }
    Ok(if report.overall_success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
