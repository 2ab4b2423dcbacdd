//! devopsys: a multi-agent DevOps assistant.
//!
//! A request is planned into ordered subtasks, each handed to a
//! capability-specific agent (bash, python, docker, linux, rust, universal)
//! backed by a completion backend:
//! - Dummy: deterministic offline output
//! - Local daemon: Ollama-style `/api/generate`
//! - OpenAI-compatible: `/chat/completions` (OpenAI, DeepSeek)
//!
//! Every artifact is validated before it is reported. Project mode asks an
//! architect for a file layout and materializes it under a root directory.

pub mod agents;
pub mod config;
pub mod error;
pub mod llm;
pub mod ollama;
pub mod orchestrator;
pub mod output;
pub mod plan;
pub mod project;
pub mod router;
pub mod validate;
pub mod workspace;

pub use orchestrator::{Orchestrator, Report, Request};
