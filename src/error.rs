//! ==============================================================================
//! error.rs - typed errors for the agent library
//! ==============================================================================
//!
//! none of these are fatal to the process. the orchestrator logs them and
//! degrades (skip the sink, keep accumulating). only main.rs turns them into
//! anyhow errors, and only during startup.
//!
//! ==============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("realtime database error: {0}")]
    Realtime(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        AgentError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
