//! Error types for research-crew.

use std::time::Duration;

use thiserror::Error;

use crate::providers::provider::ProviderError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue {0} already has an active consumer")]
    QueueBusy(String),

    #[error("Agent id '{0}' is already in use by a live agent")]
    DuplicateAgent(String),

    #[error("Invalid handler registration: {0}")]
    InvalidHandler(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("RPC call to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    #[error("Agent {0} is stopped")]
    AgentStopped(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

impl Error {
    /// True for RPC deadline expiry. The remote outcome is unknown in that case.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
