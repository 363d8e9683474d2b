//! Pipeline stages and structured outcomes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::protocol::Reply;

/// Pipeline stage, named in error results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Mining,
    KnowledgeGraph,
    Answering,
    Validation,
    Report,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Mining => "mining",
            Stage::KnowledgeGraph => "knowledge_graph",
            Stage::Answering => "answering",
            Stage::Validation => "validation",
            Stage::Report => "report",
        }
    }

    fn failure_message(&self) -> &'static str {
        match self {
            Stage::Mining => "Data mining failed",
            Stage::KnowledgeGraph => "Knowledge graph creation failed",
            Stage::Answering => "Failed to get an answer",
            Stage::Validation => "Failed to validate answer",
            Stage::Report => "Report generation failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage that did not succeed.
#[derive(Debug, Clone, PartialEq)]
pub struct StageError {
    pub stage: Stage,
    pub error: String,
    pub details: Option<Value>,
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} stage)", self.error, self.stage)
    }
}

impl std::error::Error for StageError {}

impl StageError {
    /// The call itself failed: timeout, transport, or malformed reply.
    pub fn from_error(stage: Stage, err: &Error) -> Self {
        Self {
            stage,
            error: format!("{}: {}", stage.failure_message(), err),
            details: None,
        }
    }

    /// The agent answered, but not with success.
    pub fn from_reply(stage: Stage, reply: &Reply) -> Self {
        Self {
            stage,
            error: stage.failure_message().to_string(),
            details: Some(reply.to_value()),
        }
    }
}

/// Accept a stage reply only when both the envelope status and any `status`
/// carried inside `data` say success. Returns the reply data.
pub fn check_stage(stage: Stage, outcome: crate::error::Result<Reply>) -> Result<Value, StageError> {
    let reply = outcome.map_err(|e| StageError::from_error(stage, &e))?;

    if !reply.is_success() {
        return Err(StageError::from_reply(stage, &reply));
    }
    if let Some(inner) = reply.field("status") {
        if inner.as_str() != Some("success") {
            return Err(StageError::from_reply(stage, &reply));
        }
    }

    Ok(reply.data.unwrap_or(Value::Null))
}

/// One answered (or placeholder) sub-query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub query: String,
    pub answer: String,
    #[serde(default)]
    pub validation: Value,
}

/// Final outcome of a research pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineResult {
    Success {
        /// Seconds
        execution_time: f64,
        research_query: String,
        sub_queries: Vec<String>,
        answers: Vec<String>,
        report_path: String,
    },
    Error {
        stage: Stage,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineResult::Success { .. })
    }
}

impl From<StageError> for PipelineResult {
    fn from(err: StageError) -> Self {
        PipelineResult::Error {
            stage: err.stage,
            error: err.error,
            details: err.details,
        }
    }
}
