//! Answer validator: asks the model to grade and optionally correct an answer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{extract_json_object, CrewDeps};
use crate::agent::{typed, Agent};
use crate::error::Result;
use crate::protocol::kinds;

const SYSTEM_PROMPT: &str = "You review answers to research questions against their sources. \
Reply with a single JSON object and nothing else: \
{\"is_valid\": bool, \"scores\": {\"accuracy\": 0-1, \"completeness\": 0-1, \"relevance\": 0-1}, \
\"corrected_answer\": string, \"feedback\": string}. \
Keep corrected_answer identical to the answer when no correction is needed.";

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateAnswerRequest {
    pub query: String,
    pub answer: String,
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    #[serde(default = "accepted")]
    pub is_valid: bool,
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub corrected_answer: Option<String>,
    #[serde(default)]
    pub feedback: String,
}

fn accepted() -> bool {
    true
}

impl ValidationResult {
    /// Accept `answer` unchanged.
    pub fn accept(answer: &str, feedback: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            scores: BTreeMap::new(),
            corrected_answer: Some(answer.to_string()),
            feedback: feedback.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidateAnswerResult {
    pub status: String,
    pub validation_result: ValidationResult,
}

pub fn register(agent: &Agent, deps: &CrewDeps) -> Result<()> {
    let deps = deps.clone();
    agent.register_handler(
        kinds::VALIDATE_ANSWER,
        typed(move |_ctx, request: ValidateAnswerRequest| {
            let deps = deps.clone();
            async move { validate(&deps, request).await }
        }),
    )
}

async fn validate(deps: &CrewDeps, request: ValidateAnswerRequest) -> anyhow::Result<ValidateAnswerResult> {
    let prompt = format!(
        "Question: {}\n\nAnswer:\n{}\n\nSources:\n{}",
        request.query,
        request.answer,
        serde_json::to_string_pretty(&request.context)?
    );

    let validation_result = match deps.complete(SYSTEM_PROMPT, prompt).await {
        Ok(reply) => parse_verdict(&reply, &request.answer),
        Err(e) => {
            tracing::warn!("Validation skipped for '{}': {}", request.query, e);
            ValidationResult::accept(&request.answer, format!("validation unavailable: {}", e))
        }
    };

    Ok(ValidateAnswerResult {
        status: "success".to_string(),
        validation_result,
    })
}

/// Parse a verdict, accepting `answer` unchanged when the reply is not usable.
pub fn parse_verdict(reply: &str, answer: &str) -> ValidationResult {
    let Some(mut verdict) = extract_json_object::<ValidationResult>(reply) else {
        tracing::debug!("Unparsable validator reply, accepting answer");
        return ValidationResult::accept(answer, "validator reply was not JSON");
    };

    if verdict
        .corrected_answer
        .as_deref()
        .map_or(true, |c| c.trim().is_empty())
    {
        verdict.corrected_answer = Some(answer.to_string());
    }
    verdict
}
