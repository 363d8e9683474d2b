//! Execution contracts for LLM calls: timeout, retries, and failure codes.

use std::time::Duration;

use super::provider::{GenerateRequest, Provider};
use crate::config::LlmConfig;

#[derive(Debug, Clone)]
pub struct ExecutionContract {
    pub timeout_seconds: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ExecutionContract {
    fn default() -> Self {
        Self {
            timeout_seconds: 120,
            retries: 1,
            retry_backoff_ms: 500,
        }
    }
}

impl ExecutionContract {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            timeout_seconds: config.timeout_secs,
            retries: config.retries,
            retry_backoff_ms: config.backoff_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCode {
    Timeout,
    Unauthorized,
    ProviderUnavailable,
    Unknown,
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCode::Timeout => write!(f, "timeout"),
            FailureCode::Unauthorized => write!(f, "unauthorized"),
            FailureCode::ProviderUnavailable => write!(f, "provider_unavailable"),
            FailureCode::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionError {
    pub code: FailureCode,
    pub message: String,
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ExecutionError {}

/// Run `generate` under the contract's timeout, retrying on any failure.
pub async fn generate_with_contract(
    provider: &dyn Provider,
    request: &GenerateRequest,
    contract: &ExecutionContract,
) -> Result<String, ExecutionError> {
    let attempts = contract.retries + 1;
    let timeout = Duration::from_secs(contract.timeout_seconds);
    let mut last_error: Option<ExecutionError> = None;

    for attempt in 1..=attempts {
        match tokio::time::timeout(timeout, provider.generate(request)).await {
            Ok(Ok(text)) => return Ok(text),
            Ok(Err(e)) => {
                let err = classify_error(&e.to_string());
                tracing::warn!(
                    "{} attempt {}/{} failed: {}",
                    provider.name(),
                    attempt,
                    attempts,
                    err
                );
                last_error = Some(err);
            }
            Err(_) => {
                tracing::warn!("{} attempt {}/{} timed out", provider.name(), attempt, attempts);
                last_error = Some(ExecutionError {
                    code: FailureCode::Timeout,
                    message: format!(
                        "generation exceeded timeout of {}s",
                        contract.timeout_seconds
                    ),
                });
            }
        }

        if attempt < attempts {
            tokio::time::sleep(Duration::from_millis(contract.retry_backoff_ms)).await;
        }
    }

    Err(last_error.unwrap_or(ExecutionError {
        code: FailureCode::Unknown,
        message: "generation failed for unknown reason".to_string(),
    }))
}

fn classify_error(message: &str) -> ExecutionError {
    let m = message.to_lowercase();
    let code = if m.contains("unauthorized")
        || m.contains("401")
        || m.contains("403")
        || m.contains("forbidden")
    {
        FailureCode::Unauthorized
    } else if m.contains("not available")
        || m.contains("connection")
        || m.contains("timeout")
        || m.contains("timed out")
        || m.contains("error sending request")
    {
        FailureCode::ProviderUnavailable
    } else {
        FailureCode::Unknown
    };

    ExecutionError {
        code,
        message: message.to_string(),
    }
}
