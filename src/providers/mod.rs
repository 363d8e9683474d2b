//! LLM providers.

use std::sync::Arc;

pub mod contract;
pub mod ollama;
pub mod openai_compat;
pub mod provider;

pub use contract::{generate_with_contract, ExecutionContract, ExecutionError, FailureCode};
pub use provider::{GenerateRequest, Provider, ProviderError, Result};

use crate::config::{LlmConfig, LlmProviderKind};

/// Provider factory.
pub fn create_provider(config: &LlmConfig) -> Arc<dyn Provider> {
    match config.provider {
        LlmProviderKind::Ollama => {
            let mut provider = match &config.base_url {
                Some(url) => ollama::OllamaProvider::with_base_url(url.clone()),
                None => ollama::OllamaProvider::new(),
            };
            if let Some(model) = &config.model {
                provider = provider.model(model.clone());
            }
            Arc::new(provider)
        }
        LlmProviderKind::Groq | LlmProviderKind::Openrouter => {
            let api_key = config.resolve_api_key();
            let mut provider = match (config.provider, &config.base_url) {
                (kind, Some(url)) => openai_compat::OpenAiCompatProvider::new(
                    kind.to_string(),
                    url.clone(),
                    default_hosted_model(kind),
                    api_key,
                ),
                (LlmProviderKind::Groq, None) => openai_compat::OpenAiCompatProvider::groq(api_key),
                (_, None) => openai_compat::OpenAiCompatProvider::openrouter(api_key),
            };
            if let Some(model) = &config.model {
                provider = provider.model(model.clone());
            }
            Arc::new(provider)
        }
    }
}

fn default_hosted_model(kind: LlmProviderKind) -> &'static str {
    match kind {
        LlmProviderKind::Openrouter => openai_compat::OPENROUTER_DEFAULT_MODEL,
        _ => openai_compat::GROQ_DEFAULT_MODEL,
    }
}

/// A request pre-filled with the configured sampling parameters.
pub fn request_from_config(config: &LlmConfig, prompt: impl Into<String>) -> GenerateRequest {
    GenerateRequest::new(prompt)
        .with_temperature(config.temperature)
        .with_max_tokens(config.max_tokens)
}
