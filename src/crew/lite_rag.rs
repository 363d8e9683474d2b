//! Retrieval-augmented answerer over the content store.

use serde::{Deserialize, Serialize};

use super::CrewDeps;
use crate::agent::{typed, Agent};
use crate::error::Result;
use crate::protocol::kinds;

/// Documents retrieved per question.
pub const TOP_K: usize = 5;

const SNIPPET_CHARS: usize = 1500;

const SYSTEM_PROMPT: &str = "You answer research questions using only the numbered sources provided. \
Cite sources as [n]. If the sources do not contain the answer, say so plainly.";

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerQueryRequest {
    pub query: String,
}

/// A retrieved passage handed to the model and passed on to the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerQueryResult {
    pub answer: String,
    pub context: Vec<ContextEntry>,
}

pub fn register(agent: &Agent, deps: &CrewDeps) -> Result<()> {
    let deps = deps.clone();
    agent.register_handler(
        kinds::ANSWER_QUERY,
        typed(move |_ctx, request: AnswerQueryRequest| {
            let deps = deps.clone();
            async move { answer(&deps, &request.query).await }
        }),
    )
}

async fn answer(deps: &CrewDeps, query: &str) -> anyhow::Result<AnswerQueryResult> {
    let context: Vec<ContextEntry> = deps
        .store
        .search(query, TOP_K)?
        .into_iter()
        .map(|item| ContextEntry {
            title: item.title,
            url: item.url,
            snippet: item.body.chars().take(SNIPPET_CHARS).collect(),
        })
        .collect();

    tracing::debug!("Retrieved {} passages for: {}", context.len(), query);

    let answer = deps.complete(SYSTEM_PROMPT, prompt(query, &context)).await?;
    Ok(AnswerQueryResult {
        answer: answer.trim().to_string(),
        context,
    })
}

fn prompt(query: &str, context: &[ContextEntry]) -> String {
    let mut prompt = String::new();
    if context.is_empty() {
        prompt.push_str("No sources were found.\n");
    }
    for (i, entry) in context.iter().enumerate() {
        prompt.push_str(&format!("[{}] {} ({})\n{}\n\n", i + 1, entry.title, entry.url, entry.snippet));
    }
    prompt.push_str(&format!("\nQuestion: {}\nAnswer:", query));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crew::testing;

    #[test]
    fn test_prompt_numbers_sources() {
        let context = vec![ContextEntry {
            title: "Rust".into(),
            url: "https://a".into(),
            snippet: "Ownership".into(),
        }];
        let prompt = prompt("What is ownership?", &context);
        assert!(prompt.starts_with("[1] Rust (https://a)\nOwnership"));
        assert!(prompt.ends_with("Question: What is ownership?\nAnswer:"));
        assert!(super::prompt("q", &[]).starts_with("No sources were found."));
    }

    #[tokio::test]
    async fn test_answer_carries_context() {
        let (_dir, deps) = testing::deps(&["  Ownership moves values [1].  "]);
        deps.store
            .insert_content("https://a", "rust", "Ownership", "Ownership moves values between bindings.")
            .unwrap();
        deps.store.insert_content("https://b", "rust", "Soup", "Add salt.").unwrap();

        let result = answer(&deps, "How does ownership work?").await.unwrap();
        assert_eq!(result.answer, "Ownership moves values [1].");
        assert_eq!(result.context.len(), 1);
        assert_eq!(result.context[0].url, "https://a");
    }
}
