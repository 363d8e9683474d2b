//! Knowledge graph builder: LLM entity extraction over stored content.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::store::Entity;
use super::{extract_json_array, CrewDeps};
use crate::agent::{typed, Agent};
use crate::error::Result;
use crate::protocol::kinds;

pub const DEFAULT_MAX_CONTENT_ITEMS: u32 = 50;

/// Characters of each document shown to the model.
const EXCERPT_CHARS: usize = 4000;

const SYSTEM_PROMPT: &str = "You extract named entities from documents. \
Reply with a JSON array of objects with \"name\" and \"type\" fields and nothing else. \
Use types such as person, organization, location, technology, concept, event.";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateGraphRequest {
    #[serde(default)]
    pub max_content_items: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateGraphResult {
    pub status: String,
    pub content_nodes: usize,
    pub entity_nodes: usize,
    pub entity_types: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn register(agent: &Agent, deps: &CrewDeps) -> Result<()> {
    let deps = deps.clone();
    agent.register_handler(
        kinds::CREATE_KNOWLEDGE_GRAPH,
        typed(move |_ctx, request: CreateGraphRequest| {
            let deps = deps.clone();
            async move { create_graph(&deps, request).await }
        }),
    )
}

async fn create_graph(deps: &CrewDeps, request: CreateGraphRequest) -> anyhow::Result<CreateGraphResult> {
    let limit = request.max_content_items.unwrap_or(DEFAULT_MAX_CONTENT_ITEMS) as usize;
    let items = deps.store.list_content(limit)?;

    if items.is_empty() {
        return Ok(CreateGraphResult {
            status: "error".to_string(),
            content_nodes: 0,
            entity_nodes: 0,
            entity_types: BTreeMap::new(),
            error: Some("no content to build a graph from".to_string()),
        });
    }

    let mut entity_nodes = 0;
    for item in &items {
        let excerpt: String = item.body.chars().take(EXCERPT_CHARS).collect();
        let prompt = format!("Title: {}\n\n{}", item.title, excerpt);

        let entities = match deps.complete(SYSTEM_PROMPT, prompt).await {
            Ok(reply) => parse_entities(&reply),
            Err(e) => {
                tracing::warn!("Entity extraction failed for {}: {}", item.url, e);
                continue;
            }
        };
        entity_nodes += deps.store.insert_entities(&item.id, &entities)?;
    }

    tracing::info!(
        "Knowledge graph: {} content nodes, {} entity nodes",
        items.len(),
        entity_nodes
    );

    Ok(CreateGraphResult {
        status: "success".to_string(),
        content_nodes: items.len(),
        entity_nodes,
        entity_types: deps.store.entity_types()?,
        error: None,
    })
}

/// Entities from a model reply, de-duplicated by name. Unparsable replies yield none.
pub fn parse_entities(reply: &str) -> Vec<Entity> {
    let mut entities: Vec<Entity> = extract_json_array(reply).unwrap_or_default();
    entities.retain(|e| !e.name.trim().is_empty());

    let mut seen = std::collections::HashSet::new();
    entities.retain(|e| seen.insert(e.name.trim().to_lowercase()));
    for entity in &mut entities {
        entity.name = entity.name.trim().to_string();
        entity.entity_type = entity.entity_type.trim().to_lowercase();
    }
    entities
}
