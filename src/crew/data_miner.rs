//! Data miner: fetches source pages for a query and stores their text.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Url};
use scraper::{Html, Node, Selector};
use serde::{Deserialize, Serialize};

use super::{CrewDeps, ContentStore};
use crate::agent::{typed, Agent};
use crate::error::{Error, Result};
use crate::protocol::kinds;

/// Placeholder substituted with the search query in source templates.
pub const QUERY_PLACEHOLDER: &str = "{query}";

const QUERY_MARKER: &str = "__crew_query__";

/// Elements whose text is never visible page content.
const HIDDEN_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

#[derive(Debug, Clone, Deserialize)]
pub struct MineDataRequest {
    pub query: String,
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    #[serde(default)]
    pub max_results: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOutcome {
    Stored,
    Filtered,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct MineDataResult {
    pub status: String,
    pub total_sources: usize,
    pub successful_sources: usize,
    pub failed_sources: usize,
    pub filtered_sources: usize,
    pub source_breakdown: BTreeMap<String, SourceOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Miner {
    client: Client,
    store: ContentStore,
    sources: Vec<String>,
    min_content_length: usize,
}

pub fn register(agent: &Agent, deps: &CrewDeps) -> Result<()> {
    let client = Client::builder()
        .timeout(Duration::from_secs(deps.miner.request_timeout_secs))
        .user_agent(concat!("research-crew/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Transport(format!("http client: {}", e)))?;

    let miner = Arc::new(Miner {
        client,
        store: deps.store.clone(),
        sources: deps.miner.sources.clone(),
        min_content_length: deps.miner.min_content_length,
    });

    agent.register_handler(
        kinds::MINE_DATA,
        typed(move |_ctx, request: MineDataRequest| {
            let miner = miner.clone();
            async move { miner.mine(request).await }
        }),
    )
}

impl Miner {
    async fn mine(&self, request: MineDataRequest) -> anyhow::Result<MineDataResult> {
        let query = request.query.trim();
        if query.is_empty() {
            anyhow::bail!("query is empty");
        }

        let sources = match request.sources {
            Some(sources) if !sources.is_empty() => sources,
            _ => self.sources.clone(),
        };
        let max_results = request.max_results.map(|n| n as usize).unwrap_or(usize::MAX);

        tracing::info!("Mining {} sources for: {}", sources.len(), query);

        let mut breakdown = BTreeMap::new();
        let mut stored = 0usize;
        for source in &sources {
            let outcome = if stored >= max_results {
                SourceOutcome::Skipped
            } else {
                self.mine_source(source, query).await
            };
            if outcome == SourceOutcome::Stored {
                stored += 1;
            }
            breakdown.insert(source.clone(), outcome);
        }

        let count = |wanted: SourceOutcome| breakdown.values().filter(|o| **o == wanted).count();
        let successful_sources = count(SourceOutcome::Stored);
        let failed_sources = count(SourceOutcome::Failed);
        let filtered_sources = count(SourceOutcome::Filtered);

        let error = (successful_sources == 0)
            .then(|| format!("no usable content from {} sources", sources.len()));

        Ok(MineDataResult {
            status: if error.is_none() { "success" } else { "error" }.to_string(),
            total_sources: sources.len(),
            successful_sources,
            failed_sources,
            filtered_sources,
            source_breakdown: breakdown,
            error,
        })
    }

    async fn mine_source(&self, template: &str, query: &str) -> SourceOutcome {
        let Some(url) = expand_source(template, query) else {
            tracing::warn!("Invalid source template: {}", template);
            return SourceOutcome::Failed;
        };

        let html = match self.fetch(&url).await {
            Ok(html) => html,
            Err(e) => {
                tracing::warn!("Fetching {} failed: {}", url, e);
                return SourceOutcome::Failed;
            }
        };

        let page = parse_page(&html);
        if page.text.chars().count() < self.min_content_length {
            tracing::debug!("Filtered {} ({} chars)", url, page.text.len());
            return SourceOutcome::Filtered;
        }

        let title = page.title.unwrap_or_else(|| url.to_string());
        match self.store.insert_content(url.as_str(), query, &title, &page.text) {
            Ok(_) => SourceOutcome::Stored,
            Err(e) => {
                tracing::error!("Storing {} failed: {}", url, e);
                SourceOutcome::Failed
            }
        }
    }

    async fn fetch(&self, url: &Url) -> std::result::Result<String, reqwest::Error> {
        self.client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

/// Substitute the encoded query into a source template.
///
/// A template without the placeholder is fetched as-is.
pub fn expand_source(template: &str, query: &str) -> Option<Url> {
    if !template.contains(QUERY_PLACEHOLDER) {
        return Url::parse(template).ok();
    }

    let mut url = Url::parse(&template.replace(QUERY_PLACEHOLDER, QUERY_MARKER)).ok()?;

    if url.path().contains(QUERY_MARKER) {
        let path = url.path().replace(QUERY_MARKER, query);
        url.set_path(&path);
    }

    if url.query().is_some_and(|q| q.contains(QUERY_MARKER)) {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.replace(QUERY_MARKER, query)))
            .collect();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Some(url)
}

/// Title and visible text of a fetched page.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPage {
    pub title: Option<String>,
    pub text: String,
}

/// Parse an HTML page, collapsing whitespace in both title and text.
pub fn parse_page(html: &str) -> ParsedPage {
    let document = Html::parse_document(html);

    let mut words: Vec<&str> = Vec::new();
    for node in document.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|element| HIDDEN_ELEMENTS.contains(&element.name()))
        });
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }

    let title = Selector::parse("title")
        .ok()
        .and_then(|selector| {
            document
                .select(&selector)
                .next()
                .map(|element| collapse(element.text()))
        })
        .filter(|title| !title.is_empty());

    ParsedPage {
        title,
        text: words.join(" "),
    }
}

fn collapse<'a>(fragments: impl Iterator<Item = &'a str>) -> String {
    fragments
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
