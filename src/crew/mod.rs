//! Reference implementations of the five pipeline agents.
//!
//! Each role registers its handlers on a plain [`Agent`]; the heuristics are
//! thin so any role can be swapped for a remote agent that
//! speaks the same message types.

pub mod data_miner;
pub mod knowledge_graph;
pub mod lite_rag;
pub mod store;
pub mod validator;
pub mod writer;

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::agent::Agent;
use crate::broker::Broker;
use crate::config::{LlmConfig, MinerConfig, PipelineConfig};
use crate::error::Result;
use crate::providers::{generate_with_contract, request_from_config, ExecutionContract, Provider};

pub use store::ContentStore;

/// Which pipeline role an agent plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    DataMiner,
    KnowledgeGraph,
    LiteRag,
    Validator,
    Writer,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::DataMiner,
        Role::KnowledgeGraph,
        Role::LiteRag,
        Role::Validator,
        Role::Writer,
    ];

    /// Concrete type name reported by `ping`.
    pub fn kind(&self) -> &'static str {
        match self {
            Role::DataMiner => "DataMinerAgent",
            Role::KnowledgeGraph => "KnowledgeGraphAgent",
            Role::LiteRag => "LiteRagAgent",
            Role::Validator => "ValidatorAgent",
            Role::Writer => "WriterAgent",
        }
    }

    /// Agent id the pipeline addresses this role by.
    pub fn agent_id<'a>(&self, pipeline: &'a PipelineConfig) -> &'a str {
        match self {
            Role::DataMiner => &pipeline.data_miner_id,
            Role::KnowledgeGraph => &pipeline.knowledge_graph_id,
            Role::LiteRag => &pipeline.answerer_id,
            Role::Validator => &pipeline.validator_id,
            Role::Writer => &pipeline.writer_id,
        }
    }
}

/// What the reference agents need from the outside world.
#[derive(Clone)]
pub struct CrewDeps {
    pub provider: Arc<dyn Provider>,
    pub llm: LlmConfig,
    pub store: ContentStore,
    pub miner: MinerConfig,
}

impl CrewDeps {
    /// One LLM completion under the configured execution contract.
    pub async fn complete(&self, system_prompt: &str, prompt: String) -> anyhow::Result<String> {
        let request = request_from_config(&self.llm, prompt).with_system_prompt(system_prompt);
        let contract = ExecutionContract::from_config(&self.llm);
        Ok(generate_with_contract(self.provider.as_ref(), &request, &contract).await?)
    }
}

/// Build (but do not start) the agent for `role`.
pub fn build(role: Role, agent_id: &str, broker: Arc<dyn Broker>, deps: &CrewDeps) -> Result<Agent> {
    let agent = Agent::new(agent_id, role.kind(), broker)?;
    match role {
        Role::DataMiner => data_miner::register(&agent, deps)?,
        Role::KnowledgeGraph => knowledge_graph::register(&agent, deps)?,
        Role::LiteRag => lite_rag::register(&agent, deps)?,
        Role::Validator => validator::register(&agent, deps)?,
        Role::Writer => writer::register(&agent)?,
    }
    Ok(agent)
}

/// Build agents for `roles`, named as the pipeline expects.
pub fn build_all(
    roles: &[Role],
    pipeline: &PipelineConfig,
    broker: Arc<dyn Broker>,
    deps: &CrewDeps,
) -> Result<Vec<Agent>> {
    roles
        .iter()
        .map(|role| build(*role, role.agent_id(pipeline), broker.clone(), deps))
        .collect()
}

/// First `[...]` in `text` parsed as a JSON array.
pub(crate) fn extract_json_array<T: DeserializeOwned>(text: &str) -> Option<Vec<T>> {
    serde_json::from_str(text.trim()).ok().or_else(|| {
        let start = text.find('[')?;
        let end = text.rfind(']')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&text[start..=end]).ok()
    })
}

/// First `{...}` in `text` parsed as a JSON object.
pub(crate) fn extract_json_object<T: DeserializeOwned>(text: &str) -> Option<T> {
    serde_json::from_str(text.trim()).ok().or_else(|| {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&text[start..=end]).ok()
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::providers::{GenerateRequest, Result as ProviderResult};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Replies with queued answers in order, then repeats the last one.
    pub struct CannedProvider {
        replies: Mutex<Vec<String>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl CannedProvider {
        pub fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().rev().map(|r| r.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Provider for CannedProvider {
        fn name(&self) -> &str {
            "canned"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn generate(&self, request: &GenerateRequest) -> ProviderResult<String> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let mut replies = self.replies.lock().unwrap();
            Ok(if replies.len() > 1 {
                replies.pop().unwrap_or_default()
            } else {
                replies.last().cloned().unwrap_or_default()
            })
        }

        fn default_model(&self) -> Option<&str> {
            None
        }
    }

    pub fn deps(replies: &[&str]) -> (TempDir, CrewDeps) {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(&dir.path().join("crew.db")).unwrap();
        let deps = CrewDeps {
            provider: Arc::new(CannedProvider::new(replies)),
            llm: LlmConfig {
                retries: 0,
                ..LlmConfig::default()
            },
            store,
            miner: MinerConfig::default(),
        };
        (dir, deps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::protocol::kinds;
    use crate::protocol::Payload;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_json_extraction() {
        let items: Vec<String> = extract_json_array("Sure: [\"a\", \"b\"] done").unwrap();
        assert_eq!(items, vec!["a", "b"]);
        assert!(extract_json_array::<String>("nothing here").is_none());

        let obj: serde_json::Value = extract_json_object("```json\n{\"is_valid\": true}\n```").unwrap();
        assert_eq!(obj["is_valid"], json!(true));
    }

    #[tokio::test]
    async fn test_full_crew_answers_ping() {
        let (_dir, deps) = testing::deps(&["[]"]);
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(Duration::from_millis(10)));
        let pipeline = PipelineConfig::default();

        let agents = build_all(&Role::ALL, &pipeline, broker.clone(), &deps).unwrap();
        for agent in &agents {
            agent.start().await.unwrap();
        }

        let caller = Agent::new("caller", "Cli", broker).unwrap();
        caller.start().await.unwrap();
        let reply = caller
            .request("lite_rag", kinds::PING, Payload::new(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.field("agent_type"), Some(&json!("LiteRagAgent")));

        for agent in &agents {
            agent.stop().await;
        }
    }
}
