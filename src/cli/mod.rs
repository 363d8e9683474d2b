//! CLI commands for research-crew using clap.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::agent::Agent;
use crate::broker::{self, Broker, BrokerStrategy};
use crate::config::{load_settings_or_default, validate_settings, LlmProviderKind, Settings};
use crate::crew::{self, ContentStore, CrewDeps, Role};
use crate::error::Error;
use crate::orchestrator::{Orchestrator, PipelineResult};
use crate::protocol::{agent_queue, kinds, Payload};
use crate::providers::{create_provider, ExecutionContract, Provider};
use crate::rpc::RpcClient;

/// research-crew - multi-agent research pipeline over a message broker.
#[derive(Parser)]
#[command(name = "research-crew")]
#[command(version)]
#[command(about = "Run a crew of research agents over a message broker", long_about = None)]
pub struct Commands {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Overrides for the settings file.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Message broker strategy
    #[arg(long, global = true, env = "CREW_BROKER", value_enum)]
    pub broker: Option<BrokerStrategy>,

    /// Spool directory for the spool broker
    #[arg(long, global = true, env = "CREW_SPOOL_DIR")]
    pub spool_dir: Option<PathBuf>,

    /// LLM backend
    #[arg(long, global = true, env = "LLM_PROVIDER", value_enum)]
    pub llm_provider: Option<LlmProviderKind>,

    /// Model name for the LLM backend
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Do not spawn the reference agents; expect them on the broker already
    #[arg(long, global = true)]
    pub remote_agents: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the full research pipeline
    Research {
        /// Research question
        query: String,

        /// Source URL template ({query} is substituted); repeatable
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Maximum documents to mine
        #[arg(long)]
        max_results: Option<u32>,

        /// Report output path
        #[arg(long, short)]
        output: Option<String>,

        /// Print the pipeline result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Answer and validate a single question against mined content
    Answer {
        /// Question
        query: String,
    },

    /// Mine sources for a query
    Mine {
        /// Search query
        query: String,

        /// Source URL template ({query} is substituted); repeatable
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Maximum documents to mine
        #[arg(long)]
        max_results: Option<u32>,
    },

    /// Build the knowledge graph from mined content
    CreateGraph {
        /// Maximum content items to process
        #[arg(long)]
        max_content_items: Option<u32>,
    },

    /// Run reference agents until Ctrl-C
    Serve {
        /// Roles to run; repeatable (default: all)
        #[arg(long = "role", value_enum)]
        roles: Vec<Role>,
    },

    /// Ping an agent
    Ping {
        /// Agent id
        agent_id: String,

        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        let settings = resolve_settings(&self.global)?;

        match &self.command {
            Command::Research {
                query,
                sources,
                max_results,
                output,
                json,
            } => {
                cmd_research(
                    &settings,
                    &self.global,
                    query,
                    sources,
                    *max_results,
                    output.as_deref(),
                    *json,
                )
                .await
            }
            Command::Answer { query } => cmd_answer(&settings, &self.global, query).await,
            Command::Mine {
                query,
                sources,
                max_results,
            } => cmd_mine(&settings, &self.global, query, sources, *max_results).await,
            Command::CreateGraph { max_content_items } => {
                cmd_create_graph(&settings, &self.global, *max_content_items).await
            }
            Command::Serve { roles } => cmd_serve(&settings, roles).await,
            Command::Ping { agent_id, timeout } => cmd_ping(&settings, agent_id, *timeout).await,
        }
    }
}

/// Settings file (or defaults) with command-line overrides applied.
pub fn resolve_settings(global: &GlobalArgs) -> Result<Settings> {
    let mut settings = load_settings_or_default();
    apply_overrides(&mut settings, global);
    validate_settings(&settings)?;
    Ok(settings)
}

fn apply_overrides(settings: &mut Settings, global: &GlobalArgs) {
    if let Some(strategy) = global.broker {
        settings.broker.strategy = strategy;
    }
    if let Some(dir) = &global.spool_dir {
        settings.broker.spool_dir = Some(dir.clone());
    }
    if let Some(provider) = global.llm_provider {
        // A base URL belongs to the backend it was configured for.
        if provider != settings.llm.provider {
            settings.llm.base_url = None;
        }
        settings.llm.provider = provider;
    }
    if let Some(model) = &global.model {
        settings.llm.model = Some(model.clone());
    }
}

fn crew_deps(settings: &Settings, provider: Arc<dyn Provider>) -> Result<CrewDeps> {
    Ok(CrewDeps {
        provider,
        llm: settings.llm.clone(),
        store: ContentStore::open(&settings.store.resolve_path()?)?,
        miner: settings.miner.clone(),
    })
}

/// Orchestrator over the configured broker, with the reference crew
/// running in-process unless `--remote-agents` is set.
async fn build_orchestrator(settings: &Settings, global: &GlobalArgs) -> Result<Orchestrator> {
    let broker = broker::connect(&settings.broker);
    let provider = create_provider(&settings.llm);

    let mut orchestrator = Orchestrator::new(broker.clone(), provider.clone(), settings.pipeline.clone())
        .with_contract(ExecutionContract::from_config(&settings.llm));

    if global.remote_agents {
        tracing::info!("Using remote agents on the {} broker", broker.name());
        return Ok(orchestrator);
    }

    let deps = crew_deps(settings, provider)?;
    for agent in crew::build_all(&Role::ALL, &settings.pipeline, broker, &deps)? {
        orchestrator.adopt(agent).await?;
    }
    Ok(orchestrator)
}

fn optional_sources(sources: &[String]) -> Option<&[String]> {
    (!sources.is_empty()).then_some(sources)
}

async fn cmd_research(
    settings: &Settings,
    global: &GlobalArgs,
    query: &str,
    sources: &[String],
    max_results: Option<u32>,
    output: Option<&str>,
    json: bool,
) -> Result<()> {
    let mut orchestrator = build_orchestrator(settings, global).await?;
    let result = orchestrator
        .run_research_pipeline(query, optional_sources(sources), max_results, output)
        .await;
    orchestrator.stop().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    match result {
        PipelineResult::Success {
            execution_time,
            sub_queries,
            report_path,
            ..
        } => {
            if !json {
                println!("Research complete in {:.1}s", execution_time);
                for (i, sub_query) in sub_queries.iter().enumerate() {
                    println!("  {}. {}", i + 1, sub_query);
                }
                println!("Report: {}", report_path);
            }
            Ok(())
        }
        PipelineResult::Error { stage, error, .. } => {
            Err(Error::Pipeline(format!("{} stage: {}", stage, error)).into())
        }
    }
}

async fn cmd_answer(settings: &Settings, global: &GlobalArgs, query: &str) -> Result<()> {
    let mut orchestrator = build_orchestrator(settings, global).await?;
    let outcome = orchestrator.answer_query(query).await;
    orchestrator.stop().await?;

    let answer = outcome?;
    println!("{}", answer.answer);
    if let Some(valid) = answer.validation.get("is_valid").and_then(|v| v.as_bool()) {
        println!();
        println!("Validated: {}", if valid { "yes" } else { "no" });
    }
    Ok(())
}

async fn cmd_mine(
    settings: &Settings,
    global: &GlobalArgs,
    query: &str,
    sources: &[String],
    max_results: Option<u32>,
) -> Result<()> {
    let mut orchestrator = build_orchestrator(settings, global).await?;
    let outcome = orchestrator
        .mine_data(query, optional_sources(sources), max_results)
        .await;
    orchestrator.stop().await?;

    let data = outcome?;
    println!("Mined: {}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

async fn cmd_create_graph(settings: &Settings, global: &GlobalArgs, max_content_items: Option<u32>) -> Result<()> {
    let mut orchestrator = build_orchestrator(settings, global).await?;
    let outcome = orchestrator.create_knowledge_graph(max_content_items).await;
    orchestrator.stop().await?;

    let data = outcome?;
    println!("Knowledge graph: {}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

async fn cmd_serve(settings: &Settings, roles: &[Role]) -> Result<()> {
    let roles = if roles.is_empty() { Role::ALL.to_vec() } else { roles.to_vec() };

    let broker = broker::connect(&settings.broker);
    if broker.name() == "memory" {
        tracing::warn!("Serving on the in-memory broker; only this process can reach these agents");
    }

    let deps = crew_deps(settings, create_provider(&settings.llm))?;
    let agents: Vec<Agent> = crew::build_all(&roles, &settings.pipeline, broker.clone(), &deps)?;
    for agent in &agents {
        agent.start().await?;
        println!("Serving {} ({})", agent.id(), agent.kind());
    }

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");

    for agent in &agents {
        agent.stop().await;
    }
    broker.close().await?;
    Ok(())
}

async fn cmd_ping(settings: &Settings, agent_id: &str, timeout: u64) -> Result<()> {
    let broker: Arc<dyn Broker> = broker::connect(&settings.broker);
    let client = RpcClient::new(broker.clone(), format!("cli_{}", ulid::Ulid::new()));

    let outcome = client
        .call(
            &agent_queue(agent_id),
            kinds::PING,
            Payload::new(),
            Duration::from_secs(timeout),
        )
        .await;
    broker.close().await?;

    let reply = outcome?;
    println!("{}", serde_json::to_string_pretty(&reply.to_value())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_research() {
        let commands = Commands::try_parse_from([
            "research-crew",
            "--broker",
            "spool",
            "research",
            "Where is Rust used?",
            "--source",
            "https://example.com/?q={query}",
            "-o",
            "out/report.pdf",
        ])
        .unwrap();

        assert_eq!(commands.global.broker, Some(BrokerStrategy::Spool));
        match commands.command {
            Command::Research {
                query,
                sources,
                output,
                json,
                ..
            } => {
                assert_eq!(query, "Where is Rust used?");
                assert_eq!(sources.len(), 1);
                assert_eq!(output.as_deref(), Some("out/report.pdf"));
                assert!(!json);
            }
            _ => panic!("expected research"),
        }
    }

    #[test]
    fn test_parse_serve_roles_and_global_flags() {
        let commands = Commands::try_parse_from([
            "research-crew",
            "serve",
            "--role",
            "data-miner",
            "--role",
            "lite-rag",
            "--llm-provider",
            "ollama",
            "--remote-agents",
        ])
        .unwrap();

        assert_eq!(commands.global.llm_provider, Some(LlmProviderKind::Ollama));
        assert!(commands.global.remote_agents);
        match commands.command {
            Command::Serve { roles } => assert_eq!(roles, vec![Role::DataMiner, Role::LiteRag]),
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_apply_overrides() {
        let mut settings = Settings::default();
        settings.llm.base_url = Some("http://gpu-box:11434".into());

        let global = GlobalArgs {
            broker: Some(BrokerStrategy::Spool),
            spool_dir: Some(PathBuf::from("/tmp/crew-spool")),
            llm_provider: Some(LlmProviderKind::Groq),
            model: Some("llama-3.1-8b-instant".into()),
            remote_agents: false,
        };
        apply_overrides(&mut settings, &global);

        assert_eq!(settings.broker.strategy, BrokerStrategy::Spool);
        assert_eq!(settings.broker.spool_dir, Some(PathBuf::from("/tmp/crew-spool")));
        assert_eq!(settings.llm.provider, LlmProviderKind::Groq);
        assert_eq!(settings.llm.base_url, None);
        assert_eq!(settings.llm.model.as_deref(), Some("llama-3.1-8b-instant"));
    }

    #[test]
    fn test_no_overrides_keeps_settings() {
        let mut settings = Settings::default();
        settings.llm.base_url = Some("http://gpu-box:11434".into());
        apply_overrides(&mut settings, &GlobalArgs::default());
        assert_eq!(settings.broker.strategy, BrokerStrategy::Memory);
        assert_eq!(settings.llm.base_url.as_deref(), Some("http://gpu-box:11434"));
    }
}
