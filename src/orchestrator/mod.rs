//! Research pipeline driver.
//!
//! The orchestrator is not an agent: it talks to the five pipeline agents
//! only through RPC calls addressed to their queues, so the agents may run
//! in this process or anywhere else sharing the broker.
//!
//! Stages run strictly in order:
//! 1. `mine_data` on the data miner
//! 2. `create_knowledge_graph` on the graph agent
//! 3. sub-query generation with the local LLM provider
//! 4. per sub-query: `answer_query` then `validate_answer`
//! 5. `generate_report` on the writer
//!
//! A failure in 1, 2 or 5 aborts the run. A failure in 4 only replaces that
//! sub-query's answer with a placeholder.

pub mod result;
pub mod subquery;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::agent::{Agent, AgentState};
use crate::broker::Broker;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::protocol::{agent_queue, kinds, Payload, Reply};
use crate::providers::{generate_with_contract, ExecutionContract, GenerateRequest, Provider};
use crate::rpc::RpcClient;

pub use result::{check_stage, Answer, PipelineResult, Stage, StageError};

/// Answer recorded for a sub-query that could not be answered or validated.
pub const NO_ANSWER: &str = "No answer available";

/// Sender id used on every orchestrator request.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

pub struct Orchestrator {
    broker: Arc<dyn Broker>,
    rpc: RpcClient,
    provider: Arc<dyn Provider>,
    contract: Option<ExecutionContract>,
    config: PipelineConfig,
    agents: Vec<Agent>,
}

impl Orchestrator {
    pub fn new(broker: Arc<dyn Broker>, provider: Arc<dyn Provider>, config: PipelineConfig) -> Self {
        Self {
            rpc: RpcClient::new(broker.clone(), ORCHESTRATOR_ID),
            broker,
            provider,
            contract: None,
            config,
            agents: Vec::new(),
        }
    }

    /// Retry and time-box sub-query generation.
    pub fn with_contract(mut self, contract: ExecutionContract) -> Self {
        self.contract = Some(contract);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Take ownership of an agent, starting it if needed. Owned agents are
    /// stopped by [`Orchestrator::stop`].
    pub async fn adopt(&mut self, agent: Agent) -> Result<()> {
        if agent.state() == AgentState::Created {
            agent.start().await?;
        }
        self.agents.push(agent);
        Ok(())
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    async fn call(&self, agent_id: &str, message_type: &str, payload: Value, timeout: Duration) -> Result<Reply> {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Payload::new(),
        };
        self.rpc
            .call(&agent_queue(agent_id), message_type, payload, timeout)
            .await
    }

    /// Stage 1: mine sources for `query`.
    pub async fn mine_data(
        &self,
        query: &str,
        sources: Option<&[String]>,
        max_results: Option<u32>,
    ) -> std::result::Result<Value, StageError> {
        tracing::info!("Starting data mining for query: {}", query);
        let payload = json!({
            "query": query,
            "sources": sources,
            "max_results": max_results.unwrap_or(self.config.max_results),
        });
        let outcome = self
            .call(
                &self.config.data_miner_id,
                kinds::MINE_DATA,
                payload,
                self.config.mining_timeout(),
            )
            .await;
        check_stage(Stage::Mining, outcome)
    }

    /// Stage 2: build the knowledge graph from mined content.
    pub async fn create_knowledge_graph(
        &self,
        max_content_items: Option<u32>,
    ) -> std::result::Result<Value, StageError> {
        tracing::info!("Starting knowledge graph creation");
        let outcome = self
            .call(
                &self.config.knowledge_graph_id,
                kinds::CREATE_KNOWLEDGE_GRAPH,
                json!({ "max_content_items": max_content_items }),
                self.config.graph_timeout(),
            )
            .await;
        check_stage(Stage::KnowledgeGraph, outcome)
    }

    /// Stage 4 for one sub-query: answer, then validate.
    ///
    /// A corrected answer from the validator supersedes the raw one.
    pub async fn answer_query(&self, query: &str) -> std::result::Result<Answer, StageError> {
        tracing::info!("Processing query: {}", query);

        let outcome = self
            .call(
                &self.config.answerer_id,
                kinds::ANSWER_QUERY,
                json!({ "query": query }),
                self.config.answer_timeout(),
            )
            .await;
        let data = check_stage(Stage::Answering, outcome)?;
        let answer = extract_answer(&data);
        let context = data.get("context").cloned().unwrap_or_else(|| json!([]));

        let outcome = self
            .call(
                &self.config.validator_id,
                kinds::VALIDATE_ANSWER,
                json!({ "query": query, "answer": answer, "context": context }),
                self.config.validate_timeout(),
            )
            .await;
        let validation = check_stage(Stage::Validation, outcome)?;

        Ok(Answer {
            query: query.to_string(),
            answer: extract_corrected_answer(&validation).unwrap_or(answer),
            validation: validation
                .get("validation_result")
                .cloned()
                .unwrap_or(validation),
        })
    }

    /// Stage 5: hand the answered questions to the writer. Returns the report path.
    pub async fn generate_report(
        &self,
        title: &str,
        queries: &[String],
        answers: &[String],
        output_path: &str,
    ) -> std::result::Result<String, StageError> {
        tracing::info!("Generating report: {}", title);
        let outcome = self
            .call(
                &self.config.writer_id,
                kinds::GENERATE_REPORT,
                json!({
                    "title": title,
                    "queries": queries,
                    "answers": answers,
                    "output_path": output_path,
                }),
                self.config.report_timeout(),
            )
            .await;
        let data = check_stage(Stage::Report, outcome)?;
        Ok(data
            .get("report_path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    /// Stage 3: decompose the main query. Never fails; falls back to the main query.
    pub async fn generate_sub_queries(&self, main_query: &str) -> Vec<String> {
        let request = GenerateRequest::new(subquery::prompt(main_query))
            .with_system_prompt(subquery::SYSTEM_PROMPT)
            .with_temperature(0.3)
            .with_max_tokens(500);

        let reply = match &self.contract {
            Some(contract) => generate_with_contract(self.provider.as_ref(), &request, contract)
                .await
                .map_err(|e| e.to_string()),
            None => self.provider.generate(&request).await.map_err(|e| e.to_string()),
        };

        match reply {
            Ok(text) => subquery::parse_sub_queries(&text, main_query, self.config.max_sub_queries),
            Err(e) => {
                tracing::warn!("Sub-query generation failed, using the main query: {}", e);
                vec![main_query.to_string()]
            }
        }
    }

    /// Run all five stages for `research_query`.
    pub async fn run_research_pipeline(
        &self,
        research_query: &str,
        sources: Option<&[String]>,
        max_results: Option<u32>,
        output_path: Option<&str>,
    ) -> PipelineResult {
        tracing::info!("Starting research pipeline for query: {}", research_query);
        let started = Instant::now();

        tracing::info!("Step 1: mining data");
        if let Err(e) = self.mine_data(research_query, sources, max_results).await {
            tracing::error!("Pipeline aborted: {}", e);
            return e.into();
        }

        tracing::info!("Step 2: creating knowledge graph");
        if let Err(e) = self.create_knowledge_graph(None).await {
            tracing::error!("Pipeline aborted: {}", e);
            return e.into();
        }

        tracing::info!("Step 3: generating sub-queries");
        let sub_queries = self.generate_sub_queries(research_query).await;

        tracing::info!("Step 4: answering {} sub-queries", sub_queries.len());
        let mut answers = Vec::with_capacity(sub_queries.len());
        for query in &sub_queries {
            match self.answer_query(query).await {
                Ok(answer) => answers.push(answer.answer),
                Err(e) => {
                    tracing::warn!("Failed to answer query '{}': {}", query, e);
                    answers.push(NO_ANSWER.to_string());
                }
            }
        }

        tracing::info!("Step 5: generating report");
        let title = format!("Research Report: {}", research_query);
        let output_path = output_path.unwrap_or(&self.config.output_path);
        let report_path = match self
            .generate_report(&title, &sub_queries, &answers, output_path)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                tracing::error!("Pipeline aborted: {}", e);
                return e.into();
            }
        };

        let execution_time = started.elapsed().as_secs_f64();
        tracing::info!("Research pipeline finished in {:.1}s", execution_time);

        PipelineResult::Success {
            execution_time,
            research_query: research_query.to_string(),
            sub_queries,
            answers,
            report_path,
        }
    }

    /// Stop every owned agent, then close the broker.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("Stopping {} agents", self.agents.len());
        for agent in self.agents.drain(..) {
            agent.stop().await;
        }
        self.broker.close().await
    }
}

/// An answer is either the bare data string or `data.answer`.
fn extract_answer(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        other => other
            .get("answer")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn extract_corrected_answer(validation: &Value) -> Option<String> {
    validation
        .get("corrected_answer")
        .or_else(|| {
            validation
                .get("validation_result")
                .and_then(|v| v.get("corrected_answer"))
        })
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{handler_fn, Request};
    use crate::broker::{ConsumerHandle, Delivery, MemoryBroker};
    use crate::protocol::Envelope;
    use crate::providers::{ProviderError, Result as ProviderResult};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers every prompt with a fixed reply.
    struct ScriptedProvider(std::result::Result<String, String>);

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn generate(&self, _request: &GenerateRequest) -> ProviderResult<String> {
            self.0.clone().map_err(ProviderError::ApiError)
        }

        fn default_model(&self) -> Option<&str> {
            None
        }
    }

    /// Broker decorator remembering every routing key published to.
    struct RecordingBroker {
        inner: MemoryBroker,
        published: Mutex<Vec<String>>,
    }

    impl RecordingBroker {
        fn new() -> Self {
            Self {
                inner: MemoryBroker::new(Duration::from_millis(10)),
                published: Mutex::new(Vec::new()),
            }
        }

        fn published_to(&self, routing_key: &str) -> bool {
            self.published.lock().unwrap().iter().any(|k| k == routing_key)
        }
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        fn name(&self) -> &str {
            "recording"
        }

        async fn create_queue(&self, name: &str, routing_keys: &[String]) -> Result<()> {
            self.inner.create_queue(name, routing_keys).await
        }

        async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<usize> {
            self.published.lock().unwrap().push(routing_key.to_string());
            self.inner.publish(routing_key, envelope).await
        }

        async fn start_consumer(&self, queue: &str, delivery: Arc<dyn Delivery>) -> Result<ConsumerHandle> {
            self.inner.start_consumer(queue, delivery).await
        }

        async fn delete_queue(&self, name: &str) -> Result<()> {
            self.inner.delete_queue(name).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    fn quick_config() -> PipelineConfig {
        PipelineConfig {
            mining_timeout_secs: 2,
            graph_timeout_secs: 2,
            answer_timeout_secs: 2,
            validate_timeout_secs: 2,
            report_timeout_secs: 2,
            ..PipelineConfig::default()
        }
    }

    async fn stub(
        orchestrator: &mut Orchestrator,
        id: &str,
        message_type: &str,
        respond: fn(&Request) -> anyhow::Result<Value>,
    ) {
        let agent = Agent::new(id, "StubAgent", orchestrator.broker().clone()).unwrap();
        agent
            .register_handler(
                message_type,
                handler_fn(move |_ctx, request| async move { respond(&request) }),
            )
            .unwrap();
        orchestrator.adopt(agent).await.unwrap();
    }

    fn answer_by_query(request: &Request) -> anyhow::Result<Value> {
        match request.str_field("query") {
            Some("Q1") => Ok(json!("A1")),
            Some("Q2") => Ok(json!("A2")),
            other => anyhow::bail!("unexpected query {:?}", other),
        }
    }

    fn validate_echo(request: &Request) -> anyhow::Result<Value> {
        Ok(json!({"is_valid": true, "corrected_answer": request.str_field("answer")}))
    }

    async fn crew(broker: Arc<dyn Broker>, mining: fn(&Request) -> anyhow::Result<Value>) -> Orchestrator {
        let provider = Arc::new(ScriptedProvider(Ok(r#"["Q1", "Q2"]"#.to_string())));
        let mut orchestrator = Orchestrator::new(broker, provider, quick_config());

        stub(&mut orchestrator, "data_miner", kinds::MINE_DATA, mining).await;
        stub(&mut orchestrator, "knowledge_graph", kinds::CREATE_KNOWLEDGE_GRAPH, |_| {
            Ok(json!({"status": "success", "content_nodes": 3, "entity_nodes": 5}))
        })
        .await;
        stub(&mut orchestrator, "lite_rag", kinds::ANSWER_QUERY, answer_by_query).await;
        stub(&mut orchestrator, "validator", kinds::VALIDATE_ANSWER, validate_echo).await;
        stub(&mut orchestrator, "writer", kinds::GENERATE_REPORT, |_| {
            Ok(json!({"report_path": "out/report.pdf"}))
        })
        .await;
        orchestrator
    }

    fn mining_ok(_: &Request) -> anyhow::Result<Value> {
        Ok(json!({"status": "success", "total_sources": 3}))
    }

    #[tokio::test]
    async fn test_end_to_end_pipeline() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(Duration::from_millis(10)));
        let mut orchestrator = crew(broker, mining_ok).await;

        let result = orchestrator
            .run_research_pipeline("What is X?", None, None, Some("out/report.pdf"))
            .await;

        match &result {
            PipelineResult::Success {
                research_query,
                sub_queries,
                answers,
                report_path,
                ..
            } => {
                assert_eq!(research_query, "What is X?");
                assert_eq!(sub_queries, &vec!["Q1".to_string(), "Q2".to_string()]);
                assert_eq!(answers, &vec!["A1".to_string(), "A2".to_string()]);
                assert_eq!(report_path, "out/report.pdf");
            }
            other => panic!("pipeline failed: {:?}", other),
        }
        assert_eq!(serde_json::to_value(&result).unwrap()["status"], json!("success"));

        orchestrator.stop().await.unwrap();
        assert!(orchestrator.agents().is_empty());
    }

    #[tokio::test]
    async fn test_mining_failure_aborts_before_later_stages() {
        let broker = Arc::new(RecordingBroker::new());
        let mut orchestrator = crew(broker.clone(), |_| {
            Ok(json!({"status": "error", "error": "all sources failed"}))
        })
        .await;

        let result = orchestrator.run_research_pipeline("What is X?", None, None, None).await;

        match result {
            PipelineResult::Error { stage, details, .. } => {
                assert_eq!(stage, Stage::Mining);
                assert!(details.is_some());
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert!(broker.published_to("agent_data_miner"));
        assert!(!broker.published_to("agent_knowledge_graph"));
        assert!(!broker.published_to("agent_lite_rag"));
        assert!(!broker.published_to("agent_writer"));
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_in_mining_aborts() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(Duration::from_millis(10)));
        let mut orchestrator = crew(broker, |_| anyhow::bail!("scraper crashed")).await;

        let result = orchestrator.run_research_pipeline("What is X?", None, None, None).await;
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], json!("error"));
        assert_eq!(value["stage"], json!("mining"));
        assert_eq!(value["details"]["error"], json!("scraper crashed"));
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_sub_query_degrades_to_placeholder() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(Duration::from_millis(10)));
        let provider = Arc::new(ScriptedProvider(Ok(r#"["Q1", "Q3"]"#.to_string())));
        let mut orchestrator = Orchestrator::new(broker, provider, quick_config());
        stub(&mut orchestrator, "data_miner", kinds::MINE_DATA, mining_ok).await;
        stub(&mut orchestrator, "knowledge_graph", kinds::CREATE_KNOWLEDGE_GRAPH, |_| Ok(json!({}))).await;
        stub(&mut orchestrator, "lite_rag", kinds::ANSWER_QUERY, answer_by_query).await;
        stub(&mut orchestrator, "validator", kinds::VALIDATE_ANSWER, validate_echo).await;
        stub(&mut orchestrator, "writer", kinds::GENERATE_REPORT, |request| {
            Ok(json!({"report_path": request.str_field("output_path")}))
        })
        .await;

        let result = orchestrator.run_research_pipeline("What is X?", None, None, None).await;
        match result {
            PipelineResult::Success { answers, report_path, .. } => {
                assert_eq!(answers, vec!["A1".to_string(), NO_ANSWER.to_string()]);
                assert_eq!(report_path, "report.pdf");
            }
            other => panic!("pipeline failed: {:?}", other),
        }
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_writer_times_out_report_stage() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(Duration::from_millis(10)));
        let provider = Arc::new(ScriptedProvider(Err("offline".to_string())));
        let config = PipelineConfig {
            report_timeout_secs: 1,
            ..quick_config()
        };
        let mut orchestrator = Orchestrator::new(broker, provider, config);
        stub(&mut orchestrator, "data_miner", kinds::MINE_DATA, mining_ok).await;
        stub(&mut orchestrator, "knowledge_graph", kinds::CREATE_KNOWLEDGE_GRAPH, |_| Ok(json!({}))).await;
        stub(&mut orchestrator, "lite_rag", kinds::ANSWER_QUERY, |_| Ok(json!({"answer": "A"}))).await;
        stub(&mut orchestrator, "validator", kinds::VALIDATE_ANSWER, |_| {
            Ok(json!({"validation_result": {"corrected_answer": "A!"}}))
        })
        .await;

        // LLM offline: the main query is the only sub-query.
        let answer = orchestrator.answer_query("What is X?").await.unwrap();
        assert_eq!(answer.answer, "A!");

        let result = orchestrator.run_research_pipeline("What is X?", None, None, None).await;
        match result {
            PipelineResult::Error { stage, error, .. } => {
                assert_eq!(stage, Stage::Report);
                assert!(error.contains("timed out"), "{}", error);
            }
            other => panic!("expected error, got {:?}", other),
        }
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_sub_query_fallbacks() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::default());
        let offline = Orchestrator::new(
            broker.clone(),
            Arc::new(ScriptedProvider(Err("connection refused".into()))),
            PipelineConfig::default(),
        )
        .with_contract(ExecutionContract {
            timeout_seconds: 1,
            retries: 0,
            retry_backoff_ms: 1,
        });
        assert_eq!(offline.generate_sub_queries("main").await, vec!["main"]);

        let chatty = Orchestrator::new(
            broker,
            Arc::new(ScriptedProvider(Ok(
                r#"["a?","b?","c?","d?","e?","f?"]"#.to_string()
            ))),
            PipelineConfig::default(),
        );
        assert_eq!(chatty.generate_sub_queries("main").await.len(), 5);
    }

    #[test]
    fn test_answer_extraction() {
        assert_eq!(extract_answer(&json!("plain")), "plain");
        assert_eq!(extract_answer(&json!({"answer": "nested", "context": []})), "nested");
        assert_eq!(extract_answer(&json!({"context": []})), "");

        assert_eq!(
            extract_corrected_answer(&json!({"validation_result": {"corrected_answer": "fixed"}})),
            Some("fixed".to_string())
        );
        assert_eq!(extract_corrected_answer(&json!({"is_valid": true})), None);
    }
}
