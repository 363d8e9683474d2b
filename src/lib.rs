//! research-crew: agents that exchange JSON envelopes over a message broker,
//! and an orchestrator that drives them through a research pipeline.

pub mod agent;
pub mod broker;
pub mod cli;
pub mod config;
pub mod crew;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod protocol;
pub mod providers;
pub mod rpc;

pub use agent::{Agent, AgentContext, AgentState, Handler, Request, SendMode};
pub use broker::{Broker, BrokerStrategy, MemoryBroker, SpoolBroker};
pub use cli::Commands;
pub use config::{load_settings, load_settings_or_default, Settings};
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, PipelineResult};
pub use protocol::{Envelope, Payload, Reply};
pub use providers::Provider;
pub use rpc::RpcClient;
