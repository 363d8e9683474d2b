//! Handler contract and adapters.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::Agent;
use crate::error::{Error, Result};
use crate::protocol::types::RESPONSE_SUFFIX;
use crate::protocol::{Envelope, Payload};

/// What a handler hands back: `data` on success, an error message otherwise.
pub type HandlerResult = anyhow::Result<Value>;

/// An inbound message, as seen by a handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub message_type: String,
    pub payload: Payload,
    pub correlation_id: String,
    pub sender_id: String,
}

impl Request {
    /// Deserialize the payload into a typed request.
    pub fn parse<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .with_context(|| format!("invalid {} payload", self.message_type))
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

impl From<&Envelope> for Request {
    fn from(envelope: &Envelope) -> Self {
        Self {
            message_type: envelope.message_type.clone(),
            payload: envelope.payload.clone(),
            correlation_id: envelope.correlation_id.clone(),
            sender_id: envelope.sender_id.clone(),
        }
    }
}

/// The agent a handler runs inside of.
#[derive(Clone)]
pub struct AgentContext {
    agent: Agent,
}

impl AgentContext {
    pub(crate) fn new(agent: Agent) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn agent_id(&self) -> &str {
        self.agent.id()
    }
}

/// Business logic bound to one message type.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: AgentContext, request: Request) -> HandlerResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(AgentContext, Request) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, ctx: AgentContext, request: Request) -> HandlerResult {
        (self.0)(ctx, request).await
    }
}

/// Wrap a closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(AgentContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct TypedHandler<T, F> {
    f: F,
    _request: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, R, F, Fut> Handler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize,
    F: Fn(AgentContext, T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<R>> + Send,
{
    async fn handle(&self, ctx: AgentContext, request: Request) -> HandlerResult {
        let typed: T = request.parse()?;
        let result = (self.f)(ctx, typed).await?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Wrap a closure taking a deserialized payload and returning a serializable result.
///
/// A payload that does not match `T` becomes an error response.
pub fn typed<T, R, F, Fut>(f: F) -> Arc<dyn Handler>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
    F: Fn(AgentContext, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    Arc::new(TypedHandler {
        f,
        _request: PhantomData,
    })
}

/// Reject message types a handler can never usefully be bound to.
pub fn validate_message_type(message_type: &str) -> Result<()> {
    if message_type.is_empty() {
        return Err(Error::InvalidHandler("message type is empty".to_string()));
    }
    if message_type.chars().any(char::is_whitespace) {
        return Err(Error::InvalidHandler(format!(
            "message type '{}' contains whitespace",
            message_type
        )));
    }
    if message_type.ends_with(RESPONSE_SUFFIX) {
        return Err(Error::InvalidHandler(format!(
            "'{}' is a response type",
            message_type
        )));
    }
    Ok(())
}
