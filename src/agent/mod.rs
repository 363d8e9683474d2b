//! Agent runtime: an addressable actor with one inbound queue.
//!
//! An agent owns the queue `agent_<id>`, bound to its own address and
//! (unless disabled) to the shared `broadcast` topic. Its consumer loop
//! dispatches each envelope to the handler registered for the envelope's
//! type and, when the sender asked for one, publishes a response to the
//! envelope's `reply_to` address.
//!
//! Lifecycle: `Created -> Running -> Stopped`. Stopped is terminal. Once
//! the consumer loop has exited, the inbound queue is deleted unless the
//! broker is durable, so nothing keeps piling up behind a stopped agent.

pub mod handler;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::broker::{Broker, ConsumerHandle, Delivery};
use crate::error::{Error, Result};
use crate::protocol::{agent_queue, kinds, Envelope, Payload, Reply, ResponseBody, BROADCAST_TOPIC};
use crate::rpc::RpcClient;

pub use handler::{handler_fn, typed, AgentContext, Handler, HandlerResult, Request};

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Created,
    Running,
    Stopped,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Created => write!(f, "created"),
            AgentState::Running => write!(f, "running"),
            AgentState::Stopped => write!(f, "stopped"),
        }
    }
}

/// How `send_message` treats the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Publish and return immediately.
    FireAndForget,
    /// Block until the correlated reply arrives or the timeout elapses.
    AwaitReply(Duration),
}

struct AgentInner {
    id: String,
    kind: String,
    queue: String,
    broker: Arc<dyn Broker>,
    rpc: RpcClient,
    subscribe_broadcast: bool,
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    state: Mutex<AgentState>,
    consumer: Mutex<Option<ConsumerHandle>>,
    teardown: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to an agent. Cheap to clone; all clones address the same actor.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for [`Agent`].
pub struct AgentBuilder {
    id: String,
    kind: String,
    broker: Arc<dyn Broker>,
    subscribe_broadcast: bool,
}

impl AgentBuilder {
    /// Concrete agent type name, reported by `ping`.
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Whether to bind the inbound queue to the `broadcast` topic (default true).
    pub fn broadcast(mut self, enabled: bool) -> Self {
        self.subscribe_broadcast = enabled;
        self
    }

    pub fn build(self) -> Result<Agent> {
        if self.id.is_empty() || self.id.chars().any(char::is_whitespace) {
            return Err(Error::Config(format!("invalid agent id '{}'", self.id)));
        }

        let agent = Agent {
            inner: Arc::new(AgentInner {
                queue: agent_queue(&self.id),
                rpc: RpcClient::new(self.broker.clone(), self.id.clone()),
                id: self.id,
                kind: self.kind,
                broker: self.broker,
                subscribe_broadcast: self.subscribe_broadcast,
                handlers: RwLock::new(HashMap::new()),
                state: Mutex::new(AgentState::Created),
                consumer: Mutex::new(None),
                teardown: Mutex::new(None),
            }),
        };

        agent.register_handler(kinds::PING, handler_fn(ping))?;
        agent.register_handler(kinds::STOP, handler_fn(stop))?;
        Ok(agent)
    }
}

async fn ping(ctx: AgentContext, _request: Request) -> HandlerResult {
    Ok(json!({
        "status": "alive",
        "agent_id": ctx.agent_id(),
        "agent_type": ctx.agent().kind(),
    }))
}

async fn stop(ctx: AgentContext, _request: Request) -> HandlerResult {
    ctx.agent().request_stop();
    Ok(json!({
        "status": "stopped",
        "agent_id": ctx.agent_id(),
    }))
}

/// Consumer-side adapter. Holds the agent weakly so a dropped agent does not
/// keep its loop's target alive.
struct Dispatcher {
    agent: Weak<AgentInner>,
}

#[async_trait]
impl Delivery for Dispatcher {
    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        match self.agent.upgrade() {
            Some(inner) => Agent { inner }.dispatch(envelope).await,
            None => Ok(()),
        }
    }
}

impl Agent {
    pub fn builder(id: impl Into<String>, broker: Arc<dyn Broker>) -> AgentBuilder {
        AgentBuilder {
            id: id.into(),
            kind: "Agent".to_string(),
            broker,
            subscribe_broadcast: true,
        }
    }

    /// Create an agent with the built-in `ping` and `stop` handlers.
    pub fn new(id: impl Into<String>, kind: impl Into<String>, broker: Arc<dyn Broker>) -> Result<Self> {
        Self::builder(id, broker).kind(kind).build()
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue
    }

    pub fn state(&self) -> AgentState {
        *self.lock_state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == AgentState::Running
    }

    /// Bind `handler` to `message_type`, replacing any previous handler.
    pub fn register_handler(&self, message_type: &str, handler: Arc<dyn Handler>) -> Result<()> {
        handler::validate_message_type(message_type)?;

        let previous = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(message_type.to_string(), handler);

        if previous.is_some() {
            tracing::debug!(agent_id = %self.inner.id, "Replaced handler for {}", message_type);
        }
        Ok(())
    }

    /// Create the inbound queue and start consuming it.
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            AgentState::Running => return Ok(()),
            AgentState::Stopped => return Err(Error::AgentStopped(self.inner.id.clone())),
            AgentState::Created => {}
        }

        let mut bindings = vec![self.inner.queue.clone()];
        if self.inner.subscribe_broadcast {
            bindings.push(BROADCAST_TOPIC.to_string());
        }
        self.inner
            .broker
            .create_queue(&self.inner.queue, &bindings)
            .await?;

        let dispatcher = Arc::new(Dispatcher {
            agent: Arc::downgrade(&self.inner),
        });
        let handle = self
            .inner
            .broker
            .start_consumer(&self.inner.queue, dispatcher)
            .await
            .map_err(|e| match e {
                Error::QueueBusy(_) => Error::DuplicateAgent(self.inner.id.clone()),
                other => other,
            })?;

        *self.lock_consumer() = Some(handle);
        let stopped_meanwhile = {
            let mut state = self.lock_state();
            if *state == AgentState::Stopped {
                true
            } else {
                *state = AgentState::Running;
                false
            }
        };
        if stopped_meanwhile {
            self.request_stop();
            return Err(Error::AgentStopped(self.inner.id.clone()));
        }

        tracing::info!(
            agent_id = %self.inner.id,
            "{} started on {} via {} broker",
            self.inner.kind,
            self.inner.queue,
            self.inner.broker.name()
        );
        Ok(())
    }

    /// Publish a request to another agent's queue.
    ///
    /// Returns `None` for [`SendMode::FireAndForget`], the correlated reply otherwise.
    pub async fn send_message(
        &self,
        target_agent_id: &str,
        message_type: &str,
        payload: Payload,
        mode: SendMode,
    ) -> Result<Option<Reply>> {
        if self.state() == AgentState::Stopped {
            return Err(Error::AgentStopped(self.inner.id.clone()));
        }

        let target = agent_queue(target_agent_id);
        match mode {
            SendMode::FireAndForget => {
                let envelope = Envelope::new(&self.inner.id, message_type, payload);
                self.inner.broker.publish(&target, &envelope).await?;
                Ok(None)
            }
            SendMode::AwaitReply(timeout) => self
                .inner
                .rpc
                .call(&target, message_type, payload, timeout)
                .await
                .map(Some),
        }
    }

    /// RPC to another agent.
    pub async fn request(
        &self,
        target_agent_id: &str,
        message_type: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Reply> {
        let reply = self
            .send_message(target_agent_id, message_type, payload, SendMode::AwaitReply(timeout))
            .await?;
        reply.ok_or_else(|| Error::Protocol("awaited send produced no reply".to_string()))
    }

    /// Fire-and-forget message to another agent.
    pub async fn tell(&self, target_agent_id: &str, message_type: &str, payload: Payload) -> Result<()> {
        self.send_message(target_agent_id, message_type, payload, SendMode::FireAndForget)
            .await
            .map(|_| ())
    }

    /// Publish to every agent bound to the `broadcast` topic. No reply is expected.
    pub async fn broadcast(&self, message_type: &str, payload: Payload) -> Result<usize> {
        if self.state() == AgentState::Stopped {
            return Err(Error::AgentStopped(self.inner.id.clone()));
        }
        let envelope = Envelope::new(&self.inner.id, message_type, payload);
        self.inner.broker.publish(BROADCAST_TOPIC, &envelope).await
    }

    /// Mark the agent stopped and signal its consumer loop, without waiting.
    ///
    /// Safe to call from a handler running on this agent.
    pub fn request_stop(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), AgentState::Stopped);
        if previous != AgentState::Stopped {
            tracing::info!(agent_id = %self.inner.id, "Agent stopping");
        }

        let handle = self.lock_consumer().take();
        let Some(handle) = handle else {
            return;
        };
        handle.cancel();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let agent = self.clone();
                let task = runtime.spawn(async move { agent.release(handle).await });
                *self.lock_teardown() = Some(task);
            }
            // Left for `stop` to release.
            Err(_) => *self.lock_consumer() = Some(handle),
        }
    }

    /// Stop the agent and wait until its consumer loop has exited and its
    /// inbound queue is released.
    ///
    /// Must not be awaited from a handler on this same agent; use
    /// [`Agent::request_stop`] there.
    pub async fn stop(&self) {
        self.request_stop();
        let handle = self.lock_consumer().take();
        if let Some(handle) = handle {
            self.release(handle).await;
        }
        let teardown = self.lock_teardown().take();
        if let Some(task) = teardown {
            if let Err(e) = task.await {
                tracing::warn!(agent_id = %self.inner.id, "Agent teardown ended abnormally: {}", e);
            }
        }
    }

    /// Wait for the consumer loop, then drop the inbound queue on brokers that do not persist it.
    async fn release(&self, handle: ConsumerHandle) {
        handle.shutdown().await;
        if !self.inner.broker.durable() {
            if let Err(e) = self.inner.broker.delete_queue(&self.inner.queue).await {
                tracing::warn!(agent_id = %self.inner.id, "Failed to delete {}: {}", self.inner.queue, e);
            }
        }
        tracing::info!(agent_id = %self.inner.id, "Agent stopped");
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<()> {
        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&envelope.message_type)
            .cloned();

        let Some(handler) = handler else {
            tracing::warn!(
                agent_id = %self.inner.id,
                correlation_id = %envelope.correlation_id,
                "No handler for message type {} from {}, dropping",
                envelope.message_type,
                envelope.sender_id
            );
            return Ok(());
        };

        tracing::debug!(
            agent_id = %self.inner.id,
            correlation_id = %envelope.correlation_id,
            "Handling {} from {}",
            envelope.message_type,
            envelope.sender_id
        );

        let ctx = AgentContext::new(self.clone());
        let request = Request::from(&envelope);
        // Own task so a panicking handler becomes an error response.
        let outcome = tokio::spawn(async move { handler.handle(ctx, request).await }).await;

        let (body, failure) = match outcome {
            Ok(Ok(data)) => (ResponseBody::Success(data), None),
            Ok(Err(e)) => {
                let message = format!("{:#}", e);
                (ResponseBody::Error(message.clone()), Some(message))
            }
            Err(e) => {
                let message = if e.is_panic() {
                    format!("handler for {} panicked", envelope.message_type)
                } else {
                    format!("handler for {} was cancelled", envelope.message_type)
                };
                (ResponseBody::Error(message.clone()), Some(message))
            }
        };

        if let Some(message) = &failure {
            tracing::warn!(
                agent_id = %self.inner.id,
                correlation_id = %envelope.correlation_id,
                "Handler for {} failed: {}",
                envelope.message_type,
                message
            );
        }

        if let Some(reply_to) = envelope.reply_to.as_deref().filter(|_| envelope.expects_reply()) {
            let response = envelope.create_response(&self.inner.id, body);
            if let Err(e) = self.inner.broker.publish(reply_to, &response).await {
                tracing::warn!(
                    agent_id = %self.inner.id,
                    correlation_id = %envelope.correlation_id,
                    "Failed to publish response to {}: {}",
                    reply_to,
                    e
                );
            }
        }

        match failure {
            Some(message) => Err(Error::Handler(message)),
            None => Ok(()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, AgentState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_consumer(&self) -> MutexGuard<'_, Option<ConsumerHandle>> {
        self.inner
            .consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_teardown(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .teardown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Data of a successful reply, or the reply's error as an `Err`.
pub fn reply_data(reply: Reply) -> Result<Value> {
    if reply.is_success() {
        Ok(reply.data.unwrap_or(Value::Null))
    } else {
        Err(Error::Handler(reply.error.unwrap_or_else(|| "unknown error".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn broker() -> Arc<MemoryBroker> {
        Arc::new(MemoryBroker::new(Duration::from_millis(10)))
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn running(id: &str, broker: &Arc<MemoryBroker>) -> Agent {
        let agent = Agent::new(id, "TestAgent", broker.clone()).unwrap();
        agent.start().await.unwrap();
        agent
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(TIMEOUT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_ping_reports_liveness_and_kind() {
        let broker = broker();
        let worker = Agent::new("writer", "WriterAgent", broker.clone()).unwrap();
        worker.start().await.unwrap();
        let caller = running("caller", &broker).await;

        let reply = caller.request("writer", kinds::PING, Payload::new(), TIMEOUT).await.unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.message_type, "ping_response");
        assert_eq!(reply.field("status"), Some(&json!("alive")));
        assert_eq!(reply.field("agent_type"), Some(&json!("WriterAgent")));
        assert_eq!(reply.agent_id.as_deref(), Some("writer"));

        worker.stop().await;
        caller.stop().await;
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_loop() {
        let broker = broker();
        let worker = Agent::new("worker", "TestAgent", broker.clone()).unwrap();
        worker
            .register_handler(
                "work",
                handler_fn(|_ctx, request| async move {
                    if request.payload.get("fail").is_some() {
                        anyhow::bail!("bad input");
                    }
                    Ok(json!({"done": true}))
                }),
            )
            .unwrap();
        worker.start().await.unwrap();
        let caller = running("caller", &broker).await;

        let first = caller
            .request("worker", "work", payload(json!({"fail": true})), TIMEOUT)
            .await
            .unwrap();
        assert!(!first.is_success());
        assert_eq!(first.error.as_deref(), Some("bad input"));

        let second = caller.request("worker", "work", Payload::new(), TIMEOUT).await.unwrap();
        assert!(second.is_success());
        assert_eq!(second.field("done"), Some(&json!(true)));
        assert!(worker.is_running());
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_error_response() {
        let broker = broker();
        let worker = Agent::new("worker", "TestAgent", broker.clone()).unwrap();
        worker
            .register_handler(
                "explode",
                handler_fn(|_ctx, _request| async move {
                    if true {
                        panic!("boom");
                    }
                    Ok(Value::Null)
                }),
            )
            .unwrap();
        worker.start().await.unwrap();
        let caller = running("caller", &broker).await;

        let reply = caller.request("worker", "explode", Payload::new(), TIMEOUT).await.unwrap();
        assert!(!reply.is_success());
        assert!(reply.error.unwrap().contains("panicked"));

        let ping = caller.request("worker", kinds::PING, Payload::new(), TIMEOUT).await.unwrap();
        assert!(ping.is_success());
    }

    #[tokio::test]
    async fn test_unknown_type_is_dropped_and_times_out() {
        let broker = broker();
        let _worker = running("worker", &broker).await;
        let caller = running("caller", &broker).await;

        let timeout = Duration::from_millis(150);
        let started = Instant::now();
        let err = caller
            .request("worker", "no_such_type", Payload::new(), timeout)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= timeout);
    }

    #[tokio::test]
    async fn test_duplicate_agent_id_rejected() {
        let broker = broker();
        let _first = running("data_miner", &broker).await;

        let second = Agent::new("data_miner", "TestAgent", broker.clone()).unwrap();
        let err = second.start().await.unwrap_err();
        assert!(matches!(err, Error::DuplicateAgent(ref id) if id == "data_miner"));
        assert_eq!(second.state(), AgentState::Created);
    }

    #[tokio::test]
    async fn test_invalid_registrations_rejected() {
        let agent = Agent::new("a", "TestAgent", broker()).unwrap();
        let noop = || handler_fn(|_ctx, _request| async move { Ok(Value::Null) });

        assert!(agent.register_handler("", noop()).is_err());
        assert!(agent.register_handler("two words", noop()).is_err());
        assert!(agent.register_handler("work_response", noop()).is_err());
        assert!(Agent::new("bad id", "TestAgent", broker()).is_err());
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let broker = broker();
        let worker = Agent::new("worker", "TestAgent", broker.clone()).unwrap();
        worker
            .register_handler("which", handler_fn(|_c, _r| async move { Ok(json!("first")) }))
            .unwrap();
        worker
            .register_handler("which", handler_fn(|_c, _r| async move { Ok(json!("second")) }))
            .unwrap();
        worker.start().await.unwrap();
        let caller = running("caller", &broker).await;

        let reply = caller.request("worker", "which", Payload::new(), TIMEOUT).await.unwrap();
        assert_eq!(reply.data, Some(json!("second")));
    }

    #[tokio::test]
    async fn test_stop_message_stops_agent() {
        let broker = broker();
        let worker = running("worker", &broker).await;
        let caller = running("caller", &broker).await;

        let reply = caller.request("worker", kinds::STOP, Payload::new(), TIMEOUT).await.unwrap();
        assert_eq!(reply.field("status"), Some(&json!("stopped")));
        assert_eq!(worker.state(), AgentState::Stopped);

        let err = caller
            .request("worker", kinds::PING, Payload::new(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        wait_for(|| broker.pending_count("agent_worker").is_none()).await;

        // Terminal.
        assert!(matches!(worker.start().await, Err(Error::AgentStopped(_))));
        assert!(matches!(
            worker.tell("caller", kinds::PING, Payload::new()).await,
            Err(Error::AgentStopped(_))
        ));
    }

    #[tokio::test]
    async fn test_stopped_agent_queue_does_not_accumulate() {
        let broker = broker();
        let worker = running("worker", &broker).await;
        let caller = running("caller", &broker).await;

        worker.stop().await;
        assert_eq!(broker.pending_count("agent_worker"), None);
        assert!(!broker.queue_names().contains(&"agent_worker".to_string()));

        for _ in 0..50 {
            caller.tell("worker", "work", Payload::new()).await.unwrap();
        }
        let envelope = Envelope::new("caller", kinds::PING, Payload::new());
        assert_eq!(broker.publish("agent_worker", &envelope).await.unwrap(), 0);
        assert_eq!(broker.pending_count("agent_worker"), None);

        // Still bound while running.
        assert_eq!(broker.pending_count("agent_caller"), Some(0));
        caller.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribed_agents() {
        let broker = broker();
        let seen = Arc::new(AtomicUsize::new(0));
        let mut agents = Vec::new();

        for (id, subscribe) in [("a", true), ("b", true), ("c", false)] {
            let agent = Agent::builder(id, broker.clone()).broadcast(subscribe).build().unwrap();
            let seen = seen.clone();
            agent
                .register_handler(
                    "announce",
                    handler_fn(move |_ctx, _request| {
                        let seen = seen.clone();
                        async move {
                            seen.fetch_add(1, Ordering::SeqCst);
                            Ok(Value::Null)
                        }
                    }),
                )
                .unwrap();
            agent.start().await.unwrap();
            agents.push(agent);
        }

        let reached = agents[0].broadcast("announce", Payload::new()).await.unwrap();
        assert_eq!(reached, 2);
        wait_for(|| seen.load(Ordering::SeqCst) == 2).await;
    }

    #[tokio::test]
    async fn test_fire_and_forget_returns_immediately() {
        let broker = broker();
        let hits = Arc::new(AtomicUsize::new(0));
        let worker = Agent::new("worker", "TestAgent", broker.clone()).unwrap();
        let counter = hits.clone();
        worker
            .register_handler(
                "note",
                handler_fn(move |_ctx, _request| {
                    let counter = counter.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                }),
            )
            .unwrap();
        worker.start().await.unwrap();
        let caller = running("caller", &broker).await;

        let started = Instant::now();
        let reply = caller
            .send_message("worker", "note", Payload::new(), SendMode::FireAndForget)
            .await
            .unwrap();
        assert!(reply.is_none());
        assert!(started.elapsed() < Duration::from_millis(100));
        wait_for(|| hits.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_bad_payload() {
        #[derive(Deserialize)]
        struct Answer {
            query: String,
        }

        let broker = broker();
        let worker = Agent::new("lite_rag", "LiteRagAgent", broker.clone()).unwrap();
        worker
            .register_handler(
                kinds::ANSWER_QUERY,
                typed(|_ctx, request: Answer| async move {
                    Ok(json!({"answer": format!("about {}", request.query)}))
                }),
            )
            .unwrap();
        worker.start().await.unwrap();
        let caller = running("caller", &broker).await;

        let ok = caller
            .request("lite_rag", kinds::ANSWER_QUERY, payload(json!({"query": "rust"})), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(reply_data(ok).unwrap()["answer"], json!("about rust"));

        let bad = caller
            .request("lite_rag", kinds::ANSWER_QUERY, Payload::new(), TIMEOUT)
            .await
            .unwrap();
        assert!(!bad.is_success());
        assert!(reply_data(bad).is_err());
    }
}
