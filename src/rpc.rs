//! Request/response calls over the asynchronous broker.
//!
//! Each call owns an ephemeral reply queue bound only to its own name. The
//! listener on that queue accepts the first envelope carrying the call's
//! correlation id and ignores everything else. The queue is torn down on
//! every exit path, including a caller dropping the call future, so a reply
//! arriving after the deadline has nowhere to go.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::broker::{Broker, Delivery};
use crate::error::{Error, Result};
use crate::protocol::envelope::generate_id;
use crate::protocol::{Envelope, Payload, Reply};

/// Prefix of every ephemeral reply queue.
pub const REPLY_QUEUE_PREFIX: &str = "rpc_reply_";

/// Issues correlated calls on behalf of one sender.
#[derive(Clone)]
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    sender_id: String,
}

/// Owns an ephemeral reply queue until the call tears it down itself.
///
/// A call future dropped mid-flight (an outer timeout or `select!`) never
/// reaches its own cleanup, so the guard schedules the deletion on drop.
struct ReplyQueueGuard {
    broker: Arc<dyn Broker>,
    queue: Option<String>,
}

impl ReplyQueueGuard {
    fn new(broker: Arc<dyn Broker>, queue: &str) -> Self {
        Self {
            broker,
            queue: Some(queue.to_string()),
        }
    }

    async fn release(mut self) {
        if let Some(queue) = self.queue.take() {
            delete_reply_queue(self.broker.as_ref(), &queue).await;
        }
    }
}

impl Drop for ReplyQueueGuard {
    fn drop(&mut self) {
        let Some(queue) = self.queue.take() else {
            return;
        };
        let broker = self.broker.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!(queue = %queue, "Call abandoned, scheduling reply queue removal");
                runtime.spawn(async move { delete_reply_queue(broker.as_ref(), &queue).await });
            }
            Err(_) => tracing::warn!(queue = %queue, "No runtime left to delete abandoned reply queue"),
        }
    }
}

async fn delete_reply_queue(broker: &dyn Broker, queue: &str) {
    if let Err(e) = broker.delete_queue(queue).await {
        tracing::warn!(queue = %queue, "Failed to delete reply queue: {}", e);
    }
}

/// Pending call record: which correlation id to accept and where to put it.
struct ReplyListener {
    correlation_id: String,
    started_at: Instant,
    slot: Mutex<Option<oneshot::Sender<Envelope>>>,
}

#[async_trait]
impl Delivery for ReplyListener {
    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        if envelope.correlation_id != self.correlation_id {
            tracing::debug!(
                correlation_id = %self.correlation_id,
                "Ignoring reply for foreign correlation id {}",
                envelope.correlation_id
            );
            return Ok(());
        }

        let sender = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(tx) => {
                tracing::debug!(
                    correlation_id = %self.correlation_id,
                    "Reply {} arrived after {:?}",
                    envelope.message_type,
                    self.started_at.elapsed()
                );
                // Receiver gone means the caller already timed out.
                let _ = tx.send(envelope);
            }
            None => {
                tracing::debug!(correlation_id = %self.correlation_id, "Ignoring duplicate reply");
            }
        }
        Ok(())
    }
}

impl RpcClient {
    pub fn new(broker: Arc<dyn Broker>, sender_id: impl Into<String>) -> Self {
        Self {
            broker,
            sender_id: sender_id.into(),
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Publish `message_type` to `target` and wait up to `timeout` for the correlated reply.
    ///
    /// A timeout means the outcome is unknown: the remote handler is not cancelled.
    pub async fn call(
        &self,
        target: &str,
        message_type: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Reply> {
        let correlation_id = generate_id();
        let reply_queue = format!("{}{}", REPLY_QUEUE_PREFIX, generate_id());

        self.broker
            .create_queue(&reply_queue, std::slice::from_ref(&reply_queue))
            .await?;
        let guard = ReplyQueueGuard::new(self.broker.clone(), &reply_queue);

        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(ReplyListener {
            correlation_id: correlation_id.clone(),
            started_at: Instant::now(),
            slot: Mutex::new(Some(tx)),
        });

        let outcome = match self.broker.start_consumer(&reply_queue, listener).await {
            Ok(handle) => {
                let outcome = self
                    .exchange(target, message_type, payload, &reply_queue, &correlation_id, rx, timeout)
                    .await;
                handle.shutdown().await;
                outcome
            }
            Err(e) => Err(e),
        };

        guard.release().await;
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &self,
        target: &str,
        message_type: &str,
        payload: Payload,
        reply_queue: &str,
        correlation_id: &str,
        rx: oneshot::Receiver<Envelope>,
        timeout: Duration,
    ) -> Result<Reply> {
        let envelope = Envelope::new(&self.sender_id, message_type, payload)
            .with_correlation_id(correlation_id)
            .with_reply_to(reply_queue);

        let reached = self.broker.publish(target, &envelope).await?;
        if reached == 0 {
            tracing::warn!(
                correlation_id = %correlation_id,
                "No queue bound to {}; {} will likely time out",
                target,
                message_type
            );
        } else {
            tracing::debug!(correlation_id = %correlation_id, "Sent {} to {}", message_type, target);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Reply::from_envelope(&response),
            Ok(Err(_)) => Err(Error::Transport(format!(
                "reply listener for {} closed before a reply arrived",
                target
            ))),
            Err(_) => {
                tracing::warn!(correlation_id = %correlation_id, "{} to {} timed out", message_type, target);
                Err(Error::Timeout {
                    target: target.to_string(),
                    timeout,
                })
            }
        }
    }
}
