//! Message broker: topic routing from publishers to named queues.
//!
//! Two interchangeable strategies implement [`Broker`]:
//! - [`MemoryBroker`]: process-local routing tables, best-effort delivery
//! - [`SpoolBroker`]: durable file spool with ack/nack and redelivery
//!
//! [`connect`] picks one from configuration and degrades to the in-memory
//! strategy when the transport cannot be opened. Nothing downstream knows
//! which one it got.

pub mod lock;
pub mod memory;
pub mod spool;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::protocol::Envelope;

pub use memory::MemoryBroker;
pub use spool::SpoolBroker;

/// Receiver side of a consumer loop.
///
/// Returning `Err` negatively acknowledges the envelope: transports that
/// track acknowledgement drop it without requeue.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, envelope: Envelope) -> Result<()>;
}

/// Publish/subscribe contract shared by every broker strategy.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Strategy name, for logs.
    fn name(&self) -> &str;

    /// Whether queues outlive their consumers. Agents keep a durable queue
    /// across stops so a restarted agent drains the backlog; otherwise the
    /// queue is deleted once its consumer exits.
    fn durable(&self) -> bool {
        false
    }

    /// Register a queue and bind it to routing keys. Idempotent.
    async fn create_queue(&self, name: &str, routing_keys: &[String]) -> Result<()>;

    /// Enqueue the envelope on every queue bound to `routing_key`.
    ///
    /// Returns the number of queues reached. Never waits on consumers.
    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<usize>;

    /// Start the background loop feeding `queue` into `delivery`.
    async fn start_consumer(&self, queue: &str, delivery: Arc<dyn Delivery>) -> Result<ConsumerHandle>;

    /// Remove a queue and its bindings. Missing queues are ignored.
    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Release transport resources and stop all consumer loops. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Which broker strategy to build.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BrokerStrategy {
    /// In-process routing tables
    #[default]
    Memory,
    /// Durable file spool shared between processes
    Spool,
}

impl std::fmt::Display for BrokerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerStrategy::Memory => write!(f, "memory"),
            BrokerStrategy::Spool => write!(f, "spool"),
        }
    }
}

/// Build the configured broker, falling back to memory if the transport is unreachable.
pub fn connect(config: &BrokerConfig) -> Arc<dyn Broker> {
    let poll_interval = Duration::from_millis(config.poll_interval_ms);

    match config.strategy {
        BrokerStrategy::Memory => {
            tracing::info!("Using in-memory message broker");
            Arc::new(MemoryBroker::new(poll_interval))
        }
        BrokerStrategy::Spool => match config.resolve_spool_dir() {
            Ok(dir) => match SpoolBroker::connect(&dir, poll_interval) {
                Ok(broker) => {
                    tracing::info!("Using spool message broker at {}", dir.display());
                    Arc::new(broker)
                }
                Err(e) => {
                    tracing::warn!(
                        "Could not open spool transport at {}: {}. Falling back to in-memory broker",
                        dir.display(),
                        e
                    );
                    Arc::new(MemoryBroker::new(poll_interval))
                }
            },
            Err(e) => {
                tracing::warn!("No spool directory available: {}. Falling back to in-memory broker", e);
                Arc::new(MemoryBroker::new(poll_interval))
            }
        },
    }
}

/// Handle to a running consumer loop.
#[derive(Debug)]
pub struct ConsumerHandle {
    queue: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Spawn a consumer loop. The loop receives a shutdown signal it must watch.
    pub(crate) fn spawn<F, Fut>(queue: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(body(rx));
        Self {
            queue: queue.into(),
            shutdown,
            task,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Ask the loop to exit after its current delivery. Safe to call from
    /// inside the loop's own delivery.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Cancel and wait for the loop to finish. Must not be awaited from
    /// inside the loop's own delivery.
    pub async fn shutdown(self) {
        self.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Consumer loop for {} ended abnormally: {}", self.queue, e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Wait until either the consumer's own shutdown or the broker-wide close fires.
pub(crate) async fn stop_requested(
    shutdown: &mut watch::Receiver<bool>,
    closing: &mut watch::Receiver<bool>,
) {
    tokio::select! {
        _ = wait_true(shutdown) => {}
        _ = wait_true(closing) => {}
    }
}

async fn wait_true(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: treat as a stop request.
            return;
        }
    }
}

pub(crate) fn is_set(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}
