//! In-process broker: routing tables and FIFO buffers behind a mutex.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};

use super::{is_set, stop_requested, Broker, ConsumerHandle, Delivery};
use crate::error::{Error, Result};
use crate::protocol::Envelope;

/// Default fallback poll interval for consumer loops.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct QueueState {
    bindings: BTreeSet<String>,
    pending: VecDeque<Envelope>,
    wake: Arc<Notify>,
    consuming: bool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            bindings: BTreeSet::new(),
            pending: VecDeque::new(),
            wake: Arc::new(Notify::new()),
            consuming: false,
        }
    }
}

#[derive(Default)]
struct Tables {
    queues: HashMap<String, QueueState>,
    /// routing key -> bound queues
    routes: HashMap<String, BTreeSet<String>>,
}

/// Process-local, non-durable broker.
///
/// Publishing appends to every bound queue and wakes its consumer; the
/// consumer also re-checks its buffer every `poll_interval`.
pub struct MemoryBroker {
    tables: Arc<Mutex<Tables>>,
    poll_interval: Duration,
    closing: watch::Sender<bool>,
}

impl MemoryBroker {
    pub fn new(poll_interval: Duration) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            poll_interval,
            closing,
        }
    }

    /// Envelopes waiting on a queue, or `None` if the queue does not exist.
    pub fn pending_count(&self, queue: &str) -> Option<usize> {
        lock(&self.tables).queues.get(queue).map(|q| q.pending.len())
    }

    /// Routing keys a queue is bound to.
    pub fn bindings(&self, queue: &str) -> Option<Vec<String>> {
        lock(&self.tables)
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().cloned().collect())
    }

    /// Names of all live queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.tables).queues.keys().cloned().collect();
        names.sort();
        names
    }

    fn is_closed(&self) -> bool {
        *self.closing.borrow()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

fn lock(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_queue(&self, name: &str, routing_keys: &[String]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport("broker is closed".to_string()));
        }

        let mut tables = lock(&self.tables);
        let state = tables
            .queues
            .entry(name.to_string())
            .or_insert_with(QueueState::new);

        let added: Vec<String> = routing_keys
            .iter()
            .filter(|key| state.bindings.insert((*key).clone()))
            .cloned()
            .collect();

        for key in &added {
            tables
                .routes
                .entry(key.clone())
                .or_default()
                .insert(name.to_string());
        }

        if !added.is_empty() {
            tracing::debug!(queue = %name, "Bound queue to {:?}", added);
        }
        Ok(())
    }

    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Transport("broker is closed".to_string()));
        }

        let mut tables = lock(&self.tables);
        let Some(targets) = tables.routes.get(routing_key).cloned() else {
            tracing::debug!(
                correlation_id = %envelope.correlation_id,
                "No queue bound to {}, dropping {}",
                routing_key,
                envelope.message_type
            );
            return Ok(0);
        };

        let mut delivered = 0;
        for queue in &targets {
            if let Some(state) = tables.queues.get_mut(queue) {
                state.pending.push_back(envelope.clone());
                state.wake.notify_one();
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn start_consumer(&self, queue: &str, delivery: Arc<dyn Delivery>) -> Result<ConsumerHandle> {
        if self.is_closed() {
            return Err(Error::Transport("broker is closed".to_string()));
        }

        let wake = {
            let mut tables = lock(&self.tables);
            let state = tables
                .queues
                .get_mut(queue)
                .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;
            if state.consuming {
                return Err(Error::QueueBusy(queue.to_string()));
            }
            state.consuming = true;
            state.wake.clone()
        };

        let tables = self.tables.clone();
        let mut closing = self.closing.subscribe();
        let poll_interval = self.poll_interval;
        let queue_name = queue.to_string();

        Ok(ConsumerHandle::spawn(queue, move |mut shutdown| async move {
            tracing::debug!(queue = %queue_name, "Consumer loop started");

            loop {
                if is_set(&shutdown) || is_set(&closing) {
                    break;
                }

                let next = {
                    let mut tables = lock(&tables);
                    match tables.queues.get_mut(&queue_name) {
                        Some(state) => state.pending.pop_front(),
                        None => break,
                    }
                };

                match next {
                    Some(envelope) => {
                        let correlation_id = envelope.correlation_id.clone();
                        if let Err(e) = delivery.deliver(envelope).await {
                            tracing::warn!(
                                queue = %queue_name,
                                correlation_id = %correlation_id,
                                "Delivery failed: {}",
                                e
                            );
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = stop_requested(&mut shutdown, &mut closing) => break,
                            _ = wake.notified() => {}
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                }
            }

            if let Some(state) = lock(&tables).queues.get_mut(&queue_name) {
                state.consuming = false;
            }
            tracing::debug!(queue = %queue_name, "Consumer loop stopped");
        }))
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut tables = lock(&self.tables);
        if let Some(state) = tables.queues.remove(name) {
            for key in &state.bindings {
                if let Some(queues) = tables.routes.get_mut(key) {
                    queues.remove(name);
                    if queues.is_empty() {
                        tables.routes.remove(key);
                    }
                }
            }
            state.wake.notify_one();
            tracing::debug!(queue = %name, "Deleted queue ({} undelivered)", state.pending.len());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closing.send_replace(true) {
            return Ok(());
        }
        let tables = lock(&self.tables);
        for state in tables.queues.values() {
            state.wake.notify_one();
        }
        tracing::info!("In-memory broker closed");
        Ok(())
    }
}
