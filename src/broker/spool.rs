//! Durable file-spool broker.
//!
//! Layout under the spool root:
//! - bindings.json          : queue -> routing keys, rewritten under a lock file
//! - queues/<q>/incoming/   : published, not yet claimed
//! - queues/<q>/processing/ : claimed by a consumer, awaiting ack
//! - queues/<q>/dead/       : negatively acknowledged or unreadable
//! - queues/<q>/tmp/        : partial writes, renamed into incoming when complete
//! - queues/<q>/consumer.lock : held by the queue's one consumer, refreshed while it runs
//!
//! Several processes may share one spool root. A consumer claims an envelope
//! by renaming it into `processing/`; the first rename wins. Only the holder
//! of the consumer lock may requeue what is left in `processing/`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use super::lock::{try_acquire, with_lock};
use super::{is_set, stop_requested, Broker, ConsumerHandle, Delivery};
use crate::error::{Error, Result};
use crate::protocol::Envelope;

pub const BINDINGS_FILE: &str = "bindings.json";
pub const QUEUES_DIR: &str = "queues";
pub const SPOOL_INCOMING: &str = "incoming";
pub const SPOOL_PROCESSING: &str = "processing";
pub const SPOOL_DEAD: &str = "dead";
pub const SPOOL_TMP: &str = "tmp";
pub const CONSUMER_LOCK: &str = "consumer";

const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Consumer lock refresh period, well inside the lock's staleness window.
const CONSUMER_HEARTBEAT: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Serialize, Deserialize)]
struct BindingTable {
    #[serde(default)]
    queues: BTreeMap<String, BTreeSet<String>>,
}

impl BindingTable {
    fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn queues_for(&self, routing_key: &str) -> Vec<String> {
        self.queues
            .iter()
            .filter(|(_, keys)| keys.contains(routing_key))
            .map(|(queue, _)| queue.clone())
            .collect()
    }
}

/// Directories belonging to one spooled queue.
#[derive(Debug, Clone)]
struct QueueDirs {
    base: PathBuf,
    incoming: PathBuf,
    processing: PathBuf,
    dead: PathBuf,
    tmp: PathBuf,
}

impl QueueDirs {
    fn new(root: &Path, queue: &str) -> Self {
        let base = root.join(QUEUES_DIR).join(queue);
        Self {
            incoming: base.join(SPOOL_INCOMING),
            processing: base.join(SPOOL_PROCESSING),
            dead: base.join(SPOOL_DEAD),
            tmp: base.join(SPOOL_TMP),
            base,
        }
    }

    fn consumer_lock(&self) -> PathBuf {
        self.base.join(CONSUMER_LOCK)
    }

    fn ensure(&self) -> Result<()> {
        for dir in [&self.incoming, &self.processing, &self.dead, &self.tmp] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    fn exists(&self) -> bool {
        self.incoming.is_dir()
    }

    /// Move everything left in `processing/` back to `incoming/`.
    fn recover_orphaned(&self) -> Result<usize> {
        let mut recovered = 0;
        for path in json_files(&self.processing)? {
            let Some(name) = path.file_name() else {
                continue;
            };
            if fs::rename(&path, self.incoming.join(name)).is_ok() {
                tracing::info!("Recovered orphaned envelope: {}", name.to_string_lossy());
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Claim the oldest readable envelope in `incoming/`.
    fn claim_next(&self) -> Result<Option<(PathBuf, Envelope)>> {
        for path in json_files(&self.incoming)? {
            let Some(name) = path.file_name() else {
                continue;
            };
            let claimed = self.processing.join(name);
            match fs::rename(&path, &claimed) {
                Ok(()) => {}
                // Another consumer got there first.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            let parsed = fs::read_to_string(&claimed)
                .map_err(Error::from)
                .and_then(|raw| Envelope::from_json(&raw).map_err(Error::from));
            match parsed {
                Ok(envelope) => return Ok(Some((claimed, envelope))),
                Err(e) => {
                    tracing::warn!("Unreadable envelope {}: {}", claimed.display(), e);
                    self.bury(&claimed);
                }
            }
        }
        Ok(None)
    }

    fn ack(&self, claimed: &Path) {
        if let Err(e) = fs::remove_file(claimed) {
            tracing::warn!("Failed to ack {}: {}", claimed.display(), e);
        }
    }

    /// Negative acknowledgement: no requeue.
    fn bury(&self, claimed: &Path) {
        let Some(name) = claimed.file_name() else {
            return;
        };
        if let Err(e) = fs::rename(claimed, self.dead.join(name)) {
            tracing::warn!("Failed to dead-letter {}: {}", claimed.display(), e);
        }
    }
}

/// Sorted `.json` files in a directory; a missing directory is empty.
fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Broker backed by a directory tree that survives restarts.
pub struct SpoolBroker {
    root: PathBuf,
    poll_interval: Duration,
    closing: watch::Sender<bool>,
    seq: AtomicU64,
}

impl SpoolBroker {
    /// Open (creating if needed) a spool rooted at `root`.
    pub fn connect(root: &Path, poll_interval: Duration) -> Result<Self> {
        let queues = root.join(QUEUES_DIR);
        fs::create_dir_all(&queues).map_err(|e| {
            Error::Transport(format!("cannot create spool at {}: {}", root.display(), e))
        })?;

        let write_check = root.join(format!(".write-check-{}", ulid::Ulid::new()));
        fs::write(&write_check, b"ok")
            .and_then(|_| fs::remove_file(&write_check))
            .map_err(|e| {
                Error::Transport(format!("spool at {} is not writable: {}", root.display(), e))
            })?;

        let (closing, _) = watch::channel(false);
        Ok(Self {
            root: root.to_path_buf(),
            poll_interval,
            closing,
            seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Envelopes waiting in a queue's `incoming/`.
    pub fn pending_count(&self, queue: &str) -> Result<usize> {
        Ok(json_files(&QueueDirs::new(&self.root, queue).incoming)?.len())
    }

    /// Envelopes a queue has dead-lettered.
    pub fn dead_letter_count(&self, queue: &str) -> Result<usize> {
        Ok(json_files(&QueueDirs::new(&self.root, queue).dead)?.len())
    }

    fn bindings_path(&self) -> PathBuf {
        self.root.join(BINDINGS_FILE)
    }

    fn is_closed(&self) -> bool {
        *self.closing.borrow()
    }

    fn next_file_name(&self) -> String {
        let micros = chrono::Utc::now().timestamp_micros();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{:016}-{:08}-{}.json", micros, seq, ulid::Ulid::new())
    }

    fn enqueue(&self, dirs: &QueueDirs, raw: &str) -> Result<()> {
        let name = self.next_file_name();
        let tmp = dirs.tmp.join(&name);
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, dirs.incoming.join(&name))?;
        Ok(())
    }
}

/// Run lock-guarded filesystem work off the async workers.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Transport(format!("spool worker failed: {}", e)))?
}

#[async_trait]
impl Broker for SpoolBroker {
    fn name(&self) -> &str {
        "spool"
    }

    fn durable(&self) -> bool {
        true
    }

    async fn create_queue(&self, name: &str, routing_keys: &[String]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport("broker is closed".to_string()));
        }

        let dirs = QueueDirs::new(&self.root, name);
        let path = self.bindings_path();
        let queue = name.to_string();
        let new_keys = routing_keys.to_vec();
        blocking(move || {
            dirs.ensure()?;
            with_lock(&path, LOCK_TIMEOUT, || {
                let mut table = BindingTable::load(&path)?;
                let keys = table.queues.entry(queue).or_default();
                let before = keys.len();
                keys.extend(new_keys);
                if keys.len() != before || before == 0 {
                    table.save(&path)?;
                }
                Ok(())
            })
        })
        .await?;

        tracing::debug!(queue = %name, "Spool queue ready, bound to {:?}", routing_keys);
        Ok(())
    }

    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Transport("broker is closed".to_string()));
        }

        let targets = BindingTable::load(&self.bindings_path())?.queues_for(routing_key);
        if targets.is_empty() {
            tracing::debug!(
                correlation_id = %envelope.correlation_id,
                "No queue bound to {}, dropping {}",
                routing_key,
                envelope.message_type
            );
            return Ok(0);
        }

        let raw = envelope.to_json()?;
        let mut delivered = 0;
        for queue in &targets {
            let dirs = QueueDirs::new(&self.root, queue);
            match self.enqueue(&dirs, &raw) {
                Ok(()) => delivered += 1,
                // Deleted between reading bindings and writing.
                Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => {
                    tracing::debug!(queue = %queue, "Queue vanished during publish");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(delivered)
    }

    async fn start_consumer(&self, queue: &str, delivery: Arc<dyn Delivery>) -> Result<ConsumerHandle> {
        if self.is_closed() {
            return Err(Error::Transport("broker is closed".to_string()));
        }

        let dirs = QueueDirs::new(&self.root, queue);
        if !dirs.exists() {
            return Err(Error::QueueNotFound(queue.to_string()));
        }

        // Held for the loop's lifetime; a live holder in any process means busy.
        let Some(consumer_lock) = try_acquire(&dirs.consumer_lock())? else {
            return Err(Error::QueueBusy(queue.to_string()));
        };
        let consumer_lock = Arc::new(consumer_lock);

        match dirs.recover_orphaned() {
            Ok(0) => {}
            Ok(n) => tracing::info!(queue = %queue, "Requeued {} unacknowledged envelopes", n),
            Err(e) => tracing::warn!(queue = %queue, "Failed to recover processing: {}", e),
        }

        let (wake_tx, mut wake_rx) = mpsc::unbounded_channel::<()>();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = wake_tx.send(());
            }
        })
        .and_then(|mut watcher| {
            watcher.watch(&dirs.incoming, RecursiveMode::NonRecursive)?;
            Ok(watcher)
        });
        let watcher = match watcher {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(queue = %queue, "File watcher unavailable, polling only: {}", e);
                None
            }
        };

        let mut closing = self.closing.subscribe();
        let poll_interval = self.poll_interval;
        let queue_name = queue.to_string();

        Ok(ConsumerHandle::spawn(queue, move |mut shutdown| async move {
            let _watcher = watcher;
            let heartbeat = {
                let consumer_lock = consumer_lock.clone();
                let queue_name = queue_name.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(CONSUMER_HEARTBEAT);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        if let Err(e) = consumer_lock.refresh() {
                            tracing::debug!(queue = %queue_name, "Consumer lock refresh failed: {}", e);
                        }
                    }
                })
            };
            tracing::debug!(queue = %queue_name, "Spool consumer started");

            loop {
                if is_set(&shutdown) || is_set(&closing) || !dirs.exists() {
                    break;
                }

                match dirs.claim_next() {
                    Ok(Some((claimed, envelope))) => {
                        let correlation_id = envelope.correlation_id.clone();
                        match delivery.deliver(envelope).await {
                            Ok(()) => dirs.ack(&claimed),
                            Err(e) => {
                                tracing::warn!(
                                    queue = %queue_name,
                                    correlation_id = %correlation_id,
                                    "Delivery failed, dead-lettering: {}",
                                    e
                                );
                                dirs.bury(&claimed);
                            }
                        }
                    }
                    Ok(None) => {
                        tokio::select! {
                            _ = stop_requested(&mut shutdown, &mut closing) => break,
                            Some(()) = wake_rx.recv() => {}
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                    Err(e) => {
                        tracing::warn!(queue = %queue_name, "Spool read failed: {}", e);
                        tokio::select! {
                            _ = stop_requested(&mut shutdown, &mut closing) => break,
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                }
            }

            heartbeat.abort();
            let _ = heartbeat.await;
            drop(consumer_lock);
            tracing::debug!(queue = %queue_name, "Spool consumer stopped");
        }))
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let path = self.bindings_path();
        let base = QueueDirs::new(&self.root, name).base;
        let queue = name.to_string();
        let removed = blocking(move || {
            with_lock(&path, LOCK_TIMEOUT, || {
                let mut table = BindingTable::load(&path)?;
                if table.queues.remove(&queue).is_some() {
                    table.save(&path)?;
                }
                Ok(())
            })?;

            match fs::remove_dir_all(&base) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
        .await?;

        if removed {
            tracing::debug!(queue = %name, "Deleted spool queue");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closing.send_replace(true) {
            tracing::info!("Spool broker at {} closed", self.root.display());
        }
        Ok(())
    }
}
