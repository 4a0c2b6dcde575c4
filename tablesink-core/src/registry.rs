//! [DestinationRegistry] owns one [BatchBuffer] per destination key for the whole process. The
//! first message for a destination creates its buffer, every later one reuses it, and buffers
//! that saw no records for the idle timeout are flushed, stopped and forgotten.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::buffer::BatchBuffer;
use crate::config::FlushPolicy;
use crate::status::StatusNotifier;
use crate::storage::Storage;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct DestinationRegistry {
    buffers: RwLock<HashMap<String, Arc<BatchBuffer>>>,
    storage: Arc<dyn Storage>,
    notifier: StatusNotifier,
    idle_timeout: Duration,
}

impl DestinationRegistry {
    pub fn new(storage: Arc<dyn Storage>, notifier: StatusNotifier, idle_timeout: Duration) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            storage,
            notifier,
            idle_timeout,
        }
    }

    /// Returns the buffer for `destination`, creating it with `policy` if there is none. Callers
    /// racing on a new key all get the same instance. The policy of an existing buffer is never
    /// changed, a new policy only takes effect once the buffer has been evicted.
    pub fn resolve(&self, destination: &str, policy: &FlushPolicy) -> Arc<BatchBuffer> {
        if let Some(buffer) = self.buffers.read().get(destination) {
            return Arc::clone(buffer);
        }

        let mut buffers = self.buffers.write();
        let buffer = buffers.entry(destination.to_string()).or_insert_with(|| {
            info!(destination, ?policy, "Creating batch buffer");
            Arc::new(BatchBuffer::new(
                destination,
                policy.clone(),
                Arc::clone(&self.storage),
                self.notifier.clone(),
            ))
        });
        Arc::clone(buffer)
    }

    /// Flushes and removes every buffer idle for at least the idle timeout, returns how many were
    /// evicted. A buffer whose flush fails stays registered with its queue intact and is retried
    /// on the next sweep. Flushes run without the map lock so other destinations keep resolving.
    pub async fn evict_idle(&self) -> usize {
        let idle: Vec<(String, Arc<BatchBuffer>)> = {
            let now = Instant::now();
            self.buffers
                .read()
                .iter()
                .filter(|(_, buffer)| self.is_idle(buffer, now))
                .map(|(destination, buffer)| (destination.clone(), Arc::clone(buffer)))
                .collect()
        };
        if idle.is_empty() {
            return 0;
        }

        let mut flushed = Vec::with_capacity(idle.len());
        for (destination, buffer) in idle {
            match buffer.flush().await {
                Ok(()) => flushed.push((destination, buffer)),
                Err(e) => {
                    error!(%destination, ?e, "Idle flush failed, keeping batch buffer");
                }
            }
        }

        // a buffer that took records since it was flushed is no longer idle
        let evicted: Vec<Arc<BatchBuffer>> = {
            let now = Instant::now();
            let mut buffers = self.buffers.write();
            let mut evicted = Vec::with_capacity(flushed.len());
            for (destination, buffer) in flushed {
                let unchanged = buffers
                    .get(&destination)
                    .is_some_and(|current| Arc::ptr_eq(current, &buffer));
                if !unchanged || !self.is_idle(&buffer, now) {
                    continue;
                }
                if let Some(buffer) = buffers.remove(&destination) {
                    evicted.push(buffer);
                }
            }
            evicted
        };

        if evicted.is_empty() {
            return 0;
        }
        info!(count = evicted.len(), "Evicting idle batch buffers");
        Self::stop_all(&evicted).await;
        evicted.len()
    }

    fn is_idle(&self, buffer: &BatchBuffer, now: Instant) -> bool {
        now.duration_since(buffer.last_activity()) >= self.idle_timeout
    }

    /// Runs [DestinationRegistry::evict_idle] every `interval` until `cancel` fires.
    pub fn start_idle_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Stopping idle buffer sweeper");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = registry.evict_idle().await;
                        debug!(evicted, remaining = registry.len(), "Idle buffer sweep done");
                    }
                }
            }
        })
    }

    /// Stops every buffer, each with a final flush. Used on shutdown.
    pub async fn shutdown_all(&self) {
        let buffers: Vec<Arc<BatchBuffer>> =
            self.buffers.write().drain().map(|(_, buffer)| buffer).collect();
        info!(count = buffers.len(), "Stopping all batch buffers");
        Self::stop_all(&buffers).await;
    }

    async fn stop_all(buffers: &[Arc<BatchBuffer>]) {
        let results = join_all(buffers.iter().map(|buffer| buffer.stop())).await;
        for (buffer, result) in buffers.iter().zip(results) {
            if let Err(e) = result {
                error!(destination = buffer.destination(), ?e, "Failed to stop batch buffer");
            }
        }
    }

    pub fn contains(&self, destination: &str) -> bool {
        self.buffers.read().contains_key(destination)
    }

    pub fn len(&self) -> usize {
        self.buffers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.read().is_empty()
    }
}
