//! Per-destination [BatchBuffer]. Records are queued in memory and written to the destination
//! table when either the batch size is reached (flush is spawned off the caller's path) or the
//! batch window elapses (background task). Both triggers, and `stop`, go through the same
//! buffer lock, so flushes of one destination are totally ordered and each one sees every record
//! added before it started.
//!
//! A flush is at-least-once: rows are inserted one by one, and on an insert failure the rows
//! already committed are dropped from the queue while the rest stays queued for the next trigger.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::FlushPolicy;
use crate::error::Error;
use crate::message::{Record, Status};
use crate::status::StatusNotifier;
use crate::storage::{self, Identifier, Storage};

/// Column added to every record when the policy asks for ingestion timestamps.
pub const TIMESTAMP_COLUMN: &str = "_timestamp";

/// Buffer of pending records for one destination.
pub struct BatchBuffer {
    inner: Arc<BufferInner>,
    flush_timer: SyncMutex<Option<FlushTimer>>,
}

struct FlushTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct BufferInner {
    destination: String,
    table: Identifier,
    policy: FlushPolicy,
    storage: Arc<dyn Storage>,
    notifier: StatusNotifier,
    state: Mutex<BufferState>,
    /// Kept outside `state` so idle checks never wait behind a flush doing storage I/O.
    last_activity: SyncMutex<Instant>,
}

struct BufferState {
    pending: Vec<Record>,
    /// Sources that contributed to `pending`, notified once their records are flushed.
    sources: BTreeSet<String>,
    last_flush: Instant,
    table_provisioned: bool,
    /// A size-triggered flush has been spawned but has not started yet.
    flush_scheduled: bool,
    closed: bool,
}

impl BatchBuffer {
    /// Creates the buffer and, if the policy has a usable batch window, starts its background
    /// flush task. Must be called within a tokio runtime.
    pub fn new(
        destination: impl Into<String>,
        policy: FlushPolicy,
        storage: Arc<dyn Storage>,
        notifier: StatusNotifier,
    ) -> Self {
        let destination = destination.into();
        let now = Instant::now();
        let inner = Arc::new(BufferInner {
            table: policy.table_name(&destination),
            destination,
            policy,
            storage,
            notifier,
            state: Mutex::new(BufferState {
                pending: Vec::new(),
                sources: BTreeSet::new(),
                last_flush: now,
                table_provisioned: false,
                flush_scheduled: false,
                closed: false,
            }),
            last_activity: SyncMutex::new(now),
        });

        let flush_timer = inner
            .policy
            .background_window()
            .map(|window| FlushTimer::start(Arc::clone(&inner), window));

        Self {
            inner,
            flush_timer: SyncMutex::new(flush_timer),
        }
    }

    pub fn destination(&self) -> &str {
        &self.inner.destination
    }

    pub fn table_name(&self) -> &Identifier {
        &self.inner.table
    }

    /// Queues `records` on behalf of `source_id`. When the queue reaches the batch size a flush is
    /// spawned, this call never waits for it. Fails only once the buffer has been stopped.
    pub async fn add(&self, source_id: &str, mut records: Vec<Record>) -> Result<()> {
        let spawn_flush = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(Error::BufferClosed(self.inner.destination.clone()));
            }

            *self.inner.last_activity.lock() = Instant::now();
            // nothing queued for this source, nothing to report Completed for
            if !records.is_empty() {
                state.sources.insert(source_id.to_string());
            }

            if self.inner.policy.include_timestamp {
                let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
                for record in &mut records {
                    record.insert(
                        TIMESTAMP_COLUMN.to_string(),
                        Value::String(timestamp.clone()),
                    );
                }
            }
            state.pending.append(&mut records);

            let reached = self.inner.policy.size_reached(state.pending.len());
            if reached && !state.flush_scheduled {
                state.flush_scheduled = true;
                true
            } else {
                false
            }
        };

        if spawn_flush {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                if let Err(e) = inner.flush().await {
                    error!(destination = %inner.destination, ?e, "Size triggered flush failed");
                }
            });
        }

        Ok(())
    }

    /// Writes every queued record to the destination table.
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    /// Stops the background flush task and does one final flush. Records still queued after a
    /// failed final flush are lost with the buffer. Any later [BatchBuffer::add] is rejected.
    pub async fn stop(&self) -> Result<()> {
        let flush_timer = self.flush_timer.lock().take();
        if let Some(flush_timer) = flush_timer {
            flush_timer.stop().await;
        }

        let mut state = self.inner.state.lock().await;
        state.closed = true;
        let result = self.inner.flush_locked(&mut state).await;
        if let Err(e) = &result {
            error!(
                destination = %self.inner.destination,
                dropped = state.pending.len(),
                ?e,
                "Final flush failed, dropping pending records"
            );
        }
        info!(destination = %self.inner.destination, "Batch buffer stopped");
        result
    }

    pub fn last_activity(&self) -> Instant {
        *self.inner.last_activity.lock()
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    pub async fn last_flush(&self) -> Instant {
        self.inner.state.lock().await.last_flush
    }
}

impl Drop for BatchBuffer {
    fn drop(&mut self) {
        // a buffer dropped without stop must not leave its timer task running
        if let Some(flush_timer) = self.flush_timer.get_mut().take() {
            flush_timer.cancel.cancel();
        }
    }
}

impl BufferInner {
    async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.flush_scheduled = false;
        self.flush_locked(&mut state).await
    }

    async fn flush_locked(&self, state: &mut BufferState) -> Result<()> {
        let Some(first) = state.pending.first() else {
            return Ok(());
        };

        if !state.table_provisioned {
            let columns: Vec<Identifier> = first.keys().map(Identifier::new).collect();
            self.storage
                .create_table_if_not_exists(&self.table, &columns)
                .await
                .map_err(|e| {
                    Error::Storage(format!(
                        "failed to create table {} for destination {}: {e}",
                        self.table, self.destination
                    ))
                })?;
            state.table_provisioned = true;
            info!(destination = %self.destination, table = %self.table, columns = columns.len(), "Table provisioned");
        }

        let mut inserted = 0;
        let mut failure = None;
        for record in &state.pending {
            if let Err(e) = self
                .storage
                .insert_row(&self.table, &storage::to_row(record))
                .await
            {
                failure = Some(e);
                break;
            }
            inserted += 1;
        }
        // committed rows never go back to storage
        state.pending = state.pending.split_off(inserted);

        if let Some(e) = failure {
            warn!(
                destination = %self.destination,
                inserted,
                remaining = state.pending.len(),
                ?e,
                "Flush aborted, remaining records stay queued"
            );
            return Err(Error::Storage(format!(
                "failed to insert record into {}: {e}",
                self.table
            )));
        }

        let sources = std::mem::take(&mut state.sources);
        state.last_flush = Instant::now();
        debug!(destination = %self.destination, inserted, sources = sources.len(), "Flushed batch");

        for source in &sources {
            self.notifier
                .notify(source, Status::Completed, None, None)
                .await;
        }
        Ok(())
    }
}

impl FlushTimer {
    fn start(inner: Arc<BufferInner>, window: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + window, window);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(destination = %inner.destination, ?window, "Starting background flush");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.flush().await {
                            warn!(destination = %inner.destination, ?e, "Background flush failed");
                        }
                    }
                }
            }
        });
        Self { cancel, handle }
    }

    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(?e, "Background flush task did not exit cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusPublisher;
    use crate::test_utils::{InMemoryStorage, RecordingPublisher, record};
    use serde_json::json;

    struct Fixture {
        storage: Arc<InMemoryStorage>,
        publisher: Arc<RecordingPublisher>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                storage: Arc::new(InMemoryStorage::default()),
                publisher: Arc::new(RecordingPublisher::default()),
            }
        }

        fn buffer(&self, destination: &str, policy: FlushPolicy) -> BatchBuffer {
            BatchBuffer::new(
                destination,
                policy,
                Arc::clone(&self.storage) as Arc<dyn Storage>,
                StatusNotifier::new(Arc::clone(&self.publisher) as Arc<dyn StatusPublisher>),
            )
        }
    }

    fn size_policy(batch_size: usize) -> FlushPolicy {
        FlushPolicy {
            batch_size: Some(batch_size),
            ..Default::default()
        }
    }

    /// Lets spawned flush tasks run to completion.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_end_to_end_size_triggered_flush() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("proc-42", size_policy(3));

        for value in ["1", "2", "3"] {
            buffer
                .add("route-9", vec![record(json!({"a": value}))])
                .await
                .unwrap();
        }
        settle().await;

        let rows = fixture.storage.rows("proc-42");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec![("a".to_string(), Some("1".to_string()))]);
        assert_eq!(rows[2], vec![("a".to_string(), Some("3".to_string()))]);
        assert_eq!(fixture.storage.create_calls(), 1);
        assert_eq!(
            fixture.publisher.statuses_for("route-9"),
            vec![Status::Completed]
        );
        assert_eq!(buffer.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_no_flush_below_threshold() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("proc-1", size_policy(4));

        for i in 0..3 {
            buffer
                .add("route-1", vec![record(json!({"i": i}))])
                .await
                .unwrap();
            settle().await;
            assert_eq!(fixture.storage.total_rows(), 0);
        }
        assert_eq!(buffer.pending_len().await, 3);
        assert!(fixture.publisher.published().is_empty());

        buffer
            .add("route-1", vec![record(json!({"i": 3}))])
            .await
            .unwrap();
        settle().await;
        assert_eq!(fixture.storage.total_rows(), 4);
        assert_eq!(buffer.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_add_never_blocks_on_flush() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("proc-1", size_policy(1));

        // the flush is only spawned, nothing has been written when add returns
        buffer
            .add("route-1", vec![record(json!({"a": "1"}))])
            .await
            .unwrap();
        assert_eq!(fixture.storage.total_rows(), 0);
        settle().await;
        assert_eq!(fixture.storage.total_rows(), 1);
    }

    #[tokio::test]
    async fn test_flush_empty_is_noop() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("proc-1", FlushPolicy::default());

        buffer.flush().await.unwrap();
        assert_eq!(fixture.storage.create_calls(), 0);
        assert!(fixture.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_table_created_from_first_record() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer(
            "proc-1",
            FlushPolicy {
                table_suffix: Some("events".into()),
                ..Default::default()
            },
        );
        assert_eq!(buffer.table_name().raw(), "proc-1_events");

        buffer
            .add(
                "route-1",
                vec![record(json!({"x": "1", "y": "2"})), record(json!({"z": "3"}))],
            )
            .await
            .unwrap();
        buffer.flush().await.unwrap();

        assert_eq!(
            fixture.storage.columns("proc-1_events"),
            Some(vec!["x".to_string(), "y".to_string()])
        );
        // later records keep their own columns, no schema reconciliation
        let rows = fixture.storage.rows("proc-1_events");
        assert_eq!(rows[1], vec![("z".to_string(), Some("3".to_string()))]);
    }

    #[tokio::test]
    async fn test_table_creation_is_idempotent() {
        let fixture = Fixture::new();
        let first = fixture.buffer("proc-1", FlushPolicy::default());
        first
            .add("route-1", vec![record(json!({"a": "1"}))])
            .await
            .unwrap();
        first.flush().await.unwrap();
        first
            .add("route-1", vec![record(json!({"a": "2"}))])
            .await
            .unwrap();
        first.flush().await.unwrap();
        // provisioned once per buffer
        assert_eq!(fixture.storage.create_calls(), 1);

        // a new buffer for the same destination confirms the existing table
        let second = fixture.buffer("proc-1", FlushPolicy::default());
        second
            .add("route-1", vec![record(json!({"a": "3", "b": "4"}))])
            .await
            .unwrap();
        second.flush().await.unwrap();
        assert_eq!(fixture.storage.create_calls(), 2);
        assert_eq!(fixture.storage.columns("proc-1"), Some(vec!["a".to_string()]));
        assert_eq!(fixture.storage.rows("proc-1").len(), 3);
    }

    #[tokio::test]
    async fn test_create_failure_keeps_queue() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("proc-1", FlushPolicy::default());
        fixture.storage.fail_create(true);

        buffer
            .add("route-1", vec![record(json!({"a": "1"}))])
            .await
            .unwrap();
        assert!(matches!(buffer.flush().await, Err(Error::Storage(_))));
        assert_eq!(buffer.pending_len().await, 1);
        assert!(fixture.publisher.published().is_empty());

        fixture.storage.fail_create(false);
        buffer.flush().await.unwrap();
        assert_eq!(fixture.storage.rows("proc-1").len(), 1);
        assert_eq!(fixture.storage.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_partial_insert_failure_keeps_remainder() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("proc-1", FlushPolicy::default());
        let records = (0..5).map(|i| record(json!({"i": i}))).collect();
        buffer.add("route-1", records).await.unwrap();

        fixture.storage.fail_insert_after(Some(2));
        assert!(buffer.flush().await.is_err());
        assert_eq!(fixture.storage.total_rows(), 2);
        assert_eq!(buffer.pending_len().await, 3);
        assert!(fixture.publisher.published().is_empty());

        fixture.storage.fail_insert_after(None);
        buffer.flush().await.unwrap();
        let values: Vec<_> = fixture
            .storage
            .rows("proc-1")
            .into_iter()
            .map(|row| row[0].1.clone().unwrap())
            .collect();
        assert_eq!(values, vec!["0", "1", "2", "3", "4"]);
        assert_eq!(buffer.pending_len().await, 0);
        assert_eq!(
            fixture.publisher.statuses_for("route-1"),
            vec![Status::Completed]
        );
    }

    #[tokio::test]
    async fn test_completed_once_per_source() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("proc-1", FlushPolicy::default());

        buffer
            .add("route-a", vec![record(json!({"a": "1"}))])
            .await
            .unwrap();
        buffer
            .add("route-b", vec![record(json!({"a": "2"}))])
            .await
            .unwrap();
        buffer
            .add("route-a", vec![record(json!({"a": "3"}))])
            .await
            .unwrap();
        buffer.flush().await.unwrap();

        assert_eq!(
            fixture.publisher.statuses_for("route-a"),
            vec![Status::Completed]
        );
        assert_eq!(
            fixture.publisher.statuses_for("route-b"),
            vec![Status::Completed]
        );

        // source set is cleared with the queue
        buffer.flush().await.unwrap();
        assert_eq!(fixture.publisher.published().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_add_reports_nothing() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("proc-1", FlushPolicy::default());

        buffer.add("route-empty", Vec::new()).await.unwrap();
        buffer.flush().await.unwrap();
        buffer
            .add("route-b", vec![record(json!({"a": "1"}))])
            .await
            .unwrap();
        buffer.flush().await.unwrap();

        assert!(fixture.publisher.statuses_for("route-empty").is_empty());
        assert_eq!(
            fixture.publisher.statuses_for("route-b"),
            vec![Status::Completed]
        );
        assert_eq!(buffer.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_timestamp_stamping() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer(
            "proc-1",
            FlushPolicy {
                include_timestamp: true,
                ..Default::default()
            },
        );

        buffer
            .add("route-1", vec![record(json!({"a": "1"})), record(json!({"b": "2"}))])
            .await
            .unwrap();
        buffer.flush().await.unwrap();

        let columns = fixture.storage.columns("proc-1").unwrap();
        assert_eq!(columns, vec!["a".to_string(), TIMESTAMP_COLUMN.to_string()]);
        for row in fixture.storage.rows("proc-1") {
            let (_, timestamp) = row
                .iter()
                .find(|(column, _)| column == TIMESTAMP_COLUMN)
                .expect("timestamp column");
            let timestamp = timestamp.as_deref().unwrap();
            assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
            assert!(timestamp.ends_with('Z'));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_triggered_flush() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer(
            "proc-1",
            FlushPolicy {
                batch_window: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        );

        buffer
            .add("route-1", vec![record(json!({"a": "1"}))])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fixture.storage.total_rows(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fixture.storage.total_rows(), 1);

        buffer
            .add("route-1", vec![record(json!({"a": "2"}))])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fixture.storage.total_rows(), 2);

        buffer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_window_has_no_background_flush() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer(
            "proc-1",
            FlushPolicy {
                batch_window: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        );
        assert!(buffer.flush_timer.lock().is_none());

        buffer
            .add("route-1", vec![record(json!({"a": "1"}))])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fixture.storage.total_rows(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_and_closes() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer(
            "proc-1",
            FlushPolicy {
                batch_size: Some(100),
                batch_window: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        );

        buffer
            .add("route-1", vec![record(json!({"a": "1"}))])
            .await
            .unwrap();
        buffer.stop().await.unwrap();

        assert_eq!(fixture.storage.total_rows(), 1);
        assert!(buffer.flush_timer.lock().is_none());
        assert_eq!(
            fixture.publisher.statuses_for("route-1"),
            vec![Status::Completed]
        );

        let result = buffer
            .add("route-1", vec![record(json!({"a": "2"}))])
            .await;
        assert!(matches!(result, Err(Error::BufferClosed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_activity_tracks_add() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("proc-1", FlushPolicy::default());
        let created = buffer.last_activity();

        tokio::time::advance(Duration::from_secs(10)).await;
        buffer
            .add("route-1", vec![record(json!({"a": "1"}))])
            .await
            .unwrap();
        assert_eq!(buffer.last_activity() - created, Duration::from_secs(10));

        // flushing is not activity
        tokio::time::advance(Duration::from_secs(10)).await;
        buffer.flush().await.unwrap();
        assert_eq!(buffer.last_activity() - created, Duration::from_secs(10));
        assert_eq!(buffer.last_flush().await - created, Duration::from_secs(20));
    }
}
