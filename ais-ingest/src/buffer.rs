use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time;

use ais_common::health::HealthHandle;
use ais_common::store::{HistoryRecord, VesselStore};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HistoryConfig;
use crate::metrics_consts::{
    HISTORY_BUFFER_DEPTH, HISTORY_DROPPED, HISTORY_ENQUEUED, HISTORY_FLUSH_FAILURES,
    HISTORY_FLUSH_TIME, HISTORY_WRITTEN,
};

/// A history row waiting to be written, and how many writes of it have failed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingHistory {
    pub record: HistoryRecord,
    pub retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another flush was already running.
    Skipped,
    /// Nothing was queued.
    Empty,
    Written { rows: usize },
    Failed { requeued: usize, dropped: usize },
}

/// Bounded queue of history rows, written in batches by a single flusher.
///
/// Rows are admitted newest-wins: when the queue is full the oldest row is dropped. A failed
/// batch goes back to the head of the queue, minus rows that already failed more than
/// `retry_cap` times.
pub struct HistoryBuffer {
    queue: Mutex<VecDeque<PendingHistory>>,
    /// One permit: held for the duration of a flush.
    flushing: Semaphore,
    config: HistoryConfig,
}

impl HistoryBuffer {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(config.buffer_max)),
            flushing: Semaphore::new(1),
            config,
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<PendingHistory>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// Snapshot of the queued rows, head first.
    pub fn pending(&self) -> Vec<PendingHistory> {
        self.queue().iter().cloned().collect()
    }

    pub fn push(&self, record: HistoryRecord) {
        let mut queue = self.queue();

        while queue.len() >= self.config.buffer_max {
            let Some(evicted) = queue.pop_front() else {
                break;
            };
            warn!(
                mmsi = %evicted.record.mmsi,
                observed_at = %evicted.record.observed_at,
                "history buffer full, dropping oldest pending record"
            );
            metrics::counter!(HISTORY_DROPPED, "reason" => "buffer_full").increment(1);
        }

        if self.config.buffer_max > 0 {
            queue.push_back(PendingHistory {
                record,
                retries: 0,
            });
            metrics::counter!(HISTORY_ENQUEUED).increment(1);
        }

        metrics::gauge!(HISTORY_BUFFER_DEPTH).set(queue.len() as f64);
    }

    /// Write up to `max_batch` rows from the head of the queue as one batch.
    pub async fn flush(&self, store: &dyn VesselStore) -> FlushOutcome {
        let Ok(_permit) = self.flushing.try_acquire() else {
            debug!("history flush already in progress, skipping");
            return FlushOutcome::Skipped;
        };

        let (records, retries): (Vec<HistoryRecord>, Vec<u32>) = {
            let mut queue = self.queue();
            let take = std::cmp::min(self.config.max_batch, queue.len());
            queue
                .drain(..take)
                .map(|pending| (pending.record, pending.retries))
                .unzip()
        };

        if records.is_empty() {
            return FlushOutcome::Empty;
        }

        let start = time::Instant::now();
        let result = store.insert_history_batch(&records).await;
        metrics::histogram!(HISTORY_FLUSH_TIME).record(start.elapsed().as_secs_f64());

        match result {
            Ok(rows) => {
                debug!(rows, batch = records.len(), "history batch written");
                metrics::counter!(HISTORY_WRITTEN).increment(records.len() as u64);
                metrics::gauge!(HISTORY_BUFFER_DEPTH).set(self.len() as f64);
                FlushOutcome::Written {
                    rows: records.len(),
                }
            }
            Err(e) => {
                error!(error = %e, batch = records.len(), "history batch write failed");
                metrics::counter!(HISTORY_FLUSH_FAILURES).increment(1);
                self.requeue(records, retries)
            }
        }
    }

    fn requeue(&self, records: Vec<HistoryRecord>, retries: Vec<u32>) -> FlushOutcome {
        let mut survivors = Vec::with_capacity(records.len());
        let mut dropped = 0;

        for (record, retries) in records.into_iter().zip(retries) {
            let retries = retries + 1;
            if retries > self.config.retry_cap {
                warn!(
                    mmsi = %record.mmsi,
                    observed_at = %record.observed_at,
                    retries,
                    "history record exceeded retry cap, dropping"
                );
                metrics::counter!(HISTORY_DROPPED, "reason" => "retry_cap").increment(1);
                dropped += 1;
            } else {
                survivors.push(PendingHistory { record, retries });
            }
        }

        let requeued = survivors.len();
        let mut queue = self.queue();
        for pending in survivors.into_iter().rev() {
            queue.push_front(pending);
        }

        // Rows pushed while the batch was in flight may have filled the queue.
        while queue.len() > self.config.buffer_max {
            if let Some(evicted) = queue.pop_front() {
                warn!(
                    mmsi = %evicted.record.mmsi,
                    "history buffer full after failed flush, dropping oldest pending record"
                );
                metrics::counter!(HISTORY_DROPPED, "reason" => "buffer_full").increment(1);
                dropped += 1;
            }
        }

        metrics::gauge!(HISTORY_BUFFER_DEPTH).set(queue.len() as f64);
        FlushOutcome::Failed { requeued, dropped }
    }

    /// Flush until the queue is empty, a flush fails, or `timeout` elapses. Whatever is still
    /// queued afterwards is dropped.
    pub async fn drain(&self, store: &dyn VesselStore, timeout: time::Duration) -> usize {
        let mut written = 0;
        let drained = tokio::time::timeout(timeout, async {
            loop {
                match self.flush(store).await {
                    FlushOutcome::Written { rows } => written += rows,
                    FlushOutcome::Skipped => {
                        tokio::time::sleep(time::Duration::from_millis(10)).await;
                    }
                    FlushOutcome::Empty | FlushOutcome::Failed { .. } => break,
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(?timeout, "final history flush timed out");
        }

        let lost = {
            let mut queue = self.queue();
            let lost = queue.len();
            queue.clear();
            lost
        };
        if lost > 0 {
            warn!(lost, "history records still queued at shutdown were dropped");
            metrics::counter!(HISTORY_DROPPED, "reason" => "shutdown").increment(lost as u64);
        }
        metrics::gauge!(HISTORY_BUFFER_DEPTH).set(0.0);

        written
    }

    /// Flush on a fixed interval until `shutdown` is cancelled. An in-flight flush always
    /// runs to completion.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        store: Arc<dyn VesselStore>,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let buffer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(buffer.config.flush_interval.0);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        liveness.report_healthy();
                        buffer.flush(store.as_ref()).await;
                    }
                }
            }

            info!("history flusher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ais_common::ais::Mmsi;
    use ais_common::store::{Kinematics, MemoryStore};
    use chrono::{TimeZone, Utc};

    use crate::config::EnvMsDuration;

    fn record(mmsi: i64, second: i64) -> HistoryRecord {
        HistoryRecord {
            mmsi: Mmsi(mmsi),
            kinematics: Kinematics::default(),
            longitude: 20.0,
            latitude: 10.0,
            observed_at: Utc.timestamp_opt(1_700_000_000 + second, 0).unwrap(),
        }
    }

    fn buffer(buffer_max: usize, max_batch: usize, retry_cap: u32) -> HistoryBuffer {
        HistoryBuffer::new(HistoryConfig {
            buffer_max,
            max_batch,
            retry_cap,
            flush_interval: EnvMsDuration(time::Duration::from_millis(1000)),
            ..Default::default()
        })
    }

    #[test]
    fn test_push_never_grows_past_max_and_drops_oldest() {
        let buffer = buffer(3, 500, 3);
        for second in 0..5 {
            buffer.push(record(1, second));
        }

        assert_eq!(buffer.len(), 3);
        let seconds: Vec<i64> = buffer
            .pending()
            .iter()
            .map(|p| p.record.observed_at.timestamp() - 1_700_000_000)
            .collect();
        assert_eq!(seconds, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_flush_writes_at_most_max_batch() {
        let store = MemoryStore::new();
        let buffer = buffer(100, 2, 3);
        for second in 0..5 {
            buffer.push(record(1, second));
        }

        assert_eq!(buffer.flush(&store).await, FlushOutcome::Written { rows: 2 });
        assert_eq!(buffer.len(), 3);
        assert_eq!(store.history().len(), 2);
        assert_eq!(store.history()[0], record(1, 0));

        buffer.flush(&store).await;
        buffer.flush(&store).await;
        assert_eq!(buffer.flush(&store).await, FlushOutcome::Empty);
        assert_eq!(store.history().len(), 5);
        assert_eq!(store.attempted_batches().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_batch_returns_to_head_with_retry_count() {
        let store = MemoryStore::new();
        let buffer = buffer(100, 2, 3);
        for second in 0..3 {
            buffer.push(record(1, second));
        }

        store.fail_history_writes(1);
        assert_eq!(
            buffer.flush(&store).await,
            FlushOutcome::Failed {
                requeued: 2,
                dropped: 0
            }
        );

        let pending = buffer.pending();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].record, record(1, 0));
        assert_eq!(pending[0].retries, 1);
        assert_eq!(pending[1].retries, 1);
        assert_eq!(pending[2].retries, 0);
    }

    #[tokio::test]
    async fn test_record_failing_past_retry_cap_is_dropped_for_good() {
        let store = MemoryStore::new();
        let buffer = buffer(100, 500, 3);
        buffer.push(record(1, 0));
        store.fail_history_writes(usize::MAX);

        for _ in 0..3 {
            assert!(matches!(
                buffer.flush(&store).await,
                FlushOutcome::Failed {
                    requeued: 1,
                    dropped: 0
                }
            ));
        }
        assert_eq!(
            buffer.flush(&store).await,
            FlushOutcome::Failed {
                requeued: 0,
                dropped: 1
            }
        );

        assert!(buffer.is_empty());
        assert_eq!(buffer.flush(&store).await, FlushOutcome::Empty);
        assert_eq!(store.attempted_batches().len(), 4);
    }

    #[test]
    fn test_requeue_respects_buffer_max() {
        let buffer = buffer(3, 2, 3);
        buffer.push(record(1, 0));
        buffer.push(record(1, 1));

        // pretend two rows arrived while the batch was in flight
        let (records, retries): (Vec<_>, Vec<_>) = buffer
            .queue()
            .drain(..)
            .map(|p| (p.record, p.retries))
            .unzip();
        buffer.push(record(1, 2));
        buffer.push(record(1, 3));

        let outcome = buffer.requeue(records, retries);
        assert_eq!(
            outcome,
            FlushOutcome::Failed {
                requeued: 2,
                dropped: 1
            }
        );
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.pending()[0].record, record(1, 1));
    }

    #[tokio::test]
    async fn test_overlapping_flush_is_skipped() {
        let store = MemoryStore::new();
        let buffer = buffer(100, 500, 3);
        buffer.push(record(1, 0));

        let _held = buffer.flushing.try_acquire().unwrap();
        assert_eq!(buffer.flush(&store).await, FlushOutcome::Skipped);
        assert_eq!(buffer.len(), 1);
        assert!(store.attempted_batches().is_empty());
    }

    #[tokio::test]
    async fn test_drain_writes_everything_then_clears() {
        let store = MemoryStore::new();
        let buffer = buffer(100, 2, 3);
        for second in 0..5 {
            buffer.push(record(1, second));
        }

        let written = buffer.drain(&store, time::Duration::from_secs(2)).await;
        assert_eq!(written, 5);
        assert!(buffer.is_empty());
        assert_eq!(store.history().len(), 5);
    }

    #[tokio::test]
    async fn test_drain_drops_what_cannot_be_written() {
        let store = MemoryStore::new();
        let buffer = buffer(100, 2, 3);
        for second in 0..5 {
            buffer.push(record(1, second));
        }
        store.fail_history_writes(usize::MAX);

        let written = buffer.drain(&store, time::Duration::from_secs(2)).await;
        assert_eq!(written, 0);
        assert!(buffer.is_empty());
        assert_eq!(store.attempted_batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flusher_writes_on_interval_and_stops() {
        let store = Arc::new(MemoryStore::new());
        let buffer = Arc::new(buffer(100, 500, 3));
        let registry = ais_common::health::HealthRegistry::new("liveness");
        let liveness = registry.register("history_flusher", time::Duration::from_secs(30));
        let shutdown = CancellationToken::new();

        let flusher = buffer.spawn_flusher(store.clone(), liveness, shutdown.clone());
        buffer.push(record(1, 0));

        tokio::time::sleep(time::Duration::from_millis(1500)).await;
        assert_eq!(store.history().len(), 1);
        assert!(registry.get_status().healthy);

        shutdown.cancel();
        flusher.await.expect("flusher panicked");
    }
}
