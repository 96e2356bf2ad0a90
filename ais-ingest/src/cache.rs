use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time;

use ais_common::ais::Mmsi;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::gate::{Gate, Observation};
use crate::metrics_consts::{CACHE_ENTRIES, CACHE_EVICTED};

/// Entries removed by one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub evicted: usize,
}

/// The most recent retained observation per vessel, so the gate never has to read storage.
///
/// Entries are created by the first retained observation of a vessel and refreshed by every
/// later one. A periodic sweep drops entries older than the TTL and, past the size cap, the
/// entries observed longest ago.
pub struct LastObservedCache {
    entries: Mutex<HashMap<Mmsi, Observation>>,
    ttl_ms: i64,
    max_entries: usize,
}

impl LastObservedCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_ms: i64::try_from(config.ttl.0.as_millis()).unwrap_or(i64::MAX),
            max_entries: config.max_entries,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Mmsi, Observation>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, mmsi: Mmsi) -> Option<Observation> {
        self.entries().get(&mmsi).copied()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Run the gate for a valid, timed observation and record it, as one step.
    ///
    /// A retained observation replaces the entry's position. A rejected one leaves the last
    /// retained position in place. Either way the entry's time only moves forward.
    /// An entry whose position was invalidated counts as no prior observation.
    pub fn observe(&self, mmsi: Mmsi, current: Observation, gate: &Gate) -> bool {
        let mut entries = self.entries();
        let last = entries
            .get(&mmsi)
            .filter(|entry| entry.position.is_some())
            .copied();

        let retain = gate.should_retain(last.as_ref(), &current);
        if retain {
            let ts_ms = entries
                .get(&mmsi)
                .map_or(current.ts_ms, |entry| entry.ts_ms.max(current.ts_ms));
            entries.insert(
                mmsi,
                Observation {
                    position: current.position,
                    ts_ms,
                },
            );
        } else if let Some(entry) = entries.get_mut(&mmsi) {
            entry.ts_ms = entry.ts_ms.max(current.ts_ms);
        }

        retain
    }

    /// Refresh the time of an existing entry without touching its position.
    pub fn touch(&self, mmsi: Mmsi, ts_ms: i64) {
        if let Some(entry) = self.entries().get_mut(&mmsi) {
            entry.ts_ms = entry.ts_ms.max(ts_ms);
        }
    }

    /// Forget the position of an existing entry after an observation with invalid coordinates.
    pub fn invalidate_position(&self, mmsi: Mmsi, ts_ms: i64) {
        if let Some(entry) = self.entries().get_mut(&mmsi) {
            entry.position = None;
            entry.ts_ms = entry.ts_ms.max(ts_ms);
        }
    }

    /// Drop expired entries, then the oldest entries until the cache is back within its cap.
    pub fn sweep(&self, now_ms: i64) -> SweepStats {
        let mut entries = self.entries();
        let before = entries.len();

        entries.retain(|_, entry| now_ms.saturating_sub(entry.ts_ms) < self.ttl_ms);
        let expired = before - entries.len();

        let mut evicted = 0;
        if entries.len() > self.max_entries {
            let mut by_age: Vec<(i64, Mmsi)> = entries
                .iter()
                .map(|(mmsi, entry)| (entry.ts_ms, *mmsi))
                .collect();
            by_age.sort_unstable();

            let excess = entries.len() - self.max_entries;
            for (_, mmsi) in by_age.into_iter().take(excess) {
                entries.remove(&mmsi);
                evicted += 1;
            }
        }

        metrics::gauge!(CACHE_ENTRIES).set(entries.len() as f64);
        SweepStats { expired, evicted }
    }

    /// Sweep on a fixed interval until `shutdown` is cancelled.
    pub fn spawn_cleaner(
        self: &Arc<Self>,
        interval: time::Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately, there is nothing to clean at startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = cache.sweep(Utc::now().timestamp_millis());
                        metrics::counter!(CACHE_EVICTED, "reason" => "ttl")
                            .increment(stats.expired as u64);
                        metrics::counter!(CACHE_EVICTED, "reason" => "capacity")
                            .increment(stats.evicted as u64);
                        debug!(
                            expired = stats.expired,
                            evicted = stats.evicted,
                            remaining = cache.len(),
                            "last-observed cache swept"
                        );
                    }
                }
            }

            info!("last-observed cache cleaner stopped");
        })
    }
}
