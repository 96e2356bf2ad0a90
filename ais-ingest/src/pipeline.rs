use std::sync::Arc;
use std::time;

use ais_common::health::HealthRegistry;
use ais_common::store::VesselStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::buffer::HistoryBuffer;
use crate::cache::LastObservedCache;
use crate::config::{CacheConfig, GateConfig, HistoryConfig};
use crate::dispatch::Dispatcher;
use crate::gate::Gate;
use crate::handlers::{
    PositionHandler, StaticDataHandler, POSITION_MESSAGE_TYPES, STATIC_MESSAGE_TYPES,
};

/// The stateful half of ingestion: last-observed cache, history buffer and the routing
/// table over them, plus the two background tasks that maintain them.
///
/// Each instance owns its state, so several can run side by side in tests.
pub struct Pipeline {
    store: Arc<dyn VesselStore>,
    cache: Arc<LastObservedCache>,
    buffer: Arc<HistoryBuffer>,
    dispatcher: Arc<Dispatcher>,
    history: HistoryConfig,
    cache_config: CacheConfig,
    tasks: CancellationToken,
    flusher: Option<JoinHandle<()>>,
    cleaner: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn VesselStore>,
        gate: GateConfig,
        history: HistoryConfig,
        cache_config: CacheConfig,
    ) -> Self {
        let cache = Arc::new(LastObservedCache::new(cache_config));
        let buffer = Arc::new(HistoryBuffer::new(history));

        let dispatcher = Dispatcher::builder()
            .register(
                POSITION_MESSAGE_TYPES,
                Arc::new(PositionHandler::new(
                    Gate::new(gate),
                    cache.clone(),
                    buffer.clone(),
                )),
            )
            .register(STATIC_MESSAGE_TYPES, Arc::new(StaticDataHandler {}))
            .build(store.clone());

        Self {
            store,
            cache,
            buffer,
            dispatcher: Arc::new(dispatcher),
            history,
            cache_config,
            tasks: CancellationToken::new(),
            flusher: None,
            cleaner: None,
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn cache(&self) -> &LastObservedCache {
        &self.cache
    }

    pub fn buffer(&self) -> &HistoryBuffer {
        &self.buffer
    }

    /// Start the history flusher and the cache cleaner. Calling it again is a no-op.
    pub fn start(&mut self, liveness: &HealthRegistry) {
        if self.flusher.is_some() {
            return;
        }

        // A flush tick is expected every interval; allow a few slow writes before stalling.
        let flusher_deadline = std::cmp::max(
            self.history.flush_interval.0.saturating_mul(10),
            time::Duration::from_secs(30),
        );
        let flusher_liveness = liveness.register("history_flusher", flusher_deadline);

        self.flusher = Some(self.buffer.spawn_flusher(
            self.store.clone(),
            flusher_liveness,
            self.tasks.child_token(),
        ));
        self.cleaner = Some(
            self.cache
                .spawn_cleaner(self.cache_config.cleanup_interval.0, self.tasks.child_token()),
        );

        info!(
            flush_interval_ms = self.history.flush_interval.0.as_millis() as u64,
            cleanup_interval_ms = self.cache_config.cleanup_interval.0.as_millis() as u64,
            "pipeline started"
        );
    }

    /// Stop both background tasks, letting an in-flight flush finish, then make one last
    /// bounded attempt to write what is still buffered.
    pub async fn shutdown(mut self) {
        self.tasks.cancel();

        for (name, task) in [("cleaner", self.cleaner.take()), ("flusher", self.flusher.take())] {
            let Some(task) = task else {
                continue;
            };
            match tokio::time::timeout(self.history.shutdown_flush_timeout.0, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(task = name, error = %e, "background task failed"),
                Err(_) => warn!(task = name, "background task did not stop in time"),
            }
        }

        let pending = self.buffer.len();
        let written = self
            .buffer
            .drain(self.store.as_ref(), self.history.shutdown_flush_timeout.0)
            .await;
        info!(pending, written, "final history flush done");
    }
}
