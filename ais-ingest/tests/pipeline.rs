use std::sync::Arc;

use ais_common::ais::{Envelope, Mmsi};
use ais_common::health::HealthRegistry;
use ais_common::store::MemoryStore;
use ais_ingest::buffer::FlushOutcome;
use ais_ingest::config::{CacheConfig, GateConfig, HistoryConfig};
use ais_ingest::dispatch::DispatchOutcome;
use ais_ingest::pipeline::Pipeline;
use serde_json::json;

const MMSI: i64 = 123456789;
const T0_MS: i64 = 1_700_000_000_000;

fn pipeline(store: &Arc<MemoryStore>, gate: GateConfig) -> Pipeline {
    Pipeline::new(
        store.clone(),
        gate,
        HistoryConfig::default(),
        CacheConfig::default(),
    )
}

fn position(ts_ms: i64, lat: f64, lon: f64) -> Envelope {
    let frame = json!({
        "MessageType": "PositionReport",
        "MetaData": {"MMSI": MMSI, "ShipName": "NORDIC STAR", "time_utc": ts_ms},
        "Message": {"PositionReport": {
            "Latitude": lat,
            "Longitude": lon,
            "NavigationalStatus": 0,
            "Sog": 10.2,
            "Cog": 90.0,
            "TrueHeading": 90
        }}
    });
    Envelope::parse(&frame.to_string()).unwrap()
}

async fn feed(pipeline: &Pipeline, frames: &[Envelope]) {
    let dispatcher = pipeline.dispatcher();
    for frame in frames {
        assert_eq!(dispatcher.dispatch(frame).await, DispatchOutcome::Handled);
    }
}

#[tokio::test]
async fn test_move_of_about_100m_within_a_minute_is_retained() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(&store, GateConfig::default());

    feed(
        &pipeline,
        &[
            position(T0_MS, 10.0, 20.0),
            position(T0_MS + 60_000, 10.0009, 20.0),
        ],
    )
    .await;

    assert_eq!(
        pipeline.buffer().flush(store.as_ref()).await,
        FlushOutcome::Written { rows: 2 }
    );
    let history = store.history_for(Mmsi(MMSI));
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].latitude, 10.0009);
}

#[tokio::test]
async fn test_same_move_is_discarded_with_a_higher_distance_threshold() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(
        &store,
        GateConfig {
            min_distance_meters: 101.0,
            ..Default::default()
        },
    );

    feed(
        &pipeline,
        &[
            position(T0_MS, 10.0, 20.0),
            position(T0_MS + 60_000, 10.0009, 20.0),
        ],
    )
    .await;
    pipeline.buffer().flush(store.as_ref()).await;

    assert_eq!(store.history_for(Mmsi(MMSI)).len(), 1);
    // the current position still follows every report
    assert_eq!(
        store.current(Mmsi(MMSI)).and_then(|c| c.latitude),
        Some(10.0009)
    );
}

#[tokio::test]
async fn test_stationary_vessel_is_retained_after_five_minutes() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(&store, GateConfig::default());

    feed(
        &pipeline,
        &[
            position(T0_MS, 10.0, 20.0),
            position(T0_MS + 300_001, 10.0, 20.0),
        ],
    )
    .await;
    pipeline.buffer().flush(store.as_ref()).await;

    assert_eq!(store.history_for(Mmsi(MMSI)).len(), 2);
}

#[tokio::test]
async fn test_invalid_position_then_valid_one_starts_a_new_track() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(&store, GateConfig::default());

    feed(
        &pipeline,
        &[
            position(T0_MS, 10.0, 20.0),
            position(T0_MS + 10_000, 91.0, 181.0),
            position(T0_MS + 20_000, 10.0, 20.0),
        ],
    )
    .await;
    pipeline.buffer().flush(store.as_ref()).await;

    assert_eq!(store.history_for(Mmsi(MMSI)).len(), 2);
    let current = store.current(Mmsi(MMSI)).unwrap();
    assert_eq!(current.longitude, Some(20.0));

    let cached = pipeline.cache().get(Mmsi(MMSI)).unwrap();
    assert_eq!(cached.position, Some((20.0, 10.0)));
    assert_eq!(cached.ts_ms, T0_MS + 20_000);
}

#[tokio::test]
async fn test_current_state_is_idempotent_and_ignores_older_reports() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(&store, GateConfig::default());

    feed(
        &pipeline,
        &[
            position(T0_MS + 60_000, 10.5, 20.5),
            position(T0_MS + 60_000, 10.5, 20.5),
        ],
    )
    .await;
    let once = store.current(Mmsi(MMSI)).unwrap();
    assert_eq!(store.current_count(), 1);

    feed(&pipeline, &[position(T0_MS, 10.0, 20.0)]).await;

    assert_eq!(store.current(Mmsi(MMSI)).unwrap(), once);
    assert_eq!(store.upsert_count(), 3);
}

#[tokio::test]
async fn test_unregistered_type_is_ignored() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(&store, GateConfig::default());

    let frame = Envelope::parse(
        &json!({
            "MessageType": "SafetyBroadcastMessage",
            "MetaData": {"MMSI": MMSI},
            "Message": {"SafetyBroadcastMessage": {"Text": "NAVIGATIONAL WARNING"}}
        })
        .to_string(),
    )
    .unwrap();

    assert_eq!(
        pipeline.dispatcher().dispatch(&frame).await,
        DispatchOutcome::Unhandled
    );
    assert_eq!(store.upsert_count(), 0);
}

#[tokio::test]
async fn test_shutdown_flushes_what_is_buffered() {
    let store = Arc::new(MemoryStore::new());
    let mut pipeline = Pipeline::new(
        store.clone(),
        GateConfig::default(),
        HistoryConfig {
            // never ticks during the test
            flush_interval: ais_ingest::config::EnvMsDuration(std::time::Duration::from_secs(
                3600,
            )),
            ..Default::default()
        },
        CacheConfig::default(),
    );
    let liveness = HealthRegistry::new("liveness");
    pipeline.start(&liveness);

    // the flusher's first tick is immediate, let it pass before feeding
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    feed(
        &pipeline,
        &[
            position(T0_MS, 10.0, 20.0),
            position(T0_MS + 300_000, 10.0, 20.0),
        ],
    )
    .await;
    assert_eq!(pipeline.buffer().len(), 2);

    pipeline.shutdown().await;

    assert_eq!(store.history_for(Mmsi(MMSI)).len(), 2);
}

#[tokio::test]
async fn test_shutdown_with_storage_down_gives_up_within_timeout() {
    let store = Arc::new(MemoryStore::new());
    store.fail_history_writes(usize::MAX);
    let pipeline = pipeline(&store, GateConfig::default());

    feed(&pipeline, &[position(T0_MS, 10.0, 20.0)]).await;

    let started = std::time::Instant::now();
    pipeline.shutdown().await;

    assert!(started.elapsed() < std::time::Duration::from_secs(3));
    assert!(store.history().is_empty());
    assert_eq!(store.attempted_batches().len(), 1);
}
