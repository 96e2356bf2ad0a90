//! Storage facade for vessel state.
//!
//! The ingestion pipeline only ever writes three things: the current position of a vessel,
//! batches of retained position history, and static reference data. `VesselStore` captures
//! exactly that, so the pipeline can run against PostgreSQL, against nothing at all (when no
//! database credentials are configured), or against memory in tests.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tracing::debug;

use crate::ais::Mmsi;

/// Enumeration of errors for operations against a `VesselStore`.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Separate errors getting a connection from errors running the statement.
    fn from_sqlx(command: &'static str, error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::ConnectionError { error }
            }
            error => StoreError::QueryError { command, error },
        }
    }
}

/// Navigation fields reported alongside a position.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Kinematics {
    pub navigational_status: Option<i32>,
    pub rate_of_turn: Option<f64>,
    pub speed_over_ground: Option<f64>,
    pub course_over_ground: Option<f64>,
    pub true_heading: Option<i32>,
    pub special_manoeuvre_indicator: Option<i32>,
}

/// The latest known state of a vessel, one row per MMSI.
///
/// `longitude` and `latitude` are both `None` when the observation carried an invalid
/// position; in that case the stored coordinates are kept.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentPosition {
    pub mmsi: Mmsi,
    pub ship_name: Option<String>,
    pub kinematics: Kinematics,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub observed_at: Option<DateTime<Utc>>,
}

impl CurrentPosition {
    /// Last-writer-wins by event time: an arriving record replaces the stored one only when
    /// it is strictly newer, or when the stored one has no observation time at all.
    pub fn supersedes(&self, stored: &CurrentPosition) -> bool {
        match (stored.observed_at, self.observed_at) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(stored_at), Some(arriving_at)) => arriving_at > stored_at,
        }
    }

    /// Apply this record over a stored one, keeping stored values where this one has none
    /// for the name and the coordinates.
    pub fn merged_over(self, stored: &CurrentPosition) -> CurrentPosition {
        let has_position = self.longitude.is_some() && self.latitude.is_some();
        CurrentPosition {
            ship_name: self.ship_name.or_else(|| stored.ship_name.clone()),
            longitude: if has_position {
                self.longitude
            } else {
                stored.longitude
            },
            latitude: if has_position {
                self.latitude
            } else {
                stored.latitude
            },
            ..self
        }
    }
}

/// An append-only history row. Only observations with a valid position and a known
/// observation time ever become one.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub mmsi: Mmsi,
    pub kinematics: Kinematics,
    pub longitude: f64,
    pub latitude: f64,
    pub observed_at: DateTime<Utc>,
}

/// Reference data for a vessel, one row per MMSI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticReport {
    pub mmsi: Option<Mmsi>,
    pub imo: Option<i64>,
    pub call_sign: Option<String>,
    pub ship_name: Option<String>,
    pub destination: Option<String>,
    pub dimension_a: Option<i32>,
    pub dimension_b: Option<i32>,
    pub dimension_c: Option<i32>,
    pub dimension_d: Option<i32>,
    pub ship_type: Option<i32>,
    pub max_draught: Option<f64>,
    pub eta: Option<DateTime<Utc>>,
}

impl StaticReport {
    /// Fill every field this report lacks from the stored report.
    pub fn merged_over(self, stored: &StaticReport) -> StaticReport {
        StaticReport {
            mmsi: self.mmsi.or(stored.mmsi),
            imo: self.imo.or(stored.imo),
            call_sign: self.call_sign.or_else(|| stored.call_sign.clone()),
            ship_name: self.ship_name.or_else(|| stored.ship_name.clone()),
            destination: self.destination.or_else(|| stored.destination.clone()),
            dimension_a: self.dimension_a.or(stored.dimension_a),
            dimension_b: self.dimension_b.or(stored.dimension_b),
            dimension_c: self.dimension_c.or(stored.dimension_c),
            dimension_d: self.dimension_d.or(stored.dimension_d),
            ship_type: self.ship_type.or(stored.ship_type),
            max_draught: self.max_draught.or(stored.max_draught),
            eta: self.eta.or(stored.eta),
        }
    }
}

#[async_trait]
pub trait VesselStore: Send + Sync {
    /// Upsert the current position of a vessel. Safe to repeat.
    async fn upsert_current_position(&self, record: &CurrentPosition) -> Result<(), StoreError>;

    /// Insert a batch of history rows with a single statement, returning rows written.
    async fn insert_history_batch(&self, records: &[HistoryRecord]) -> Result<u64, StoreError>;

    /// Upsert static data for a vessel. Safe to repeat.
    async fn upsert_static_report(&self, report: &StaticReport) -> Result<(), StoreError>;
}

/// `VesselStore` backed by PostgreSQL.
pub struct PgVesselStore {
    pool: PgPool,
}

impl PgVesselStore {
    /// Connect lazily: an unreachable database fails individual writes instead of startup.
    pub fn new(options: PgConnectOptions, max_connections: u32) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(time::Duration::from_secs(5))
            .connect_lazy_with(options);

        Self { pool }
    }

    /// Wrap an existing pool, as handed out by `#[sqlx::test]`.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VesselStore for PgVesselStore {
    async fn upsert_current_position(&self, record: &CurrentPosition) -> Result<(), StoreError> {
        // Stored coordinates survive an observation without a valid position, and the row is
        // only touched when the arriving observation is strictly newer.
        sqlx::query(
            r#"
INSERT INTO current_positions
    (mmsi, ship_name, navigational_status, rot, sog, cog, true_heading,
     longitude, latitude, special_manoeuvre_indicator, observed_at, updated_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
ON CONFLICT (mmsi) DO UPDATE SET
    ship_name = COALESCE(EXCLUDED.ship_name, current_positions.ship_name),
    navigational_status = EXCLUDED.navigational_status,
    rot = EXCLUDED.rot,
    sog = EXCLUDED.sog,
    cog = EXCLUDED.cog,
    true_heading = EXCLUDED.true_heading,
    longitude = COALESCE(EXCLUDED.longitude, current_positions.longitude),
    latitude = COALESCE(EXCLUDED.latitude, current_positions.latitude),
    special_manoeuvre_indicator = EXCLUDED.special_manoeuvre_indicator,
    observed_at = EXCLUDED.observed_at,
    updated_at = NOW()
WHERE
    current_positions.observed_at IS NULL
    OR EXCLUDED.observed_at > current_positions.observed_at
            "#,
        )
        .bind(record.mmsi.0)
        .bind(&record.ship_name)
        .bind(record.kinematics.navigational_status)
        .bind(record.kinematics.rate_of_turn)
        .bind(record.kinematics.speed_over_ground)
        .bind(record.kinematics.course_over_ground)
        .bind(record.kinematics.true_heading)
        .bind(record.longitude)
        .bind(record.latitude)
        .bind(record.kinematics.special_manoeuvre_indicator)
        .bind(record.observed_at)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::from_sqlx("UPSERT current_positions", error))?;

        Ok(())
    }

    async fn insert_history_batch(&self, records: &[HistoryRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO position_history (mmsi, navigational_status, rot, sog, cog, true_heading, \
             longitude, latitude, special_manoeuvre_indicator, observed_at) ",
        );
        builder.push_values(records, |mut row, record| {
            row.push_bind(record.mmsi.0)
                .push_bind(record.kinematics.navigational_status)
                .push_bind(record.kinematics.rate_of_turn)
                .push_bind(record.kinematics.speed_over_ground)
                .push_bind(record.kinematics.course_over_ground)
                .push_bind(record.kinematics.true_heading)
                .push_bind(record.longitude)
                .push_bind(record.latitude)
                .push_bind(record.kinematics.special_manoeuvre_indicator)
                .push_bind(record.observed_at);
        });

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::from_sqlx("INSERT position_history", error))?;

        Ok(result.rows_affected())
    }

    async fn upsert_static_report(&self, report: &StaticReport) -> Result<(), StoreError> {
        let Some(mmsi) = report.mmsi else {
            return Ok(());
        };

        sqlx::query(
            r#"
INSERT INTO static_reports
    (mmsi, imo, call_sign, ship_name, destination, dimension_a, dimension_b,
     dimension_c, dimension_d, ship_type, max_draught, eta, updated_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
ON CONFLICT (mmsi) DO UPDATE SET
    imo = COALESCE(EXCLUDED.imo, static_reports.imo),
    call_sign = COALESCE(EXCLUDED.call_sign, static_reports.call_sign),
    ship_name = COALESCE(EXCLUDED.ship_name, static_reports.ship_name),
    destination = COALESCE(EXCLUDED.destination, static_reports.destination),
    dimension_a = COALESCE(EXCLUDED.dimension_a, static_reports.dimension_a),
    dimension_b = COALESCE(EXCLUDED.dimension_b, static_reports.dimension_b),
    dimension_c = COALESCE(EXCLUDED.dimension_c, static_reports.dimension_c),
    dimension_d = COALESCE(EXCLUDED.dimension_d, static_reports.dimension_d),
    ship_type = COALESCE(EXCLUDED.ship_type, static_reports.ship_type),
    max_draught = COALESCE(EXCLUDED.max_draught, static_reports.max_draught),
    eta = COALESCE(EXCLUDED.eta, static_reports.eta),
    updated_at = NOW()
            "#,
        )
        .bind(mmsi.0)
        .bind(report.imo)
        .bind(&report.call_sign)
        .bind(&report.ship_name)
        .bind(&report.destination)
        .bind(report.dimension_a)
        .bind(report.dimension_b)
        .bind(report.dimension_c)
        .bind(report.dimension_d)
        .bind(report.ship_type)
        .bind(report.max_draught)
        .bind(report.eta)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::from_sqlx("UPSERT static_reports", error))?;

        Ok(())
    }
}

/// Used when no database credentials are configured: the stream keeps running, nothing is
/// persisted.
pub struct NoopStore {}

#[async_trait]
impl VesselStore for NoopStore {
    async fn upsert_current_position(&self, record: &CurrentPosition) -> Result<(), StoreError> {
        debug!(mmsi = %record.mmsi, "storage disabled, dropping current position");
        Ok(())
    }

    async fn insert_history_batch(&self, records: &[HistoryRecord]) -> Result<u64, StoreError> {
        debug!(rows = records.len(), "storage disabled, dropping history batch");
        Ok(0)
    }

    async fn upsert_static_report(&self, report: &StaticReport) -> Result<(), StoreError> {
        debug!(mmsi = ?report.mmsi, "storage disabled, dropping static report");
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory `VesselStore` with the same conflict semantics as `PgVesselStore`.
///
/// History writes can be made to fail on demand, and every attempted batch is recorded so
/// retry behaviour can be asserted on.
#[derive(Default)]
pub struct MemoryStore {
    current: Mutex<HashMap<Mmsi, CurrentPosition>>,
    history: Mutex<Vec<HistoryRecord>>,
    statics: Mutex<HashMap<Mmsi, StaticReport>>,
    attempted_batches: Mutex<Vec<Vec<HistoryRecord>>>,
    upserts: AtomicUsize,
    failing_history_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` history writes fail. `usize::MAX` fails them all.
    pub fn fail_history_writes(&self, count: usize) {
        self.failing_history_writes.store(count, Ordering::SeqCst);
    }

    pub fn current(&self, mmsi: Mmsi) -> Option<CurrentPosition> {
        lock(&self.current).get(&mmsi).cloned()
    }

    pub fn current_count(&self) -> usize {
        lock(&self.current).len()
    }

    /// Number of current position upserts received, applied or not.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn history(&self) -> Vec<HistoryRecord> {
        lock(&self.history).clone()
    }

    pub fn history_for(&self, mmsi: Mmsi) -> Vec<HistoryRecord> {
        lock(&self.history)
            .iter()
            .filter(|record| record.mmsi == mmsi)
            .cloned()
            .collect()
    }

    pub fn attempted_batches(&self) -> Vec<Vec<HistoryRecord>> {
        lock(&self.attempted_batches).clone()
    }

    pub fn static_report(&self, mmsi: Mmsi) -> Option<StaticReport> {
        lock(&self.statics).get(&mmsi).cloned()
    }
}

#[async_trait]
impl VesselStore for MemoryStore {
    async fn upsert_current_position(&self, record: &CurrentPosition) -> Result<(), StoreError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);

        let mut current = lock(&self.current);
        match current.get(&record.mmsi) {
            Some(stored) if !record.supersedes(stored) => {}
            Some(stored) => {
                let merged = record.clone().merged_over(stored);
                current.insert(record.mmsi, merged);
            }
            None => {
                current.insert(record.mmsi, record.clone());
            }
        }

        Ok(())
    }

    async fn insert_history_batch(&self, records: &[HistoryRecord]) -> Result<u64, StoreError> {
        lock(&self.attempted_batches).push(records.to_vec());

        let failing = self
            .failing_history_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| match remaining {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("injected history failure".to_owned()));
        }

        lock(&self.history).extend_from_slice(records);
        Ok(records.len() as u64)
    }

    async fn upsert_static_report(&self, report: &StaticReport) -> Result<(), StoreError> {
        let Some(mmsi) = report.mmsi else {
            return Ok(());
        };

        let mut statics = lock(&self.statics);
        let merged = match statics.get(&mmsi) {
            Some(stored) => report.clone().merged_over(stored),
            None => report.clone(),
        };
        statics.insert(mmsi, merged);

        Ok(())
    }
}
