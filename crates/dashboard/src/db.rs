//! SQLite history. Best-effort write-behind for stored readings, used to
//! backfill the rolling buffer after a restart.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::reading::{now_millis, Reading, TimestampSource};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, sqlx::FromRow)]
struct ReadingRow {
    ts: i64,
    ts_source: String,
    temperature: Option<f64>,
    humidity: Option<f64>,
    vpd: Option<f64>,
    ph: Option<f64>,
    water_level: Option<f64>,
    reservoir_volume: Option<f64>,
    light_intensity: Option<f64>,
    vpd_pump_running: Option<bool>,
    ph_adjusting: Option<bool>,
}

impl From<ReadingRow> for Reading {
    fn from(r: ReadingRow) -> Self {
        Reading {
            timestamp: r.ts,
            timestamp_source: match r.ts_source.as_str() {
                "local" => TimestampSource::Local,
                _ => TimestampSource::Device,
            },
            temperature: r.temperature,
            humidity: r.humidity,
            vpd: r.vpd,
            ph: r.ph,
            water_level: r.water_level,
            reservoir_volume: r.reservoir_volume,
            light_intensity: r.light_intensity,
            vpd_pump_running: r.vpd_pump_running,
            ph_adjusting: r.ph_adjusting,
        }
    }
}

fn source_str(src: TimestampSource) -> &'static str {
    match src {
        TimestampSource::Device => "device",
        TimestampSource::Local => "local",
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/hydro/history.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to :memory: is its own database, so keep exactly one alive.
        let pool = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };
        let pool = pool
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn insert_reading(&self, r: &Reading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (
              ts, ts_source,
              temperature, humidity, vpd, ph,
              water_level, reservoir_volume, light_intensity,
              vpd_pump_running, ph_adjusting
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.timestamp)
        .bind(source_str(r.timestamp_source))
        .bind(r.temperature)
        .bind(r.humidity)
        .bind(r.vpd)
        .bind(r.ph)
        .bind(r.water_level)
        .bind(r.reservoir_volume)
        .bind(r.light_intensity)
        .bind(r.vpd_pump_running)
        .bind(r.ph_adjusting)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    /// Newest `limit` readings with `ts > cutoff_ms`, oldest first.
    pub async fn readings_since(&self, cutoff_ms: i64, limit: i64) -> Result<Vec<Reading>> {
        let rows: Vec<ReadingRow> = sqlx::query_as(
            r#"
            SELECT ts, ts_source,
                   temperature, humidity, vpd, ph,
                   water_level, reservoir_volume, light_intensity,
                   vpd_pump_running, ph_adjusting
            FROM (
              SELECT * FROM readings
              WHERE ts > ?
              ORDER BY ts DESC, id DESC
              LIMIT ?
            )
            ORDER BY ts ASC, id ASC
            "#,
        )
        .bind(cutoff_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("readings_since failed")?;

        Ok(rows.into_iter().map(Reading::from).collect())
    }

    /// Delete readings at or before `cutoff_ms`. Returns rows removed.
    pub async fn prune_before(&self, cutoff_ms: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM readings WHERE ts <= ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await
            .context("prune_before failed")?;
        Ok(res.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// Retention task
// ---------------------------------------------------------------------------

/// Spawn the periodic retention prune. The first pass runs at once; abort the
/// handle to stop it.
pub fn spawn_prune(db: Db, retention: Duration, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(
            retention_sec = retention.as_secs(),
            every_sec = every.as_secs(),
            "history prune started"
        );
        loop {
            ticker.tick().await;
            let cutoff = now_millis() - retention.as_millis() as i64;
            match db.prune_before(cutoff).await {
                Ok(0) => {}
                Ok(n) => info!(rows = n, "pruned history past retention"),
                Err(e) => warn!(error = ?e, "history prune failed"),
            }
        }
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn reading(ts: i64) -> Reading {
        Reading {
            timestamp: ts,
            timestamp_source: TimestampSource::Device,
            temperature: Some(21.5),
            humidity: None,
            vpd: Some(1.0),
            ph: Some(0.0),
            water_level: None,
            reservoir_volume: None,
            light_intensity: None,
            vpd_pump_running: Some(true),
            ph_adjusting: None,
        }
    }

    // -- insert / query -----------------------------------------------------

    #[tokio::test]
    async fn insert_and_read_back_preserves_absence() {
        let db = test_db().await;
        let mut r = reading(1_000);
        r.timestamp_source = TimestampSource::Local;
        db.insert_reading(&r).await.unwrap();

        let got = db.readings_since(0, 10).await.unwrap();
        assert_eq!(got, vec![r]);
        assert_eq!(got[0].humidity, None);
        assert_eq!(got[0].ph, Some(0.0));
    }

    #[tokio::test]
    async fn readings_since_is_ascending_and_limited_to_newest() {
        let db = test_db().await;
        for ts in [5_000, 1_000, 4_000, 2_000, 3_000] {
            db.insert_reading(&reading(ts)).await.unwrap();
        }
        let got: Vec<i64> = db
            .readings_since(1_000, 3)
            .await
            .unwrap()
            .iter()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(got, vec![3_000, 4_000, 5_000]);
    }

    #[tokio::test]
    async fn empty_history() {
        let db = test_db().await;
        assert!(db.readings_since(0, 100).await.unwrap().is_empty());
    }

    // -- prune --------------------------------------------------------------

    #[tokio::test]
    async fn prune_removes_old_rows() {
        let db = test_db().await;
        for ts in [1_000, 2_000, 3_000] {
            db.insert_reading(&reading(ts)).await.unwrap();
        }
        assert_eq!(db.prune_before(2_000).await.unwrap(), 2);
        let left = db.readings_since(0, 10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].timestamp, 3_000);
    }

    async fn wait_for_rows(db: &Db, want: usize) -> Vec<Reading> {
        let mut rows = Vec::new();
        for _ in 0..100 {
            rows = db.readings_since(0, 10).await.unwrap();
            if rows.len() == want {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        rows
    }

    #[tokio::test]
    async fn prune_task_keeps_pruning_until_aborted() {
        let db = test_db().await;
        let fresh = now_millis();
        db.insert_reading(&reading(1_000)).await.unwrap();
        db.insert_reading(&reading(fresh)).await.unwrap();

        let handle = spawn_prune(
            db.clone(),
            Duration::from_secs(3600),
            Duration::from_millis(20),
        );
        let left = wait_for_rows(&db, 1).await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].timestamp, fresh);

        // Expired rows written later go on a following pass.
        db.insert_reading(&reading(2_000)).await.unwrap();
        let left = wait_for_rows(&db, 1).await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].timestamp, fresh);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
