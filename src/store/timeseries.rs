//! Time-Series Store
//!
//! SQLite-backed persistence for four streams: system metrics, service
//! status, log events, and trigger events. Rows carry a `chunk_day` key so
//! retention can drop whole day-chunks instead of scanning row by row.
//! Every operation opens its own connection inside `spawn_blocking`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// One metric observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub unit: String,
    #[serde(default)]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn now(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
            metadata: Value::Null,
            timestamp: Utc::now(),
        }
    }
}

/// One service-status observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusSample {
    pub service: String,
    pub status: String,
    pub active_state: String,
    #[serde(default)]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate over one time bucket.
#[derive(Debug, Clone, Serialize)]
pub struct MetricBucket {
    pub bucket_start: DateTime<Utc>,
    pub metric_name: String,
    pub avg_value: f64,
    pub max_value: f64,
    pub min_value: f64,
    pub unit: String,
}

/// Latest observation per metric.
#[derive(Debug, Clone, Serialize)]
pub struct LatestMetric {
    pub value: f64,
    pub unit: String,
    pub time: DateTime<Utc>,
}

/// Statistical summary over a window.
#[derive(Debug, Clone, Serialize)]
pub struct MetricStats {
    pub avg: f64,
    pub max: f64,
    pub min: f64,
    pub stddev: f64,
    pub samples: u64,
    pub period_hours: i64,
}

#[derive(Clone)]
pub struct TimeSeriesStore {
    db_path: PathBuf,
}

impl TimeSeriesStore {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            db_path: db_path.as_ref().to_path_buf(),
        };
        store
            .with_conn(|conn| {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS system_metrics (
                        epoch INTEGER NOT NULL,
                        time TEXT NOT NULL,
                        chunk_day TEXT NOT NULL,
                        hostname TEXT NOT NULL,
                        metric_name TEXT NOT NULL,
                        value REAL,
                        unit TEXT,
                        metadata TEXT
                    );
                    CREATE UNIQUE INDEX IF NOT EXISTS idx_system_metrics_dedup
                        ON system_metrics (hostname, metric_name, time);
                    CREATE INDEX IF NOT EXISTS idx_system_metrics_host_time
                        ON system_metrics (hostname, epoch DESC);
                    CREATE INDEX IF NOT EXISTS idx_system_metrics_chunk
                        ON system_metrics (chunk_day);

                    CREATE TABLE IF NOT EXISTS service_status (
                        epoch INTEGER NOT NULL,
                        time TEXT NOT NULL,
                        chunk_day TEXT NOT NULL,
                        hostname TEXT NOT NULL,
                        service_name TEXT NOT NULL,
                        status TEXT NOT NULL,
                        active_state TEXT,
                        metadata TEXT
                    );
                    CREATE INDEX IF NOT EXISTS idx_service_status_host
                        ON service_status (hostname, service_name, epoch DESC);
                    CREATE INDEX IF NOT EXISTS idx_service_status_chunk
                        ON service_status (chunk_day);

                    CREATE TABLE IF NOT EXISTS log_events (
                        epoch INTEGER NOT NULL,
                        time TEXT NOT NULL,
                        chunk_day TEXT NOT NULL,
                        hostname TEXT NOT NULL,
                        severity TEXT NOT NULL,
                        message TEXT,
                        unit TEXT,
                        metadata TEXT
                    );
                    CREATE INDEX IF NOT EXISTS idx_log_events_severity
                        ON log_events (hostname, severity, epoch DESC);
                    CREATE INDEX IF NOT EXISTS idx_log_events_chunk
                        ON log_events (chunk_day);

                    CREATE TABLE IF NOT EXISTS trigger_events (
                        epoch INTEGER NOT NULL,
                        time TEXT NOT NULL,
                        chunk_day TEXT NOT NULL,
                        hostname TEXT NOT NULL,
                        trigger_type TEXT NOT NULL,
                        trigger_reason TEXT,
                        metadata TEXT
                    );
                    CREATE INDEX IF NOT EXISTS idx_trigger_events_host
                        ON trigger_events (hostname, epoch DESC);
                    CREATE INDEX IF NOT EXISTS idx_trigger_events_chunk
                        ON trigger_events (chunk_day);
                    "#,
                )
                .context("failed to initialise time-series schema")
            })
            .await?;
        Ok(store)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)
                .with_context(|| format!("cannot open time-series db {:?}", path))?;
            f(&conn)
        })
        .await
        .context("time-series task failed")?
    }

    /// Batched insert. Duplicate `(host, metric, timestamp)` rows are
    /// ignored, which keeps retention-window boundaries idempotent.
    pub async fn store_metrics(&self, hostname: &str, samples: Vec<MetricSample>) -> Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }
        let hostname = hostname.to_string();
        self.with_conn(move |conn| {
            let mut inserted = 0;
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO system_metrics
                     (epoch, time, chunk_day, hostname, metric_name, value, unit, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for sample in samples {
                    inserted += stmt.execute(params![
                        sample.timestamp.timestamp(),
                        sample.timestamp.to_rfc3339(),
                        sample.timestamp.format("%Y-%m-%d").to_string(),
                        hostname,
                        sample.name,
                        sample.value,
                        sample.unit,
                        sample.metadata.to_string(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    pub async fn store_service_status(
        &self,
        hostname: &str,
        samples: Vec<ServiceStatusSample>,
    ) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let hostname = hostname.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO service_status
                     (epoch, time, chunk_day, hostname, service_name, status, active_state, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for sample in samples {
                    stmt.execute(params![
                        sample.timestamp.timestamp(),
                        sample.timestamp.to_rfc3339(),
                        sample.timestamp.format("%Y-%m-%d").to_string(),
                        hostname,
                        sample.service,
                        sample.status,
                        sample.active_state,
                        sample.metadata.to_string(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn store_log_event(
        &self,
        hostname: &str,
        severity: &str,
        message: &str,
        unit: &str,
        metadata: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let (hostname, severity, message, unit) = (
            hostname.to_string(),
            severity.to_string(),
            message.to_string(),
            unit.to_string(),
        );
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO log_events
                 (epoch, time, chunk_day, hostname, severity, message, unit, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    timestamp.timestamp(),
                    timestamp.to_rfc3339(),
                    timestamp.format("%Y-%m-%d").to_string(),
                    hostname,
                    severity,
                    message,
                    unit,
                    metadata.to_string(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn store_trigger_event(
        &self,
        hostname: &str,
        trigger_type: &str,
        trigger_reason: &str,
        metadata: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let (hostname, trigger_type, trigger_reason) = (
            hostname.to_string(),
            trigger_type.to_string(),
            trigger_reason.to_string(),
        );
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO trigger_events
                 (epoch, time, chunk_day, hostname, trigger_type, trigger_reason, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    timestamp.timestamp(),
                    timestamp.to_rfc3339(),
                    timestamp.format("%Y-%m-%d").to_string(),
                    hostname,
                    trigger_type,
                    trigger_reason,
                    metadata.to_string(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Bucketed aggregates (avg/max/min) over `bucket_minutes`-wide buckets
    /// in the given window, newest bucket first.
    pub async fn query_metrics(
        &self,
        hostname: &str,
        metric_names: Option<Vec<String>>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket_minutes: i64,
    ) -> Result<Vec<MetricBucket>> {
        let hostname = hostname.to_string();
        let bucket_seconds = (bucket_minutes.max(1)) * 60;
        self.with_conn(move |conn| {
            let mut sql = String::from(
                "SELECT (epoch / ?1) * ?1 AS bucket, metric_name,
                        AVG(value), MAX(value), MIN(value), unit
                 FROM system_metrics
                 WHERE hostname = ?2 AND epoch >= ?3 AND epoch <= ?4",
            );
            if let Some(ref names) = metric_names {
                let placeholders: Vec<String> = (0..names.len())
                    .map(|i| format!("?{}", i + 5))
                    .collect();
                sql.push_str(&format!(
                    " AND metric_name IN ({})",
                    placeholders.join(", ")
                ));
            }
            sql.push_str(" GROUP BY bucket, metric_name, unit ORDER BY bucket DESC, metric_name");

            let mut stmt = conn.prepare(&sql)?;
            let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
                Box::new(bucket_seconds),
                Box::new(hostname),
                Box::new(start.timestamp()),
                Box::new(end.timestamp()),
            ];
            if let Some(names) = metric_names {
                for name in names {
                    values.push(Box::new(name));
                }
            }

            let params: Vec<&dyn rusqlite::types::ToSql> =
                values.iter().map(|v| v.as_ref()).collect();
            let rows = stmt.query_map(params.as_slice(), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?;

            let mut buckets = Vec::new();
            for row in rows {
                let (epoch, name, avg, max, min, unit) = row?;
                buckets.push(MetricBucket {
                    bucket_start: DateTime::from_timestamp(epoch, 0).unwrap_or_else(Utc::now),
                    metric_name: name,
                    avg_value: avg,
                    max_value: max,
                    min_value: min,
                    unit: unit.unwrap_or_default(),
                });
            }
            Ok(buckets)
        })
        .await
    }

    /// Most recent value for each metric of a host.
    pub async fn latest_metrics(
        &self,
        hostname: &str,
        metric_names: Option<Vec<String>>,
    ) -> Result<HashMap<String, LatestMetric>> {
        let hostname = hostname.to_string();
        self.with_conn(move |conn| {
            let mut sql = String::from(
                "SELECT metric_name, value, unit, time, MAX(epoch)
                 FROM system_metrics WHERE hostname = ?1",
            );
            if let Some(ref names) = metric_names {
                let placeholders: Vec<String> = (0..names.len())
                    .map(|i| format!("?{}", i + 2))
                    .collect();
                sql.push_str(&format!(
                    " AND metric_name IN ({})",
                    placeholders.join(", ")
                ));
            }
            sql.push_str(" GROUP BY metric_name");

            let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(hostname)];
            if let Some(names) = metric_names {
                for name in names {
                    values.push(Box::new(name));
                }
            }
            let params: Vec<&dyn rusqlite::types::ToSql> =
                values.iter().map(|v| v.as_ref()).collect();

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut latest = HashMap::new();
            for row in rows {
                let (name, value, unit, time) = row?;
                latest.insert(
                    name,
                    LatestMetric {
                        value,
                        unit: unit.unwrap_or_default(),
                        time: time
                            .parse::<DateTime<Utc>>()
                            .unwrap_or_else(|_| Utc::now()),
                    },
                );
            }
            Ok(latest)
        })
        .await
    }

    /// avg/max/min/stddev/count over the trailing window.
    pub async fn metric_statistics(
        &self,
        hostname: &str,
        metric_name: &str,
        hours: i64,
    ) -> Result<Option<MetricStats>> {
        let hostname = hostname.to_string();
        let metric_name = metric_name.to_string();
        let start = (Utc::now() - ChronoDuration::hours(hours)).timestamp();
        self.with_conn(move |conn| {
            // SQLite has no STDDEV; derive it from E[x^2] - E[x]^2.
            let row = conn.query_row(
                "SELECT AVG(value), MAX(value), MIN(value), AVG(value * value), COUNT(*)
                 FROM system_metrics
                 WHERE hostname = ?1 AND metric_name = ?2 AND epoch >= ?3",
                params![hostname, metric_name, start],
                |row| {
                    Ok((
                        row.get::<_, Option<f64>>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )?;

            let (avg, max, min, avg_sq, count) = row;
            let (Some(avg), Some(max), Some(min), Some(avg_sq)) = (avg, max, min, avg_sq) else {
                return Ok(None);
            };
            let variance = (avg_sq - avg * avg).max(0.0);
            Ok(Some(MetricStats {
                avg,
                max,
                min,
                stddev: variance.sqrt(),
                samples: count as u64,
                period_hours: hours,
            }))
        })
        .await
    }

    /// Drop whole day-chunks older than the cut-off across all four
    /// streams. Returns the number of rows removed.
    pub async fn drop_chunks(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let cutoff_day = older_than.format("%Y-%m-%d").to_string();
        self.with_conn(move |conn| {
            let mut removed = 0;
            for table in [
                "system_metrics",
                "service_status",
                "log_events",
                "trigger_events",
            ] {
                removed += conn.execute(
                    &format!("DELETE FROM {} WHERE chunk_day < ?1", table),
                    params![cutoff_day],
                )?;
            }
            if removed > 0 {
                info!("dropped {} time-series rows older than {}", removed, cutoff_day);
            }
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> (tempfile::TempDir, TimeSeriesStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TimeSeriesStore::open(dir.path().join("ts.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_store_and_latest_metrics() {
        let (_dir, store) = store().await;

        store
            .store_metrics(
                "macha",
                vec![
                    MetricSample::now("cpu_percent", 45.5, "%"),
                    MetricSample::now("memory_percent", 67.3, "%"),
                ],
            )
            .await
            .unwrap();

        let latest = store.latest_metrics("macha", None).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert!((latest["cpu_percent"].value - 45.5).abs() < f64::EPSILON);
        assert_eq!(latest["cpu_percent"].unit, "%");
    }

    #[tokio::test]
    async fn test_duplicate_samples_deduplicated() {
        let (_dir, store) = store().await;
        let sample = MetricSample::now("cpu_percent", 50.0, "%");

        let first = store
            .store_metrics("macha", vec![sample.clone()])
            .await
            .unwrap();
        let second = store.store_metrics("macha", vec![sample]).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn test_metric_statistics() {
        let (_dir, store) = store().await;
        let base = Utc::now();
        let samples = [10.0, 20.0, 30.0]
            .iter()
            .enumerate()
            .map(|(i, v)| MetricSample {
                name: "cpu_percent".into(),
                value: *v,
                unit: "%".into(),
                metadata: Value::Null,
                timestamp: base - ChronoDuration::minutes(i as i64),
            })
            .collect();
        store.store_metrics("macha", samples).await.unwrap();

        let stats = store
            .metric_statistics("macha", "cpu_percent", 1)
            .await
            .unwrap()
            .unwrap();
        assert!((stats.avg - 20.0).abs() < 0.001);
        assert_eq!(stats.max, 30.0);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.samples, 3);
        assert!((stats.stddev - 8.1649).abs() < 0.01);

        assert!(store
            .metric_statistics("macha", "unknown_metric", 1)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_bucketed_query() {
        let (_dir, store) = store().await;
        let base = Utc::now();
        let samples = (0..10)
            .map(|i| MetricSample {
                name: "cpu_percent".into(),
                value: 50.0 + i as f64,
                unit: "%".into(),
                metadata: Value::Null,
                timestamp: base - ChronoDuration::minutes(i),
            })
            .collect();
        store.store_metrics("macha", samples).await.unwrap();

        let buckets = store
            .query_metrics(
                "macha",
                Some(vec!["cpu_percent".into()]),
                base - ChronoDuration::hours(1),
                base,
                5,
            )
            .await
            .unwrap();
        assert!(!buckets.is_empty());
        assert!(buckets.iter().all(|b| b.metric_name == "cpu_percent"));
    }

    #[tokio::test]
    async fn test_retention_drops_old_chunks() {
        let (_dir, store) = store().await;
        let old = Utc::now() - ChronoDuration::days(40);
        store
            .store_metrics(
                "macha",
                vec![MetricSample {
                    name: "cpu_percent".into(),
                    value: 1.0,
                    unit: "%".into(),
                    metadata: json!({}),
                    timestamp: old,
                }],
            )
            .await
            .unwrap();
        store
            .store_metrics("macha", vec![MetricSample::now("cpu_percent", 2.0, "%")])
            .await
            .unwrap();

        let removed = store
            .drop_chunks(Utc::now() - ChronoDuration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let latest = store.latest_metrics("macha", None).await.unwrap();
        assert!((latest["cpu_percent"].value - 2.0).abs() < f64::EPSILON);
    }
}
