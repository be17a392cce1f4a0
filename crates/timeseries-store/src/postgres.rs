use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use trading_core::{
    validate_bar_batch, Bar, BarSource, IndicatorRow, KtrdrError, SeriesKey, TimeRange,
    TimeSeriesStore, Timeframe,
};

/// Store connection settings, read from the `DB_*` environment.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub pool_size: u32,
    pub max_overflow: u32,
    /// Width of one `bars` partition.
    pub partition_interval_days: i64,
    /// Partitions older than this are dropped by `drop_expired_partitions`.
    pub retention_years: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "ktrdr".to_string(),
            user: "ktrdr".to_string(),
            password: String::new(),
            pool_size: 5,
            max_overflow: 10,
            partition_interval_days: 7,
            retention_years: 10,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        let env_or = |key: &str, fallback: String| std::env::var(key).unwrap_or(fallback);
        Self {
            host: env_or("DB_HOST", defaults.host),
            port: std::env::var("DB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            name: env_or("DB_NAME", defaults.name),
            user: env_or("DB_USER", defaults.user),
            password: env_or("DB_PASSWORD", defaults.password),
            pool_size: std::env::var("DB_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.pool_size),
            max_overflow: std::env::var("DB_MAX_OVERFLOW")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_overflow),
            partition_interval_days: defaults.partition_interval_days,
            retention_years: defaults.retention_years,
        }
    }

    fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

/// Postgres-backed `TimeSeriesStore`: a range-partitioned `bars` table keyed
/// by `(ts, symbol, timeframe)` plus an `indicator_values` table. The pool
/// is the only process-wide resource and lives for the store's lifetime.
pub struct PostgresStore {
    pool: PgPool,
    config: StoreConfig,
}

fn persistence(e: impl std::fmt::Display) -> KtrdrError {
    KtrdrError::Persistence(e.to_string())
}

fn source_str(source: BarSource) -> &'static str {
    match source {
        BarSource::Broker => "broker",
        BarSource::Synthetic => "synthetic",
        BarSource::Repaired => "repaired",
    }
}

fn parse_source(s: &str) -> BarSource {
    match s {
        "synthetic" => BarSource::Synthetic,
        "repaired" => BarSource::Repaired,
        _ => BarSource::Broker,
    }
}

impl PostgresStore {
    pub async fn connect(config: StoreConfig) -> Result<Self, KtrdrError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size + config.max_overflow)
            .connect(&config.url())
            .await
            .map_err(persistence)?;
        tracing::info!(host = %config.host, db = %config.name, "connected to time-series store");
        Ok(Self { pool, config })
    }

    /// Create tables, partitioning and the secondary read index.
    pub async fn init_schema(&self) -> Result<(), KtrdrError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS bars (
                ts        TIMESTAMPTZ NOT NULL,
                symbol    TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                open      DOUBLE PRECISION NOT NULL,
                high      DOUBLE PRECISION NOT NULL,
                low       DOUBLE PRECISION NOT NULL,
                close     DOUBLE PRECISION NOT NULL,
                volume    DOUBLE PRECISION NOT NULL,
                source    TEXT NOT NULL,
                PRIMARY KEY (ts, symbol, timeframe)
            ) PARTITION BY RANGE (ts)",
        )
        .execute(&self.pool)
        .await
        .map_err(persistence)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS bars_symbol_timeframe_ts
             ON bars (symbol, timeframe, ts DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(persistence)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS indicator_values (
                ts             TIMESTAMPTZ NOT NULL,
                symbol         TEXT NOT NULL,
                timeframe      TEXT NOT NULL,
                indicator_name TEXT NOT NULL,
                params_hash    TEXT NOT NULL,
                value          JSONB NOT NULL,
                PRIMARY KEY (ts, symbol, timeframe, indicator_name, params_hash)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(persistence)?;

        Ok(())
    }

    /// Align a timestamp down to its partition boundary.
    fn partition_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.config.partition_interval_days * 86_400;
        let secs = ts.timestamp();
        DateTime::<Utc>::from_timestamp(secs - secs.rem_euclid(width), 0).unwrap()
    }

    /// Create every partition a batch will land in. DDL is idempotent.
    async fn ensure_partitions(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        first: DateTime<Utc>,
        last: DateTime<Utc>,
    ) -> Result<(), KtrdrError> {
        let width = Duration::days(self.config.partition_interval_days);
        let mut start = self.partition_start(first);
        while start <= last {
            let end = start + width;
            let name = format!("bars_p{}", start.format("%Y%m%d"));
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {name} PARTITION OF bars
                 FOR VALUES FROM ('{}') TO ('{}')",
                start.format("%Y-%m-%d %H:%M:%S%:z"),
                end.format("%Y-%m-%d %H:%M:%S%:z"),
            );
            sqlx::query(&ddl).execute(&mut **tx).await.map_err(persistence)?;
            start = end;
        }
        Ok(())
    }

    /// Drop partitions whose data has aged out of the retention window.
    pub async fn drop_expired_partitions(&self, now: DateTime<Utc>) -> Result<u64, KtrdrError> {
        let cutoff = now - Duration::days(self.config.retention_years * 365);
        let rows = sqlx::query(
            "SELECT c.relname FROM pg_inherits i
             JOIN pg_class c ON c.oid = i.inhrelid
             JOIN pg_class p ON p.oid = i.inhparent
             WHERE p.relname = 'bars'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?;

        let mut dropped = 0u64;
        for row in rows {
            let name: String = row.get(0);
            let Some(date_part) = name.strip_prefix("bars_p") else {
                continue;
            };
            let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y%m%d") else {
                continue;
            };
            let part_end = date + Duration::days(self.config.partition_interval_days);
            if part_end.and_hms_opt(0, 0, 0).unwrap().and_utc() < cutoff {
                sqlx::query(&format!("DROP TABLE IF EXISTS {name}"))
                    .execute(&self.pool)
                    .await
                    .map_err(persistence)?;
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::info!(dropped, "dropped expired bar partitions");
        }
        Ok(dropped)
    }
}

#[async_trait]
impl TimeSeriesStore for PostgresStore {
    async fn upsert_bars(&self, key: &SeriesKey, rows: &[Bar]) -> Result<u64, KtrdrError> {
        if rows.is_empty() {
            return Ok(0);
        }
        // Validate before touching the database so a bad batch leaves the
        // series untouched without needing a rollback.
        validate_bar_batch(key, rows)?;

        let mut tx = self.pool.begin().await.map_err(persistence)?;
        self.ensure_partitions(&mut tx, rows[0].ts, rows[rows.len() - 1].ts)
            .await?;

        // Postgres caps bind parameters at 65535; 9 per row.
        for chunk in rows.chunks(5000) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO bars (ts, symbol, timeframe, open, high, low, close, volume, source) ",
            );
            qb.push_values(chunk, |mut b, bar| {
                b.push_bind(bar.ts)
                    .push_bind(key.symbol.as_str())
                    .push_bind(key.timeframe.as_str())
                    .push_bind(bar.open)
                    .push_bind(bar.high)
                    .push_bind(bar.low)
                    .push_bind(bar.close)
                    .push_bind(bar.volume)
                    .push_bind(source_str(bar.source));
            });
            qb.push(
                " ON CONFLICT (ts, symbol, timeframe) DO UPDATE SET
                  open = EXCLUDED.open, high = EXCLUDED.high, low = EXCLUDED.low,
                  close = EXCLUDED.close, volume = EXCLUDED.volume, source = EXCLUDED.source",
            );
            qb.build().execute(&mut *tx).await.map_err(persistence)?;
        }

        tx.commit().await.map_err(persistence)?;
        tracing::debug!(series = %key, rows = rows.len(), "upserted bars");
        Ok(rows.len() as u64)
    }

    async fn load_bars(
        &self,
        key: &SeriesKey,
        range: Option<TimeRange>,
    ) -> Result<Vec<Bar>, KtrdrError> {
        let rows = match range {
            Some(r) => {
                sqlx::query(
                    "SELECT ts, open, high, low, close, volume, source FROM bars
                     WHERE symbol = $1 AND timeframe = $2 AND ts >= $3 AND ts <= $4
                     ORDER BY ts ASC",
                )
                .bind(key.symbol.as_str())
                .bind(key.timeframe.as_str())
                .bind(r.start)
                .bind(r.end)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT ts, open, high, low, close, volume, source FROM bars
                     WHERE symbol = $1 AND timeframe = $2 ORDER BY ts ASC",
                )
                .bind(key.symbol.as_str())
                .bind(key.timeframe.as_str())
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(persistence)?;

        Ok(rows
            .into_iter()
            .map(|row| Bar {
                ts: row.get("ts"),
                open: row.get("open"),
                high: row.get("high"),
                low: row.get("low"),
                close: row.get("close"),
                volume: row.get("volume"),
                source: parse_source(row.get("source")),
            })
            .collect())
    }

    async fn date_range(
        &self,
        key: &SeriesKey,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, KtrdrError> {
        let row = sqlx::query(
            "SELECT MIN(ts) AS min_ts, MAX(ts) AS max_ts FROM bars
             WHERE symbol = $1 AND timeframe = $2",
        )
        .bind(key.symbol.as_str())
        .bind(key.timeframe.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(persistence)?;

        let min: Option<DateTime<Utc>> = row.get("min_ts");
        let max: Option<DateTime<Utc>> = row.get("max_ts");
        Ok(min.zip(max))
    }

    async fn delete_bars(
        &self,
        key: &SeriesKey,
        range: Option<TimeRange>,
    ) -> Result<u64, KtrdrError> {
        let result = match range {
            Some(r) => {
                sqlx::query(
                    "DELETE FROM bars WHERE symbol = $1 AND timeframe = $2
                     AND ts >= $3 AND ts <= $4",
                )
                .bind(key.symbol.as_str())
                .bind(key.timeframe.as_str())
                .bind(r.start)
                .bind(r.end)
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query("DELETE FROM bars WHERE symbol = $1 AND timeframe = $2")
                    .bind(key.symbol.as_str())
                    .bind(key.timeframe.as_str())
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(persistence)?;
        Ok(result.rows_affected())
    }

    async fn upsert_indicator(
        &self,
        key: &SeriesKey,
        indicator_name: &str,
        params_hash: &str,
        rows: &[IndicatorRow],
    ) -> Result<u64, KtrdrError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(persistence)?;
        for chunk in rows.chunks(5000) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO indicator_values
                 (ts, symbol, timeframe, indicator_name, params_hash, value) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.ts)
                    .push_bind(key.symbol.as_str())
                    .push_bind(key.timeframe.as_str())
                    .push_bind(indicator_name)
                    .push_bind(params_hash)
                    .push_bind(&row.value);
            });
            qb.push(
                " ON CONFLICT (ts, symbol, timeframe, indicator_name, params_hash)
                  DO UPDATE SET value = EXCLUDED.value",
            );
            qb.build().execute(&mut *tx).await.map_err(persistence)?;
        }
        tx.commit().await.map_err(persistence)?;
        Ok(rows.len() as u64)
    }

    async fn list_symbols(&self, timeframe: Option<Timeframe>) -> Result<Vec<String>, KtrdrError> {
        let rows = match timeframe {
            Some(tf) => {
                sqlx::query(
                    "SELECT DISTINCT symbol FROM bars WHERE timeframe = $1 ORDER BY symbol",
                )
                .bind(tf.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT DISTINCT symbol FROM bars ORDER BY symbol")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(persistence)?;
        Ok(rows.into_iter().map(|r| r.get("symbol")).collect())
    }
}
