// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Idempotent writer and reader over the time-series tables. All mutating
//! calls are upserts keyed by primary key and safe to repeat; readers
//! tolerate gaps.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use core_types::config::AppConfig;
use core_types::types::{
    GexStrikeRow, GexSummary, IvSource, OptionQuoteRow, OptionType, UnderlyingBar,
};
use log::info;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Connectivity and serialization failures are retried by callers;
    /// anything else (constraint breach, bad SQL, corrupt data) indicates a
    /// coding bug and surfaces.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Db(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => db
                    .code()
                    .map(|code| {
                        // 40xxx serialization/deadlock, 08xxx connection,
                        // 57P03 cannot-connect-now.
                        code.starts_with("40") || code.starts_with("08") || code == "57P03"
                    })
                    .unwrap_or(false),
                _ => false,
            },
            StoreError::Corrupt(_) => false,
        }
    }
}

/// Tables subject to retention pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneTable {
    UnderlyingBars,
    OptionQuotes,
    GexSummary,
    GexByStrike,
}

impl PruneTable {
    fn table(&self) -> &'static str {
        match self {
            PruneTable::UnderlyingBars => "underlying_bars",
            PruneTable::OptionQuotes => "option_quotes",
            PruneTable::GexSummary => "gex_summary",
            PruneTable::GexByStrike => "gex_by_strike",
        }
    }

    fn time_column(&self) -> &'static str {
        match self {
            PruneTable::UnderlyingBars | PruneTable::OptionQuotes => "bucket_start",
            PruneTable::GexSummary | PruneTable::GexByStrike => "calc_time",
        }
    }
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(cfg: &AppConfig) -> Result<Self, StoreError> {
        let url = format!(
            "postgres://{}:{}@{}:{}/{}",
            cfg.db_user, cfg.db_password, cfg.db_host, cfg.db_port, cfg.db_name
        );
        let pool = PgPoolOptions::new()
            .min_connections(cfg.db_pool_min)
            .max_connections(cfg.db_pool_max)
            .connect(&url)
            .await?;
        info!(
            "connected to postgres {}@{}:{}/{}",
            cfg.db_user, cfg.db_host, cfg.db_port, cfg.db_name
        );
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert_underlying_bar(&self, bar: &UnderlyingBar) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO underlying_bars
                (symbol, bucket_start, open, high, low, close, up_volume, down_volume, volume)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (symbol, bucket_start) DO UPDATE SET
                open = EXCLUDED.open,
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                up_volume = EXCLUDED.up_volume,
                down_volume = EXCLUDED.down_volume,
                volume = EXCLUDED.volume
            "#,
        )
        .bind(&bar.symbol)
        .bind(bar.bucket_start)
        .bind(bar.open)
        .bind(bar.high)
        .bind(bar.low)
        .bind(bar.close)
        .bind(bar.up_volume)
        .bind(bar.down_volume)
        .bind(bar.volume)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_option_quote(&self, quote: &OptionQuoteRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO option_quotes
                (contract_symbol, bucket_start, underlying, expiration, strike, option_type,
                 last, bid, ask, volume, open_interest,
                 iv, delta, gamma, theta, vega, iv_source)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (contract_symbol, bucket_start) DO UPDATE SET
                last = EXCLUDED.last,
                bid = EXCLUDED.bid,
                ask = EXCLUDED.ask,
                volume = EXCLUDED.volume,
                open_interest = EXCLUDED.open_interest,
                iv = EXCLUDED.iv,
                delta = EXCLUDED.delta,
                gamma = EXCLUDED.gamma,
                theta = EXCLUDED.theta,
                vega = EXCLUDED.vega,
                iv_source = EXCLUDED.iv_source
            "#,
        )
        .bind(&quote.contract_symbol)
        .bind(quote.bucket_start)
        .bind(&quote.underlying)
        .bind(quote.expiration)
        .bind(quote.strike)
        .bind(quote.option_type.as_str())
        .bind(quote.last)
        .bind(quote.bid)
        .bind(quote.ask)
        .bind(quote.volume)
        .bind(quote.open_interest)
        .bind(quote.iv)
        .bind(quote.delta)
        .bind(quote.gamma)
        .bind(quote.theta)
        .bind(quote.vega)
        .bind(quote.iv_source.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_gex_summary(&self, summary: &GexSummary) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO gex_summary
                (underlying, calc_time, max_gamma_strike, max_gamma_value, gamma_flip_point,
                 put_call_ratio, max_pain, total_call_volume, total_put_volume,
                 total_call_oi, total_put_oi, total_net_gex)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (underlying, calc_time) DO UPDATE SET
                max_gamma_strike = EXCLUDED.max_gamma_strike,
                max_gamma_value = EXCLUDED.max_gamma_value,
                gamma_flip_point = EXCLUDED.gamma_flip_point,
                put_call_ratio = EXCLUDED.put_call_ratio,
                max_pain = EXCLUDED.max_pain,
                total_call_volume = EXCLUDED.total_call_volume,
                total_put_volume = EXCLUDED.total_put_volume,
                total_call_oi = EXCLUDED.total_call_oi,
                total_put_oi = EXCLUDED.total_put_oi,
                total_net_gex = EXCLUDED.total_net_gex
            "#,
        )
        .bind(&summary.underlying)
        .bind(summary.calc_time)
        .bind(summary.max_gamma_strike)
        .bind(summary.max_gamma_value)
        .bind(summary.gamma_flip_point)
        .bind(summary.put_call_ratio)
        .bind(summary.max_pain)
        .bind(summary.total_call_volume)
        .bind(summary.total_put_volume)
        .bind(summary.total_call_oi)
        .bind(summary.total_put_oi)
        .bind(summary.total_net_gex)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert the per-strike rows of one calculation in a single short
    /// transaction.
    pub async fn upsert_gex_strikes(&self, rows: &[GexStrikeRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO gex_by_strike
                    (underlying, calc_time, strike, expiration, total_gamma, call_gamma,
                     put_gamma, net_gex, call_volume, put_volume, call_oi, put_oi,
                     vanna_exposure, charm_exposure)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (underlying, calc_time, strike, expiration) DO UPDATE SET
                    total_gamma = EXCLUDED.total_gamma,
                    call_gamma = EXCLUDED.call_gamma,
                    put_gamma = EXCLUDED.put_gamma,
                    net_gex = EXCLUDED.net_gex,
                    call_volume = EXCLUDED.call_volume,
                    put_volume = EXCLUDED.put_volume,
                    call_oi = EXCLUDED.call_oi,
                    put_oi = EXCLUDED.put_oi,
                    vanna_exposure = EXCLUDED.vanna_exposure,
                    charm_exposure = EXCLUDED.charm_exposure
                "#,
            )
            .bind(&row.underlying)
            .bind(row.calc_time)
            .bind(row.strike)
            .bind(row.expiration)
            .bind(row.total_gamma)
            .bind(row.call_gamma)
            .bind(row.put_gamma)
            .bind(row.net_gex)
            .bind(row.call_volume)
            .bind(row.put_volume)
            .bind(row.call_oi)
            .bind(row.put_oi)
            .bind(row.vanna_exposure)
            .bind(row.charm_exposure)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Most recent row per contract under `underlying` whose bucket falls
    /// inside the staleness window.
    pub async fn latest_option_snapshot(
        &self,
        underlying: &str,
        staleness: Duration,
    ) -> Result<Vec<OptionQuoteRow>, StoreError> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(staleness)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (contract_symbol)
                contract_symbol, bucket_start, underlying, expiration, strike, option_type,
                last, bid, ask, volume, open_interest, iv, delta, gamma, theta, vega, iv_source
            FROM option_quotes
            WHERE underlying = $1 AND bucket_start >= $2
            ORDER BY contract_symbol, bucket_start DESC
            "#,
        )
        .bind(underlying)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(option_row_from).collect()
    }

    pub async fn latest_underlying_close(
        &self,
        symbol: &str,
    ) -> Result<Option<(DateTime<Utc>, f64)>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT bucket_start, close
            FROM underlying_bars
            WHERE symbol = $1
            ORDER BY bucket_start DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let bucket: DateTime<Utc> = row.try_get("bucket_start")?;
                let close: f64 = row.try_get("close")?;
                Ok(Some((bucket, close)))
            }
            None => Ok(None),
        }
    }

    /// Delete rows older than the retention window; returns the count.
    pub async fn prune_older_than(
        &self,
        table: PruneTable,
        retention: ChronoDuration,
    ) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - retention;
        let sql = format!(
            "DELETE FROM {} WHERE {} < $1",
            table.table(),
            table.time_column()
        );
        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Periodic retention sweep over the raw and derived tables.
    pub fn spawn_maintenance_loop(
        &self,
        retention_days: i64,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let retention = ChronoDuration::days(retention_days);
                for table in [
                    PruneTable::UnderlyingBars,
                    PruneTable::OptionQuotes,
                    PruneTable::GexSummary,
                    PruneTable::GexByStrike,
                ] {
                    match store.prune_older_than(table, retention).await {
                        Ok(0) => {}
                        Ok(n) => info!("pruned {n} rows from {}", table.table()),
                        Err(err) => log::error!("prune of {} failed: {err}", table.table()),
                    }
                }
            }
        })
    }
}

fn option_row_from(row: &PgRow) -> Result<OptionQuoteRow, StoreError> {
    let type_text: String = row.try_get("option_type")?;
    let option_type = type_text
        .chars()
        .next()
        .and_then(OptionType::from_char)
        .ok_or_else(|| StoreError::Corrupt(format!("option_type '{type_text}'")))?;
    let iv_source: Option<String> = row.try_get("iv_source")?;
    let iv_source = iv_source.as_deref().and_then(IvSource::parse);
    Ok(OptionQuoteRow {
        contract_symbol: row.try_get("contract_symbol")?,
        bucket_start: row.try_get("bucket_start")?,
        underlying: row.try_get("underlying")?,
        expiration: row.try_get("expiration")?,
        strike: row.try_get("strike")?,
        option_type,
        last: row.try_get("last")?,
        bid: row.try_get("bid")?,
        ask: row.try_get("ask")?,
        volume: row.try_get("volume")?,
        open_interest: row.try_get("open_interest")?,
        iv: row.try_get("iv")?,
        delta: row.try_get("delta")?,
        gamma: row.try_get("gamma")?,
        theta: row.try_get("theta")?,
        vega: row.try_get("vega")?,
        iv_source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_tables_map_to_their_time_columns() {
        assert_eq!(PruneTable::OptionQuotes.table(), "option_quotes");
        assert_eq!(PruneTable::OptionQuotes.time_column(), "bucket_start");
        assert_eq!(PruneTable::GexSummary.time_column(), "calc_time");
    }

    #[test]
    fn io_and_pool_errors_are_transient() {
        let err = StoreError::Db(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
        let err = StoreError::Db(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(err.is_transient());
        let err = StoreError::Db(sqlx::Error::RowNotFound);
        assert!(!err.is_transient());
        assert!(!StoreError::Corrupt("x".into()).is_transient());
    }
}
