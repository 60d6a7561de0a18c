//! Analytics engine: on an independent cadence, reads the most recent
//! per-contract snapshot from the store, derives GEX-by-strike, gamma flip,
//! max pain and put/call ratios, and writes the summary rows back.
//! Read-only against ingestion; any error in a tick skips the tick.

pub mod calc;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::config::{AppConfig, NumericsConfig};
use core_types::status::{OverallStatus, ServiceStatusHandle};
use core_types::types::{GexStrikeRow, GexSummary, OptionQuoteRow};
use engine_api::{Engine, EngineError, EngineHealth, EngineResult, HealthStatus};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use storage::{Store, StoreError};
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read/write surface the analytics loop needs, stubbed in tests.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    async fn latest_underlying_close(
        &self,
        symbol: &str,
    ) -> Result<Option<(DateTime<Utc>, f64)>, StoreError>;

    async fn latest_option_snapshot(
        &self,
        underlying: &str,
        staleness: Duration,
    ) -> Result<Vec<OptionQuoteRow>, StoreError>;

    async fn write_gex_summary(&self, summary: &GexSummary) -> Result<(), StoreError>;

    async fn write_gex_strikes(&self, rows: &[GexStrikeRow]) -> Result<(), StoreError>;
}

#[async_trait]
impl AnalyticsStore for Store {
    async fn latest_underlying_close(
        &self,
        symbol: &str,
    ) -> Result<Option<(DateTime<Utc>, f64)>, StoreError> {
        Store::latest_underlying_close(self, symbol).await
    }

    async fn latest_option_snapshot(
        &self,
        underlying: &str,
        staleness: Duration,
    ) -> Result<Vec<OptionQuoteRow>, StoreError> {
        Store::latest_option_snapshot(self, underlying, staleness).await
    }

    async fn write_gex_summary(&self, summary: &GexSummary) -> Result<(), StoreError> {
        self.upsert_gex_summary(summary).await
    }

    async fn write_gex_strikes(&self, rows: &[GexStrikeRow]) -> Result<(), StoreError> {
        self.upsert_gex_strikes(rows).await
    }
}

/// One complete calculation cycle. Returns `Ok(false)` when there is
/// nothing usable to compute from (no spot, empty or Greeks-less
/// snapshot); the caller just waits for the next tick.
pub async fn run_calculation(
    store: &dyn AnalyticsStore,
    cfg: &AppConfig,
    numerics: &NumericsConfig,
) -> Result<bool, AnalyticsError> {
    let Some((_, spot)) = store.latest_underlying_close(&cfg.underlying).await? else {
        debug!("no underlying close for {}, skipping tick", cfg.underlying);
        return Ok(false);
    };
    let snapshot = store
        .latest_option_snapshot(
            &cfg.underlying,
            Duration::from_secs(cfg.analytics_staleness_window),
        )
        .await?;
    let eligible: Vec<OptionQuoteRow> = snapshot
        .into_iter()
        .filter(|row| row.gamma.is_some() && row.open_interest > 0)
        .collect();
    if eligible.is_empty() {
        debug!("no contracts with Greeks and open interest, skipping tick");
        return Ok(false);
    }
    let Some(calc_time) = eligible.iter().map(|row| row.bucket_start).max() else {
        return Ok(false);
    };

    let strike_rows = calc::gex_by_strike(&eligible, spot, calc_time, numerics);
    let Some(summary) = calc::summarize(&strike_rows, &eligible, &cfg.underlying, calc_time)
    else {
        return Ok(false);
    };

    store.write_gex_strikes(&strike_rows).await?;
    store.write_gex_summary(&summary).await?;
    info!(
        "{} gex @ {}: max_gamma_strike={:.2} flip={} max_pain={:.2} pcr={} net={:.0}",
        cfg.underlying,
        calc_time,
        summary.max_gamma_strike,
        summary
            .gamma_flip_point
            .map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "n/a".to_string()),
        summary.max_pain,
        summary
            .put_call_ratio
            .map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "n/a".to_string()),
        summary.total_net_gex
    );
    Ok(true)
}

/// Periodic analytics engine. Owns its runtime; ticks never overlap (a
/// long calculation causes the next tick to be skipped, not queued).
pub struct AnalyticsEngine {
    inner: Arc<AnalyticsInner>,
}

impl AnalyticsEngine {
    pub fn new(store: Arc<dyn AnalyticsStore>, cfg: AppConfig) -> Self {
        let numerics = cfg.numerics();
        Self {
            inner: Arc::new(AnalyticsInner {
                store,
                cfg,
                numerics,
                state: Mutex::new(RuntimeState::Stopped),
                health: Mutex::new(EngineHealth::new(
                    HealthStatus::Stopped,
                    Some("engine not started".to_string()),
                )),
                status: ServiceStatusHandle::new("analytics"),
            }),
        }
    }

    pub fn status(&self) -> ServiceStatusHandle {
        self.inner.status.clone()
    }
}

impl Engine for AnalyticsEngine {
    fn start(&self) -> EngineResult<()> {
        self.inner.start()
    }

    fn stop(&self) -> EngineResult<()> {
        self.inner.stop()
    }

    fn health(&self) -> EngineHealth {
        self.inner.health.lock().clone()
    }
}

struct AnalyticsInner {
    store: Arc<dyn AnalyticsStore>,
    cfg: AppConfig,
    numerics: NumericsConfig,
    state: Mutex<RuntimeState>,
    health: Mutex<EngineHealth>,
    status: ServiceStatusHandle,
}

enum RuntimeState {
    Stopped,
    Running(RuntimeBundle),
}

struct RuntimeBundle {
    runtime: Runtime,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl AnalyticsInner {
    fn start(self: &Arc<Self>) -> EngineResult<()> {
        let mut guard = self.state.lock();
        if matches!(*guard, RuntimeState::Running(_)) {
            return Err(EngineError::AlreadyRunning);
        }
        let runtime = Runtime::new().map_err(|err| EngineError::Failure { source: err.into() })?;
        let cancel = CancellationToken::new();
        let inner = Arc::clone(self);
        let cancel_clone = cancel.clone();
        let handle = runtime.spawn(async move {
            inner.run(cancel_clone).await;
        });
        *guard = RuntimeState::Running(RuntimeBundle {
            runtime,
            handle,
            cancel,
        });
        self.set_health(HealthStatus::Ready, Some("calculating".to_string()));
        info!(
            "analytics engine started for {} every {}s",
            self.cfg.underlying, self.cfg.analytics_interval
        );
        Ok(())
    }

    fn stop(&self) -> EngineResult<()> {
        let mut guard = self.state.lock();
        let bundle = match std::mem::replace(&mut *guard, RuntimeState::Stopped) {
            RuntimeState::Running(bundle) => bundle,
            RuntimeState::Stopped => return Err(EngineError::NotRunning),
        };
        bundle.cancel.cancel();
        if let Err(err) = bundle.runtime.block_on(bundle.handle) {
            if !err.is_cancelled() {
                warn!("analytics task join error: {err}");
            }
        }
        self.set_health(HealthStatus::Stopped, None);
        info!("analytics engine stopped");
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.cfg.analytics_interval.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if cancel.is_cancelled() {
                break;
            }
            match run_calculation(&*self.store, &self.cfg, &self.numerics).await {
                Ok(true) => {
                    self.status.set_overall(OverallStatus::Ok);
                    self.status.set_gauge(
                        "last_successful_calc",
                        Utc::now().timestamp() as f64,
                        Some("epoch_s"),
                    );
                }
                Ok(false) => {
                    // Nothing to compute yet; not an error.
                }
                Err(err) => {
                    self.status.incr_error("analytics_tick");
                    self.status.set_overall(OverallStatus::Warn);
                    error!("analytics tick failed, will retry next interval: {err}");
                }
            }
        }
    }

    fn set_health(&self, status: HealthStatus, detail: Option<String>) {
        let mut guard = self.health.lock();
        guard.status = status;
        guard.detail = detail;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use core_types::types::{ContractId, IvSource, OptionType};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct StubStore {
        close: Option<(DateTime<Utc>, f64)>,
        snapshot: Vec<OptionQuoteRow>,
        summaries: StdMutex<Vec<GexSummary>>,
        strike_rows: StdMutex<Vec<GexStrikeRow>>,
    }

    #[async_trait]
    impl AnalyticsStore for StubStore {
        async fn latest_underlying_close(
            &self,
            _symbol: &str,
        ) -> Result<Option<(DateTime<Utc>, f64)>, StoreError> {
            Ok(self.close)
        }

        async fn latest_option_snapshot(
            &self,
            _underlying: &str,
            _staleness: Duration,
        ) -> Result<Vec<OptionQuoteRow>, StoreError> {
            Ok(self.snapshot.clone())
        }

        async fn write_gex_summary(&self, summary: &GexSummary) -> Result<(), StoreError> {
            self.summaries.lock().unwrap().push(summary.clone());
            Ok(())
        }

        async fn write_gex_strikes(&self, rows: &[GexStrikeRow]) -> Result<(), StoreError> {
            self.strike_rows.lock().unwrap().extend(rows.iter().cloned());
            Ok(())
        }
    }

    fn cfg() -> AppConfig {
        config::Config::builder()
            .build()
            .and_then(|c| c.try_deserialize())
            .unwrap()
    }

    fn snapshot_row(
        strike: f64,
        option_type: OptionType,
        gamma: Option<f64>,
        oi: i64,
        bucket: DateTime<Utc>,
    ) -> OptionQuoteRow {
        let contract = ContractId {
            underlying: "SPY".to_string(),
            expiration: chrono::NaiveDate::from_ymd_opt(2026, 3, 20).unwrap(),
            strike,
            option_type,
        };
        OptionQuoteRow {
            contract_symbol: contract.symbol(),
            bucket_start: bucket,
            underlying: "SPY".to_string(),
            expiration: contract.expiration,
            strike,
            option_type,
            last: Some(1.0),
            bid: None,
            ask: None,
            volume: 10,
            open_interest: oi,
            iv: Some(0.2),
            delta: Some(0.5),
            gamma,
            theta: Some(-0.01),
            vega: Some(0.1),
            iv_source: Some(IvSource::Broker),
        }
    }

    #[tokio::test]
    async fn calculation_writes_summary_keyed_by_latest_bucket() {
        let older = Utc.with_ymd_and_hms(2026, 3, 2, 19, 29, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2026, 3, 2, 19, 30, 0).unwrap();
        let store = StubStore {
            close: Some((newer, 450.0)),
            snapshot: vec![
                snapshot_row(450.0, OptionType::Call, Some(0.05), 1000, older),
                snapshot_row(450.0, OptionType::Put, Some(0.05), 500, newer),
                // Excluded: no gamma.
                snapshot_row(445.0, OptionType::Call, None, 1000, newer),
                // Excluded: zero open interest.
                snapshot_row(455.0, OptionType::Call, Some(0.04), 0, newer),
            ],
            ..StubStore::default()
        };
        let cfg = cfg();
        let numerics = cfg.numerics();
        let wrote = run_calculation(&store, &cfg, &numerics).await.unwrap();
        assert!(wrote);

        let summaries = store.summaries.lock().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].calc_time, newer);
        assert_eq!(summaries[0].underlying, "SPY");

        // Only the two eligible contracts contribute one strike group.
        let rows = store.strike_rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].strike, 450.0);
        assert_eq!(rows[0].call_oi, 1000);
        assert_eq!(rows[0].put_oi, 500);
    }

    #[tokio::test]
    async fn calculation_skips_without_spot_or_snapshot() {
        let cfg = cfg();
        let numerics = cfg.numerics();

        let store = StubStore::default();
        assert!(!run_calculation(&store, &cfg, &numerics).await.unwrap());

        let store = StubStore {
            close: Some((Utc::now(), 450.0)),
            ..StubStore::default()
        };
        assert!(!run_calculation(&store, &cfg, &numerics).await.unwrap());
        assert!(store.summaries.lock().unwrap().is_empty());
    }
}
