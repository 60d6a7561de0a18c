//! Ingestion engine: drives the broker poll loop, aggregates ticks into
//! one-minute buckets, enriches option buckets with IV and Greeks, and
//! writes everything through idempotent upserts.

pub mod aggregate;
pub mod backfill;
pub mod universe;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use broker_client::clock::exchange_date;
use broker_client::{BrokerError, MarketDataSource};
use chrono::Utc;
use core_types::config::{AppConfig, NumericsConfig};
use core_types::retry::RetryPolicy;
use core_types::status::{OverallStatus, ServiceStatusHandle};
use core_types::types::{IvSource, MarketSession, OptionQuoteRow, UnderlyingBar};
use engine_api::{Engine, EngineError, EngineHealth, EngineResult, HealthStatus};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use storage::{Store, StoreError};
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use aggregate::{
    sort_chronological, AccumulatorKind, Aggregator, BarAccumulator, BucketKey, CompletedBucket,
    QuoteAccumulator,
};
use backfill::BackfillManager;
use universe::StrikeUniverse;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no underlying price available for {0}")]
    NoSpot(String),
    #[error("strike universe is empty for {0}")]
    EmptyUniverse(String),
}

impl IngestError {
    /// Fatal errors halt the engine; everything else is counted and the
    /// next iteration retries fresh.
    pub fn is_fatal(&self) -> bool {
        match self {
            IngestError::Broker(BrokerError::Auth(_)) => true,
            IngestError::Broker(_) => false,
            IngestError::Store(err) => !err.is_transient(),
            IngestError::NoSpot(_) | IngestError::EmptyUniverse(_) => true,
        }
    }
}

/// Write seam between the pipeline and the store, stubbed in tests.
#[async_trait]
pub trait SnapshotWriter: Send + Sync {
    async fn write_underlying_bar(&self, bar: &UnderlyingBar) -> Result<(), StoreError>;
    async fn write_option_quote(&self, quote: &OptionQuoteRow) -> Result<(), StoreError>;
}

#[async_trait]
impl SnapshotWriter for Store {
    async fn write_underlying_bar(&self, bar: &UnderlyingBar) -> Result<(), StoreError> {
        self.upsert_underlying_bar(bar).await
    }

    async fn write_option_quote(&self, quote: &OptionQuoteRow) -> Result<(), StoreError> {
        self.upsert_option_quote(quote).await
    }
}

/// Result of one polling iteration.
pub struct PollOutcome {
    pub completed: Vec<CompletedBucket>,
    pub session: MarketSession,
    pub batch_errors: usize,
}

/// Polls the broker at the session cadence and feeds the aggregator;
/// rebuilds the strike universe when its triggers fire. Broker failures
/// inside an iteration are counted, never fatal, except for auth.
pub struct StreamManager<S: ?Sized> {
    source: Arc<S>,
    cfg: AppConfig,
    universe: StrikeUniverse,
    aggregator: Aggregator,
    iteration: u64,
    spot: Option<f64>,
}

impl<S: MarketDataSource + ?Sized> StreamManager<S> {
    pub fn new(source: Arc<S>, cfg: AppConfig) -> Self {
        let universe = StrikeUniverse::new(
            cfg.underlying.clone(),
            cfg.expirations,
            cfg.strike_distance,
        );
        let aggregator = Aggregator::new(
            cfg.aggregation_bucket_seconds,
            cfg.buffer_flush_interval as i64,
            cfg.max_buffer_size,
        );
        Self {
            source,
            cfg,
            universe,
            aggregator,
            iteration: 0,
            spot: None,
        }
    }

    pub fn spot(&self) -> Option<f64> {
        self.spot
    }

    pub fn live_buckets(&self) -> usize {
        self.aggregator.len()
    }

    pub fn restore(&mut self, bucket: CompletedBucket) {
        self.aggregator.restore(bucket);
    }

    /// Obtain the starting spot and build the initial universe.
    pub async fn initialize(&mut self) -> Result<(), IngestError> {
        let clock = self.source.clock();
        let bar = self
            .source
            .latest_underlying_bar(&self.cfg.underlying)
            .await?
            .ok_or_else(|| IngestError::NoSpot(self.cfg.underlying.clone()))?;
        self.spot = Some(bar.close);
        let today = exchange_date(clock.now);
        self.universe
            .rebuild(&*self.source, bar.close, today)
            .await?;
        if self.universe.is_empty() {
            return Err(IngestError::EmptyUniverse(self.cfg.underlying.clone()));
        }
        info!(
            "stream initialized for {} at spot {:.2}, {} contracts",
            self.cfg.underlying,
            bar.close,
            self.universe.symbols().len()
        );
        Ok(())
    }

    /// One iteration: underlying bar, universe maintenance, option chain in
    /// batches, expired-contract cleanup, then the bucket sweep. The
    /// universe never changes mid-iteration; a rebuild takes effect before
    /// the chain fetch.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, IngestError> {
        self.iteration += 1;
        let clock = self.source.clock();
        let today = exchange_date(clock.now);
        let mut completed = Vec::new();
        let mut batch_errors = 0usize;

        match self.source.latest_underlying_bar(&self.cfg.underlying).await {
            Ok(Some(bar)) => {
                self.spot = Some(bar.close);
                completed.extend(self.aggregator.observe_bar(&self.cfg.underlying, &bar));
            }
            Ok(None) => debug!("no bar for {} this iteration", self.cfg.underlying),
            Err(BrokerError::Auth(err)) => return Err(BrokerError::Auth(err).into()),
            Err(err) => {
                batch_errors += 1;
                warn!("underlying fetch failed: {err}");
            }
        }

        if let Some(spot) = self.spot {
            let triggered = self.universe.should_recompute(
                self.iteration,
                self.cfg.strike_recalc_interval,
                spot,
                self.cfg.price_move_threshold,
                today,
            );
            if triggered {
                match self.universe.rebuild(&*self.source, spot, today).await {
                    Ok(diff) => completed.extend(self.evict_symbols(&diff.dropped)),
                    Err(BrokerError::Auth(err)) => return Err(BrokerError::Auth(err).into()),
                    Err(err) => {
                        batch_errors += 1;
                        warn!("universe rebuild failed: {err}");
                    }
                }
            }
        }

        let symbols: Vec<String> = self.universe.symbols().to_vec();
        for batch in symbols.chunks(self.cfg.option_batch_size.max(1)) {
            match self.source.option_chain(batch).await {
                Ok(quotes) => {
                    for quote in quotes {
                        if quote.contract.expiration < today {
                            debug!("dropping tick for expired contract {}", quote.symbol);
                            continue;
                        }
                        if !self.universe.contains_symbol(&quote.symbol) {
                            continue;
                        }
                        completed.extend(self.aggregator.observe_quote(&quote));
                    }
                }
                Err(BrokerError::Auth(err)) => return Err(BrokerError::Auth(err).into()),
                Err(err) => {
                    batch_errors += 1;
                    error!("option chain batch failed: {err}");
                }
            }
        }

        if self.cfg.strike_cleanup_interval > 0
            && self.iteration % self.cfg.strike_cleanup_interval == 0
        {
            let diff = self.universe.prune_expired(today);
            completed.extend(self.evict_symbols(&diff.dropped));
        }

        completed.extend(self.aggregator.sweep(clock.now));
        sort_chronological(&mut completed);
        Ok(PollOutcome {
            completed,
            session: clock.session,
            batch_errors,
        })
    }

    /// Flush every live bucket, complete or not. Shutdown path.
    pub fn drain(&mut self) -> Vec<CompletedBucket> {
        let mut all = self.aggregator.drain();
        sort_chronological(&mut all);
        all
    }

    fn evict_symbols(&mut self, dropped: &[String]) -> Vec<CompletedBucket> {
        if dropped.is_empty() {
            return Vec::new();
        }
        let set: HashSet<&str> = dropped.iter().map(String::as_str).collect();
        self.aggregator
            .evict_matching(|key, _| set.contains(key.id.as_str()))
    }
}

/// Build the stored row for a completed option bucket: resolve IV through
/// the fallback ladder, then evaluate Greeks. Derived fields stay `None`
/// when the numerics stage is disabled or cannot produce a value; the row
/// is written either way.
pub fn enrich_option_row(
    key: &BucketKey,
    acc: &QuoteAccumulator,
    spot: Option<f64>,
    numerics: &NumericsConfig,
) -> OptionQuoteRow {
    let contract = &acc.contract;
    let mut row = OptionQuoteRow {
        contract_symbol: key.id.clone(),
        bucket_start: key.bucket_start,
        underlying: contract.underlying.clone(),
        expiration: contract.expiration,
        strike: contract.strike,
        option_type: contract.option_type,
        last: acc.last,
        bid: acc.bid,
        ask: acc.ask,
        volume: acc.volume,
        open_interest: acc.open_interest,
        iv: None,
        delta: None,
        gamma: None,
        theta: None,
        vega: None,
        iv_source: None,
    };
    let tau = greeks_engine::years_to_expiry(key.bucket_start, contract.expiration);
    match (numerics.iv_calculation_enabled, spot) {
        (true, Some(spot)) => {
            let resolved = greeks_engine::resolve_iv(
                acc.broker_iv,
                acc.bid,
                acc.ask,
                acc.last,
                contract.option_type,
                spot,
                contract.strike,
                tau,
                numerics,
            );
            row.iv = Some(resolved.iv);
            row.iv_source = Some(resolved.source);
        }
        _ => {
            // Solver off or no spot: keep the broker's figure when it exists.
            if let Some(iv) = acc.broker_iv {
                row.iv = Some(iv);
                row.iv_source = Some(IvSource::Broker);
            }
        }
    }
    if numerics.greeks_enabled {
        if let (Some(iv), Some(spot)) = (row.iv, spot) {
            if let Ok(greeks) = greeks_engine::black_scholes(
                contract.option_type,
                spot,
                contract.strike,
                numerics.risk_free_rate,
                iv,
                tau,
            ) {
                row.delta = Some(greeks.delta);
                row.gamma = Some(greeks.gamma);
                row.theta = Some(greeks.theta);
                row.vega = Some(greeks.vega);
            }
        }
    }
    row
}

pub fn underlying_row(key: &BucketKey, acc: &BarAccumulator) -> UnderlyingBar {
    UnderlyingBar {
        symbol: key.id.clone(),
        bucket_start: key.bucket_start,
        open: acc.open,
        high: acc.high,
        low: acc.low,
        close: acc.close,
        up_volume: acc.up_volume,
        down_volume: acc.down_volume,
        volume: acc.volume,
    }
}

/// Retry `op` on transient store failures with the given policy; permanent
/// failures surface immediately.
pub(crate) async fn write_with_retry<F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay_for(attempt - 1)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Long-running ingestion engine. Owns its runtime; `start` spawns the
/// poll loop, `stop` cancels it and waits for the drain.
pub struct IngestionEngine {
    inner: Arc<IngestInner>,
}

impl IngestionEngine {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        writer: Arc<dyn SnapshotWriter>,
        cfg: AppConfig,
    ) -> Self {
        Self {
            inner: Arc::new(IngestInner {
                source,
                writer,
                cfg,
                state: Mutex::new(RuntimeState::Stopped),
                health: Mutex::new(EngineHealth::new(
                    HealthStatus::Stopped,
                    Some("engine not started".to_string()),
                )),
                status: ServiceStatusHandle::new("ingestion"),
            }),
        }
    }

    pub fn status(&self) -> ServiceStatusHandle {
        self.inner.status.clone()
    }
}

impl Engine for IngestionEngine {
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

struct IngestInner {
    source: Arc<dyn MarketDataSource>,
    writer: Arc<dyn SnapshotWriter>,
    cfg: AppConfig,
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

impl IngestInner {
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
            let mut runner = IngestRunner::new(Arc::clone(&inner));
            match runner.run(cancel_clone).await {
                Ok(()) => {
                    inner.set_health(HealthStatus::Stopped, Some("drained".to_string()));
                }
                Err(err) => {
                    inner.status.set_overall(OverallStatus::Crit);
                    inner.status.push_error(err.to_string());
                    inner.set_health(HealthStatus::Failed, Some(err.to_string()));
                    error!("ingestion engine failed: {err}");
                }
            }
        });
        *guard = RuntimeState::Running(RuntimeBundle {
            runtime,
            handle,
            cancel,
        });
        self.set_health(HealthStatus::Starting, None);
        info!("ingestion engine started for {}", self.cfg.underlying);
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
                warn!("ingestion task join error: {err}");
            }
        }
        info!("ingestion engine stopped");
        Ok(())
    }

    fn set_health(&self, status: HealthStatus, detail: Option<String>) {
        let mut guard = self.health.lock();
        guard.status = status;
        guard.detail = detail;
    }
}

struct IngestRunner {
    inner: Arc<IngestInner>,
    stream: StreamManager<dyn MarketDataSource>,
    numerics: NumericsConfig,
    store_retry: RetryPolicy,
}

impl IngestRunner {
    fn new(inner: Arc<IngestInner>) -> Self {
        let stream = StreamManager::new(Arc::clone(&inner.source), inner.cfg.clone());
        let numerics = inner.cfg.numerics();
        let store_retry = inner.cfg.broker_retry_policy();
        Self {
            inner,
            stream,
            numerics,
            store_retry,
        }
    }

    async fn run(&mut self, cancel: CancellationToken) -> Result<(), IngestError> {
        if self.inner.cfg.backfill_on_startup && self.inner.cfg.lookback_days > 0 {
            self.inner
                .set_health(HealthStatus::Starting, Some("backfilling".to_string()));
            let backfill = BackfillManager::new(
                Arc::clone(&self.inner.source),
                Arc::clone(&self.inner.writer),
                self.inner.cfg.clone(),
            );
            match backfill.run(&cancel).await {
                Ok(report) => info!(
                    "backfill complete: {} bars, {} option rows",
                    report.bars_written, report.options_written
                ),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    self.inner.status.incr_error("backfill");
                    error!("backfill failed, continuing to streaming: {err}");
                }
            }
        }
        if cancel.is_cancelled() {
            return Ok(());
        }

        self.stream.initialize().await?;
        self.inner
            .set_health(HealthStatus::Ready, Some("streaming".to_string()));
        self.inner.status.set_overall(OverallStatus::Ok);

        while !cancel.is_cancelled() {
            match self.stream.poll_once().await {
                Ok(outcome) => {
                    for _ in 0..outcome.batch_errors {
                        self.inner.status.incr_error("broker_transient");
                    }
                    self.write_buckets(outcome.completed).await?;
                    self.inner.status.set_gauge(
                        "last_successful_poll",
                        Utc::now().timestamp() as f64,
                        Some("epoch_s"),
                    );
                    self.inner.status.set_gauge(
                        "live_accumulators",
                        self.stream.live_buckets() as f64,
                        None,
                    );
                    let pause = self.inner.cfg.poll_interval(outcome.session);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    self.inner.status.incr_error("iteration");
                    self.inner.set_health(HealthStatus::Degraded, Some(err.to_string()));
                    error!("stream iteration error: {err}");
                    let pause = self.inner.cfg.poll_interval(self.inner.source.clock().session);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }

        // Flushing: emit every live bucket as final, then let writes drain.
        let remaining = self.stream.drain();
        if !remaining.is_empty() {
            info!("shutdown: flushing {} live buckets", remaining.len());
        }
        self.write_buckets(remaining).await?;
        Ok(())
    }

    /// Serialised writes, oldest bucket first. Transient failures that
    /// outlive the retry budget put the accumulator back so the next sweep
    /// writes the union; permanent failures are fatal.
    async fn write_buckets(&mut self, buckets: Vec<CompletedBucket>) -> Result<(), IngestError> {
        for bucket in buckets {
            let result = match &bucket.data {
                AccumulatorKind::Bar(acc) => {
                    let row = underlying_row(&bucket.key, acc);
                    write_with_retry(&self.store_retry, || {
                        self.inner.writer.write_underlying_bar(&row)
                    })
                    .await
                }
                AccumulatorKind::Quote(acc) => {
                    let row =
                        enrich_option_row(&bucket.key, acc, self.stream.spot(), &self.numerics);
                    write_with_retry(&self.store_retry, || {
                        self.inner.writer.write_option_quote(&row)
                    })
                    .await
                }
            };
            match result {
                Ok(()) => {}
                Err(err) if err.is_transient() => {
                    self.inner.status.incr_error("store_transient");
                    warn!(
                        "store write failed for {}, retaining bucket: {err}",
                        bucket.key.id
                    );
                    self.stream.restore(bucket);
                }
                Err(err) => {
                    self.inner.status.incr_error("store_permanent");
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}
