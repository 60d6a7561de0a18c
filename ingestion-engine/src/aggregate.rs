//! One-minute bucket aggregation: a map from `(id, bucket_start)` to an
//! accumulator, plus the sweep operation that emits completed buckets.

use broker_client::validate::{ValidatedBar, ValidatedOptionQuote};
use chrono::{DateTime, Utc};
use core_types::types::ContractId;
use std::collections::HashMap;

/// Floor a timestamp to its bucket start. Half-open on the left: a tick
/// exactly on the boundary lands in the bucket it starts.
pub fn floor_to_bucket(ts: DateTime<Utc>, bucket_secs: i64) -> DateTime<Utc> {
    let secs = ts.timestamp().div_euclid(bucket_secs) * bucket_secs;
    DateTime::from_timestamp(secs, 0).unwrap_or(ts)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub id: String,
    pub bucket_start: DateTime<Utc>,
}

/// OHLC accumulator for underlying bars. Cumulative counters are overwritten
/// with the newer value, never summed, and never allowed to decrease within
/// a bucket.
#[derive(Debug, Clone)]
pub struct BarAccumulator {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub up_volume: i64,
    pub down_volume: i64,
    pub volume: i64,
}

impl BarAccumulator {
    fn new(tick: &ValidatedBar) -> Self {
        Self {
            open: tick.open,
            high: tick.high,
            low: tick.low,
            close: tick.close,
            up_volume: tick.up_volume,
            down_volume: tick.down_volume,
            volume: tick.volume,
        }
    }

    fn merge(&mut self, tick: &ValidatedBar) {
        self.high = self.high.max(tick.high);
        self.low = self.low.min(tick.low);
        self.close = tick.close;
        self.up_volume = self.up_volume.max(tick.up_volume);
        self.down_volume = self.down_volume.max(tick.down_volume);
        self.volume = self.volume.max(tick.volume);
    }
}

/// Quote accumulator for option contracts. Prices take the latest non-null
/// value; cumulative counters follow the same overwrite rule as bars.
#[derive(Debug, Clone)]
pub struct QuoteAccumulator {
    pub contract: ContractId,
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume: i64,
    pub open_interest: i64,
    pub broker_iv: Option<f64>,
}

impl QuoteAccumulator {
    fn new(tick: &ValidatedOptionQuote) -> Self {
        Self {
            contract: tick.contract.clone(),
            last: tick.last,
            bid: tick.bid,
            ask: tick.ask,
            volume: tick.volume,
            open_interest: tick.open_interest,
            broker_iv: tick.broker_iv,
        }
    }

    fn merge(&mut self, tick: &ValidatedOptionQuote) {
        if tick.last.is_some() {
            self.last = tick.last;
        }
        if tick.bid.is_some() {
            self.bid = tick.bid;
        }
        if tick.ask.is_some() {
            self.ask = tick.ask;
        }
        self.volume = self.volume.max(tick.volume);
        self.open_interest = self.open_interest.max(tick.open_interest);
        if tick.broker_iv.is_some() {
            self.broker_iv = tick.broker_iv;
        }
    }
}

#[derive(Debug, Clone)]
pub enum AccumulatorKind {
    Bar(BarAccumulator),
    Quote(QuoteAccumulator),
}

/// A bucket declared complete and handed downstream for enrichment + write.
#[derive(Debug, Clone)]
pub struct CompletedBucket {
    pub key: BucketKey,
    pub data: AccumulatorKind,
}

pub struct Aggregator {
    bucket_secs: i64,
    stale_after_secs: i64,
    max_buffer: usize,
    buffers: HashMap<BucketKey, AccumulatorKind>,
}

impl Aggregator {
    /// `stale_after_secs` force-flushes a bucket that has been buffered for
    /// that long even if its window has not ended.
    pub fn new(bucket_secs: i64, stale_after_secs: i64, max_buffer: usize) -> Self {
        let bucket_secs = bucket_secs.max(1);
        Self {
            bucket_secs,
            stale_after_secs: stale_after_secs.max(1),
            max_buffer: max_buffer.max(1),
            buffers: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Fold an underlying tick into its bucket. Returns buckets force-flushed
    /// by back-pressure, if the buffer cap was exceeded.
    pub fn observe_bar(&mut self, symbol: &str, tick: &ValidatedBar) -> Vec<CompletedBucket> {
        let key = BucketKey {
            id: symbol.to_string(),
            bucket_start: floor_to_bucket(tick.timestamp, self.bucket_secs),
        };
        match self.buffers.get_mut(&key) {
            Some(AccumulatorKind::Bar(acc)) => acc.merge(tick),
            Some(AccumulatorKind::Quote(_)) => {}
            None => {
                self.buffers
                    .insert(key, AccumulatorKind::Bar(BarAccumulator::new(tick)));
            }
        }
        self.enforce_capacity()
    }

    /// Fold an option quote tick into its bucket.
    pub fn observe_quote(&mut self, tick: &ValidatedOptionQuote) -> Vec<CompletedBucket> {
        let key = BucketKey {
            id: tick.symbol.clone(),
            bucket_start: floor_to_bucket(tick.timestamp, self.bucket_secs),
        };
        match self.buffers.get_mut(&key) {
            Some(AccumulatorKind::Quote(acc)) => acc.merge(tick),
            Some(AccumulatorKind::Bar(_)) => {}
            None => {
                self.buffers
                    .insert(key, AccumulatorKind::Quote(QuoteAccumulator::new(tick)));
            }
        }
        self.enforce_capacity()
    }

    /// Emit every accumulator whose bucket window has ended, plus any that
    /// have sat in the buffer past the stale bound.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<CompletedBucket> {
        let flush_after = self.bucket_secs.min(self.stale_after_secs);
        let ended: Vec<BucketKey> = self
            .buffers
            .keys()
            .filter(|key| now.timestamp() >= key.bucket_start.timestamp() + flush_after)
            .cloned()
            .collect();
        self.take(ended)
    }

    /// Emit everything, including buckets still inside their window. Used on
    /// shutdown.
    pub fn drain(&mut self) -> Vec<CompletedBucket> {
        let keys: Vec<BucketKey> = self.buffers.keys().cloned().collect();
        self.take(keys)
    }

    /// Flush-then-drop every accumulator matching the predicate. Used when
    /// the strike universe evicts contracts.
    pub fn evict_matching<F>(&mut self, predicate: F) -> Vec<CompletedBucket>
    where
        F: Fn(&BucketKey, &AccumulatorKind) -> bool,
    {
        let keys: Vec<BucketKey> = self
            .buffers
            .iter()
            .filter(|(key, data)| predicate(key, data))
            .map(|(key, _)| key.clone())
            .collect();
        self.take(keys)
    }

    /// Put a bucket back after a failed write so the next attempt writes the
    /// union of old and any newly arrived ticks.
    pub fn restore(&mut self, bucket: CompletedBucket) {
        self.buffers.entry(bucket.key).or_insert(bucket.data);
    }

    fn enforce_capacity(&mut self) -> Vec<CompletedBucket> {
        let mut flushed = Vec::new();
        while self.buffers.len() > self.max_buffer {
            let Some(oldest) = self.buffers.keys().min_by_key(|k| k.bucket_start).cloned()
            else {
                break;
            };
            if let Some(data) = self.buffers.remove(&oldest) {
                flushed.push(CompletedBucket { key: oldest, data });
            }
        }
        sort_chronological(&mut flushed);
        flushed
    }

    fn take(&mut self, mut keys: Vec<BucketKey>) -> Vec<CompletedBucket> {
        keys.sort_by(|a, b| {
            a.bucket_start
                .cmp(&b.bucket_start)
                .then_with(|| a.id.cmp(&b.id))
        });
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(data) = self.buffers.remove(&key) {
                out.push(CompletedBucket { key, data });
            }
        }
        out
    }
}

/// Oldest bucket first, then by id; keeps per-contract writes monotone in
/// bucket_start.
pub fn sort_chronological(buckets: &mut [CompletedBucket]) {
    buckets.sort_by(|a, b| {
        a.key
            .bucket_start
            .cmp(&b.key.bucket_start)
            .then_with(|| a.key.id.cmp(&b.key.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use core_types::types::OptionType;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    fn bar(ts: DateTime<Utc>, close: f64, volume: i64) -> ValidatedBar {
        ValidatedBar {
            timestamp: ts,
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            up_volume: volume / 2,
            down_volume: volume / 2,
            volume,
        }
    }

    fn quote(ts: DateTime<Utc>, volume: i64, oi: i64) -> ValidatedOptionQuote {
        ValidatedOptionQuote {
            contract: ContractId {
                underlying: "SPY".to_string(),
                expiration: chrono::NaiveDate::from_ymd_opt(2026, 3, 21).unwrap(),
                strike: 450.0,
                option_type: OptionType::Call,
            },
            symbol: "SPY 260321C450".to_string(),
            timestamp: ts,
            last: Some(12.10),
            bid: Some(12.00),
            ask: Some(12.20),
            volume,
            open_interest: oi,
            broker_iv: None,
        }
    }

    #[test]
    fn boundary_tick_lands_in_starting_bucket() {
        let mut agg = Aggregator::new(60, 60, 1000);
        agg.observe_bar("SPY", &bar(at(14, 30, 0), 450.0, 100));
        // Not complete at 14:30:59, complete at 14:31:00.
        assert!(agg.sweep(at(14, 30, 59)).is_empty());
        let done = agg.sweep(at(14, 31, 0));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].key.bucket_start, at(14, 30, 0));
    }

    #[test]
    fn ohlc_merges_and_counters_overwrite() {
        let mut agg = Aggregator::new(60, 60, 1000);
        agg.observe_bar("SPY", &bar(at(14, 30, 5), 450.0, 100));
        let mut second = bar(at(14, 30, 40), 451.0, 150);
        second.high = 452.0;
        second.low = 449.0;
        agg.observe_bar("SPY", &second);
        let done = agg.sweep(at(14, 31, 0));
        let AccumulatorKind::Bar(acc) = &done[0].data else {
            panic!("expected bar accumulator");
        };
        assert_eq!(acc.open, 450.0);
        assert_eq!(acc.high, 452.0);
        assert_eq!(acc.low, 449.0);
        assert_eq!(acc.close, 451.0);
        // Cumulative counters are replaced, never summed.
        assert_eq!(acc.volume, 150);
    }

    #[test]
    fn quote_counters_never_decrease_within_a_bucket() {
        let mut agg = Aggregator::new(60, 60, 1000);
        agg.observe_quote(&quote(at(14, 30, 5), 100, 1000));
        agg.observe_quote(&quote(at(14, 30, 30), 90, 1000));
        let done = agg.sweep(at(14, 31, 0));
        let AccumulatorKind::Quote(acc) = &done[0].data else {
            panic!("expected quote accumulator");
        };
        assert_eq!(acc.volume, 100);
    }

    #[test]
    fn stale_price_fields_do_not_clobber() {
        let mut agg = Aggregator::new(60, 60, 1000);
        agg.observe_quote(&quote(at(14, 30, 5), 0, 0));
        let mut second = quote(at(14, 30, 30), 0, 0);
        second.last = None;
        second.bid = Some(12.05);
        agg.observe_quote(&second);
        let done = agg.drain();
        let AccumulatorKind::Quote(acc) = &done[0].data else {
            panic!("expected quote accumulator");
        };
        assert_eq!(acc.last, Some(12.10));
        assert_eq!(acc.bid, Some(12.05));
    }

    #[test]
    fn back_pressure_flushes_oldest_without_loss() {
        let mut agg = Aggregator::new(60, 60, 1);
        let first = agg.observe_bar("SPY", &bar(at(14, 30, 10), 450.0, 100));
        assert!(first.is_empty());
        let flushed = agg.observe_bar("SPY", &bar(at(14, 31, 10), 451.0, 200));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].key.bucket_start, at(14, 30, 0));
        let rest = agg.drain();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].key.bucket_start, at(14, 31, 0));
    }

    #[test]
    fn evict_matching_flushes_then_drops() {
        let mut agg = Aggregator::new(60, 60, 1000);
        agg.observe_quote(&quote(at(14, 31, 10), 5, 50));
        agg.observe_bar("SPY", &bar(at(14, 31, 5), 450.0, 100));
        let evicted = agg.evict_matching(|key, _| key.id == "SPY 260321C450");
        assert_eq!(evicted.len(), 1);
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn restore_keeps_data_for_the_next_attempt() {
        let mut agg = Aggregator::new(60, 60, 1000);
        agg.observe_bar("SPY", &bar(at(14, 30, 5), 450.0, 100));
        let done = agg.sweep(at(14, 31, 0));
        assert_eq!(agg.len(), 0);
        agg.restore(done.into_iter().next().unwrap());
        assert_eq!(agg.len(), 1);
    }
}
