//! The active set of option contracts being polled for one underlying.

use broker_client::{BrokerError, MarketDataSource};
use chrono::NaiveDate;
use core_types::types::{ContractId, OptionType};
use log::{debug, info};
use std::collections::HashSet;

/// Contracts evicted by a rebuild or an expiration roll; the caller flushes
/// their accumulators before dropping them.
#[derive(Debug, Default)]
pub struct UniverseDiff {
    pub dropped: Vec<String>,
}

pub struct StrikeUniverse {
    underlying: String,
    num_expirations: usize,
    strike_distance: f64,
    expirations: Vec<NaiveDate>,
    contracts: Vec<ContractId>,
    symbols: Vec<String>,
    symbol_set: HashSet<String>,
    last_recalc_price: Option<f64>,
}

impl StrikeUniverse {
    pub fn new(underlying: impl Into<String>, num_expirations: usize, strike_distance: f64) -> Self {
        Self {
            underlying: underlying.into(),
            num_expirations: num_expirations.max(1),
            strike_distance,
            expirations: Vec::new(),
            contracts: Vec::new(),
            symbols: Vec::new(),
            symbol_set: HashSet::new(),
            last_recalc_price: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn contains_symbol(&self, symbol: &str) -> bool {
        self.symbol_set.contains(symbol)
    }

    /// Recompute triggers, any of: the unconditional iteration cadence, a
    /// spot move beyond the threshold since the last rebuild, or an
    /// expiration in the current set rolling past.
    pub fn should_recompute(
        &self,
        iteration: u64,
        recalc_interval: u64,
        spot: f64,
        move_threshold: f64,
        today: NaiveDate,
    ) -> bool {
        if self.contracts.is_empty() {
            return true;
        }
        if self.expirations.iter().any(|exp| *exp < today) {
            return true;
        }
        if recalc_interval > 0 && iteration % recalc_interval == 0 {
            return true;
        }
        match self.last_recalc_price {
            Some(prev) => (spot - prev).abs() > move_threshold,
            None => true,
        }
    }

    /// Rebuild from the next N future expirations and the strikes within the
    /// configured dollar distance of spot, calls and puts both. The new set
    /// replaces the old one wholesale.
    pub async fn rebuild<S>(
        &mut self,
        source: &S,
        spot: f64,
        today: NaiveDate,
    ) -> Result<UniverseDiff, BrokerError>
    where
        S: MarketDataSource + ?Sized,
    {
        let expirations: Vec<NaiveDate> = source
            .option_expirations(&self.underlying)
            .await?
            .into_iter()
            .filter(|exp| *exp >= today)
            .take(self.num_expirations)
            .collect();

        let mut contracts = Vec::new();
        for expiration in &expirations {
            let min_strike = spot - self.strike_distance;
            let max_strike = spot + self.strike_distance;
            let strikes = source.option_strikes(&self.underlying, *expiration).await?;
            let mut in_range = 0usize;
            for strike in strikes {
                if strike < min_strike || strike > max_strike {
                    continue;
                }
                in_range += 1;
                for option_type in [OptionType::Call, OptionType::Put] {
                    contracts.push(ContractId {
                        underlying: self.underlying.clone(),
                        expiration: *expiration,
                        strike,
                        option_type,
                    });
                }
            }
            debug!(
                "{} exp {expiration}: {in_range} strikes in [{min_strike:.2}, {max_strike:.2}]",
                self.underlying
            );
        }

        let symbols: Vec<String> = contracts.iter().map(ContractId::symbol).collect();
        let symbol_set: HashSet<String> = symbols.iter().cloned().collect();
        let dropped: Vec<String> = self
            .symbols
            .iter()
            .filter(|sym| !symbol_set.contains(*sym))
            .cloned()
            .collect();

        info!(
            "{} universe rebuilt at spot {spot:.2}: {} expirations, {} contracts ({} dropped)",
            self.underlying,
            expirations.len(),
            contracts.len(),
            dropped.len()
        );
        self.expirations = expirations;
        self.contracts = contracts;
        self.symbols = symbols;
        self.symbol_set = symbol_set;
        self.last_recalc_price = Some(spot);
        Ok(UniverseDiff { dropped })
    }

    /// Drop contracts whose expiration has passed. Invariant: every contract
    /// in the set expires on or after the exchange-local date.
    pub fn prune_expired(&mut self, today: NaiveDate) -> UniverseDiff {
        if !self.expirations.iter().any(|exp| *exp < today) {
            return UniverseDiff::default();
        }
        let mut dropped = Vec::new();
        self.expirations.retain(|exp| *exp >= today);
        let mut kept = Vec::with_capacity(self.contracts.len());
        for contract in self.contracts.drain(..) {
            if contract.expiration < today {
                dropped.push(contract.symbol());
            } else {
                kept.push(contract);
            }
        }
        self.contracts = kept;
        self.symbols = self.contracts.iter().map(ContractId::symbol).collect();
        self.symbol_set = self.symbols.iter().cloned().collect();
        if !dropped.is_empty() {
            info!("{}: pruned {} expired contracts", self.underlying, dropped.len());
        }
        UniverseDiff { dropped }
    }
}
