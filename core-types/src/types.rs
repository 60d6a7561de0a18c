// Copyright (c) James Kassemi, SC, US. All rights reserved.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Market session classification derived from the exchange clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketSession {
    PreOpen,
    RegularOpen,
    AfterHours,
    Closed,
}

impl MarketSession {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketSession::PreOpen => "pre-open",
            MarketSession::RegularOpen => "regular",
            MarketSession::AfterHours => "after-hours",
            MarketSession::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_char(&self) -> char {
        match self {
            OptionType::Call => 'C',
            OptionType::Put => 'P',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'C' | 'c' => Some(OptionType::Call),
            'P' | 'p' => Some(OptionType::Put),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "C",
            OptionType::Put => "P",
        }
    }
}

/// Identity of a single option contract.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractId {
    pub underlying: String,
    pub expiration: NaiveDate,
    pub strike: f64,
    pub option_type: OptionType,
}

impl ContractId {
    /// Canonical printable symbol: `UNDERLYING YYMMDDC|PSTRIKE`.
    ///
    /// Integer strikes print bare, fractional strikes with two decimals:
    /// `SPY 260321C450`, `SPY 260321P450.50`.
    pub fn symbol(&self) -> String {
        let exp = self.expiration.format("%y%m%d");
        if (self.strike - self.strike.trunc()).abs() < f64::EPSILON {
            format!(
                "{} {}{}{}",
                self.underlying,
                exp,
                self.option_type.as_char(),
                self.strike as i64
            )
        } else {
            format!(
                "{} {}{}{:.2}",
                self.underlying,
                exp,
                self.option_type.as_char(),
                self.strike
            )
        }
    }
}

/// One-minute OHLC bar for the underlying, keyed by `(symbol, bucket_start)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnderlyingBar {
    pub symbol: String,
    pub bucket_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub up_volume: i64,
    pub down_volume: i64,
    pub volume: i64,
}

/// Which rung of the IV fallback ladder produced the stored volatility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IvSource {
    Broker,
    SolvedMid,
    SolvedLast,
    Default,
}

impl IvSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IvSource::Broker => "broker",
            IvSource::SolvedMid => "solved_mid",
            IvSource::SolvedLast => "solved_last",
            IvSource::Default => "default",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "broker" => Some(IvSource::Broker),
            "solved_mid" => Some(IvSource::SolvedMid),
            "solved_last" => Some(IvSource::SolvedLast),
            "default" => Some(IvSource::Default),
            _ => None,
        }
    }
}

/// One-minute option quote snapshot, keyed by `(contract_symbol, bucket_start)`.
///
/// The derived fields (`iv` through `vega`) stay `None` until the enrichment
/// stage runs; `iv_source` records which ladder rung produced `iv`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionQuoteRow {
    pub contract_symbol: String,
    pub bucket_start: DateTime<Utc>,
    pub underlying: String,
    pub expiration: NaiveDate,
    pub strike: f64,
    pub option_type: OptionType,
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume: i64,
    pub open_interest: i64,
    pub iv: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub iv_source: Option<IvSource>,
}

/// Per-underlying GEX summary, keyed by `(underlying, calc_time)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GexSummary {
    pub underlying: String,
    pub calc_time: DateTime<Utc>,
    pub max_gamma_strike: f64,
    pub max_gamma_value: f64,
    pub gamma_flip_point: Option<f64>,
    pub put_call_ratio: Option<f64>,
    pub max_pain: f64,
    pub total_call_volume: i64,
    pub total_put_volume: i64,
    pub total_call_oi: i64,
    pub total_put_oi: i64,
    pub total_net_gex: f64,
}

/// Per-strike GEX row, keyed by `(underlying, calc_time, strike, expiration)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GexStrikeRow {
    pub underlying: String,
    pub calc_time: DateTime<Utc>,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub total_gamma: f64,
    pub call_gamma: f64,
    pub put_gamma: f64,
    pub net_gex: f64,
    pub call_volume: i64,
    pub put_volume: i64,
    pub call_oi: i64,
    pub put_oi: i64,
    pub vanna_exposure: f64,
    pub charm_exposure: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_formats_integer_strike_bare() {
        let id = ContractId {
            underlying: "SPY".to_string(),
            expiration: NaiveDate::from_ymd_opt(2026, 3, 21).unwrap(),
            strike: 450.0,
            option_type: OptionType::Call,
        };
        assert_eq!(id.symbol(), "SPY 260321C450");
    }

    #[test]
    fn symbol_formats_fractional_strike_with_two_decimals() {
        let id = ContractId {
            underlying: "SPY".to_string(),
            expiration: NaiveDate::from_ymd_opt(2026, 3, 21).unwrap(),
            strike: 450.5,
            option_type: OptionType::Put,
        };
        assert_eq!(id.symbol(), "SPY 260321P450.50");
    }

    #[test]
    fn iv_source_round_trips_through_text() {
        for src in [
            IvSource::Broker,
            IvSource::SolvedMid,
            IvSource::SolvedLast,
            IvSource::Default,
        ] {
            assert_eq!(IvSource::parse(src.as_str()), Some(src));
        }
        assert_eq!(IvSource::parse("garbage"), None);
    }
}
