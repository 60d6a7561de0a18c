// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! The only bridge from broker wire payloads to typed internal records.

use chrono::{DateTime, NaiveDate, Utc};
use core_types::types::{ContractId, OptionType};
use thiserror::Error;

use crate::{WireBar, WireQuote};

/// Broker-reported IV outside this range is treated as not provided.
const BROKER_IV_MIN: f64 = 0.01;
const BROKER_IV_MAX: f64 = 5.0;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("missing or unparseable field {field}")]
    Field { field: &'static str },
    #[error("OHLC ordering violated: o={open} h={high} l={low} c={close}")]
    OhlcOrdering {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
    #[error("invalid option symbol '{symbol}'")]
    Symbol { symbol: String },
}

/// Validated underlying bar tick carrying the broker timestamp.
#[derive(Debug, Clone)]
pub struct ValidatedBar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub up_volume: i64,
    pub down_volume: i64,
    pub volume: i64,
}

/// Validated option quote tick.
#[derive(Debug, Clone)]
pub struct ValidatedOptionQuote {
    pub contract: ContractId,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume: i64,
    pub open_interest: i64,
    pub broker_iv: Option<f64>,
}

pub fn validated_bar(bar: &WireBar) -> Result<ValidatedBar, ValidationError> {
    let timestamp = bar
        .time_stamp
        .as_deref()
        .and_then(parse_timestamp)
        .ok_or(ValidationError::Field { field: "TimeStamp" })?;
    let open = parse_price(&bar.open).ok_or(ValidationError::Field { field: "Open" })?;
    let high = parse_price(&bar.high).ok_or(ValidationError::Field { field: "High" })?;
    let low = parse_price(&bar.low).ok_or(ValidationError::Field { field: "Low" })?;
    let close = parse_price(&bar.close).ok_or(ValidationError::Field { field: "Close" })?;
    if !(low <= open && open <= high && low <= close && close <= high) {
        return Err(ValidationError::OhlcOrdering {
            open,
            high,
            low,
            close,
        });
    }
    Ok(ValidatedBar {
        timestamp,
        open,
        high,
        low,
        close,
        up_volume: parse_counter(&bar.up_volume),
        down_volume: parse_counter(&bar.down_volume),
        volume: parse_counter(&bar.total_volume),
    })
}

/// Validate an option quote. Prices that are absent, unparseable, or
/// non-positive come through as `None`; cumulative counters default to 0;
/// broker IV outside `[0.01, 5.0]` is dropped.
pub fn validated_option_quote(
    quote: &WireQuote,
    fallback_now: DateTime<Utc>,
) -> Result<ValidatedOptionQuote, ValidationError> {
    let symbol = quote
        .symbol
        .as_deref()
        .ok_or(ValidationError::Field { field: "Symbol" })?;
    let contract = parse_option_symbol(symbol)?;
    let timestamp = quote
        .time_stamp
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(fallback_now);
    let broker_iv = quote
        .implied_volatility
        .as_ref()
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|iv| iv.is_finite() && (BROKER_IV_MIN..=BROKER_IV_MAX).contains(iv));
    Ok(ValidatedOptionQuote {
        symbol: symbol.to_string(),
        contract,
        timestamp,
        last: parse_price(&quote.last),
        bid: parse_price(&quote.bid),
        ask: parse_price(&quote.ask),
        volume: parse_counter(&quote.volume),
        open_interest: parse_counter(&quote.open_interest),
        broker_iv,
    })
}

/// Parse the canonical `UNDERLYING YYMMDDC|PSTRIKE` symbol back into a
/// contract identity.
pub fn parse_option_symbol(symbol: &str) -> Result<ContractId, ValidationError> {
    let reject = || ValidationError::Symbol {
        symbol: symbol.to_string(),
    };
    let (underlying, detail) = symbol.split_once(' ').ok_or_else(reject)?;
    if underlying.is_empty() || detail.len() < 8 || !detail.is_ascii() {
        return Err(reject());
    }
    let expiration =
        NaiveDate::parse_from_str(&detail[..6], "%y%m%d").map_err(|_| reject())?;
    let type_char = detail.as_bytes()[6] as char;
    let option_type = OptionType::from_char(type_char).ok_or_else(reject)?;
    let strike: f64 = detail[7..].parse().map_err(|_| reject())?;
    if !strike.is_finite() || strike <= 0.0 {
        return Err(reject());
    }
    Ok(ContractId {
        underlying: underlying.to_string(),
        expiration,
        strike,
        option_type,
    })
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_price(raw: &Option<String>) -> Option<f64> {
    raw.as_ref()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
}

fn parse_counter(raw: &Option<String>) -> i64 {
    raw.as_ref()
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|v| *v >= 0)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_bar(o: &str, h: &str, l: &str, c: &str) -> WireBar {
        WireBar {
            time_stamp: Some("2026-03-02T14:30:00Z".to_string()),
            open: Some(o.to_string()),
            high: Some(h.to_string()),
            low: Some(l.to_string()),
            close: Some(c.to_string()),
            total_volume: Some("1000".to_string()),
            up_volume: Some("600".to_string()),
            down_volume: Some("400".to_string()),
        }
    }

    #[test]
    fn valid_bar_passes() {
        let bar = validated_bar(&wire_bar("450.10", "450.50", "449.90", "450.30")).unwrap();
        assert_eq!(bar.up_volume, 600);
        assert_eq!(bar.down_volume, 400);
        assert_eq!(bar.volume, 1000);
    }

    #[test]
    fn inverted_ohlc_is_rejected() {
        let err = validated_bar(&wire_bar("450.10", "449.00", "449.90", "450.30")).unwrap_err();
        assert!(matches!(err, ValidationError::OhlcOrdering { .. }));
    }

    #[test]
    fn missing_timestamp_names_the_field() {
        let mut bar = wire_bar("450.10", "450.50", "449.90", "450.30");
        bar.time_stamp = None;
        assert_eq!(
            validated_bar(&bar).unwrap_err(),
            ValidationError::Field { field: "TimeStamp" }
        );
    }

    #[test]
    fn option_symbol_round_trips() {
        let id = parse_option_symbol("SPY 260321C450").unwrap();
        assert_eq!(id.underlying, "SPY");
        assert_eq!(id.strike, 450.0);
        assert_eq!(id.option_type, OptionType::Call);
        assert_eq!(id.symbol(), "SPY 260321C450");

        let id = parse_option_symbol("SPY 260321P450.50").unwrap();
        assert_eq!(id.option_type, OptionType::Put);
        assert_eq!(id.strike, 450.5);
        assert_eq!(id.symbol(), "SPY 260321P450.50");
    }

    #[test]
    fn malformed_symbols_are_rejected() {
        for bad in ["SPY", "SPY 2603C450", "SPY 260321X450", "SPY 260321C-5"] {
            assert!(parse_option_symbol(bad).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn out_of_range_broker_iv_is_dropped() {
        let quote = WireQuote {
            symbol: Some("SPY 260321C450".to_string()),
            time_stamp: Some("2026-03-02T14:30:30Z".to_string()),
            last: Some("12.10".to_string()),
            bid: Some("12.00".to_string()),
            ask: Some("12.20".to_string()),
            volume: Some("0".to_string()),
            open_interest: Some("1000".to_string()),
            implied_volatility: Some("9.9".to_string()),
        };
        let validated = validated_option_quote(&quote, Utc::now()).unwrap();
        assert!(validated.broker_iv.is_none());

        let quote = WireQuote {
            implied_volatility: Some("0.25".to_string()),
            ..quote
        };
        let validated = validated_option_quote(&quote, Utc::now()).unwrap();
        assert_eq!(validated.broker_iv, Some(0.25));
    }

    #[test]
    fn zero_prices_come_through_as_absent() {
        let quote = WireQuote {
            symbol: Some("SPY 260321C450".to_string()),
            time_stamp: None,
            last: Some("12.10".to_string()),
            bid: Some("0".to_string()),
            ask: Some("0".to_string()),
            volume: None,
            open_interest: None,
            implied_volatility: None,
        };
        let now = Utc::now();
        let validated = validated_option_quote(&quote, now).unwrap();
        assert!(validated.bid.is_none());
        assert!(validated.ask.is_none());
        assert_eq!(validated.last, Some(12.10));
        assert_eq!(validated.timestamp, now);
        assert_eq!(validated.volume, 0);
    }
}
