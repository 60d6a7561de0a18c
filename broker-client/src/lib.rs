// Copyright (c) James Kassemi, SC, US. All rights reserved.
//! Typed request layer over the broker market-data REST API, with bearer
//! authentication, bounded retry, and payload validation at the edge.

pub mod auth;
pub mod clock;
pub mod validate;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use core_types::retry::RetryPolicy;
use log::warn;
use reqwest::{header::RETRY_AFTER, Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;

use auth::{AuthError, TokenSource};
use clock::{session_at, MarketClock};
use validate::{ValidatedBar, ValidatedOptionQuote};

pub const PRODUCTION_BASE_URL: &str = "https://api.tradestation.com/v3";
pub const SANDBOX_BASE_URL: &str = "https://sim-api.tradestation.com/v3";
pub const PRODUCTION_TOKEN_URL: &str = "https://signin.tradestation.com/oauth/token";
pub const SANDBOX_TOKEN_URL: &str = "https://sim-signin.tradestation.com/oauth/token";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("transient broker failure: {detail}")]
    Transient { detail: String },
    #[error("broker rejected request with status {status}")]
    Permanent { status: u16 },
    #[error("malformed broker response: {0}")]
    Malformed(String),
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarUnit {
    Minute,
    Daily,
    Weekly,
    Monthly,
}

impl BarUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarUnit::Minute => "Minute",
            BarUnit::Daily => "Daily",
            BarUnit::Weekly => "Weekly",
            BarUnit::Monthly => "Monthly",
        }
    }
}

/// Either a trailing count of bars or an explicit date range.
#[derive(Debug, Clone)]
pub enum BarQuery {
    BarsBack(usize),
    Range {
        first: DateTime<Utc>,
        last: DateTime<Utc>,
    },
}

/// Wire shape of a bar; the broker serialises numerics as strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireBar {
    #[serde(rename = "TimeStamp")]
    pub time_stamp: Option<String>,
    #[serde(rename = "Open")]
    pub open: Option<String>,
    #[serde(rename = "High")]
    pub high: Option<String>,
    #[serde(rename = "Low")]
    pub low: Option<String>,
    #[serde(rename = "Close")]
    pub close: Option<String>,
    #[serde(rename = "TotalVolume")]
    pub total_volume: Option<String>,
    #[serde(rename = "UpVolume")]
    pub up_volume: Option<String>,
    #[serde(rename = "DownVolume")]
    pub down_volume: Option<String>,
}

/// Wire shape of a quote snapshot (equity or option).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireQuote {
    #[serde(rename = "Symbol")]
    pub symbol: Option<String>,
    #[serde(rename = "TimeStamp")]
    pub time_stamp: Option<String>,
    #[serde(rename = "Last")]
    pub last: Option<String>,
    #[serde(rename = "Bid")]
    pub bid: Option<String>,
    #[serde(rename = "Ask")]
    pub ask: Option<String>,
    #[serde(rename = "Volume")]
    pub volume: Option<String>,
    #[serde(rename = "OpenInterest", alias = "DailyOpenInterest")]
    pub open_interest: Option<String>,
    #[serde(
        rename = "ImpliedVolatility",
        alias = "IV",
        alias = "Volatility",
        alias = "IVol"
    )]
    pub implied_volatility: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireSymbol {
    #[serde(rename = "Symbol")]
    pub symbol: Option<String>,
    #[serde(rename = "Description")]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuotesResponse {
    #[serde(rename = "Quotes")]
    quotes: Option<Vec<WireQuote>>,
}

#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(rename = "Bars")]
    bars: Option<Vec<WireBar>>,
}

#[derive(Debug, Deserialize)]
struct ExpirationsResponse {
    #[serde(rename = "Expirations")]
    expirations: Option<Vec<ExpirationEntry>>,
}

#[derive(Debug, Deserialize)]
struct ExpirationEntry {
    #[serde(rename = "Date")]
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StrikesResponse {
    #[serde(rename = "Strikes")]
    strikes: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Deserialize)]
struct SymbolSearchResponse {
    #[serde(rename = "Symbols")]
    symbols: Option<Vec<WireSymbol>>,
}

/// Operations the ingestion pipeline consumes, abstracted so tests can stub
/// the broker.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Most recent completed one-minute bar, validated; `None` when the
    /// broker returns nothing usable.
    async fn latest_underlying_bar(
        &self,
        symbol: &str,
    ) -> Result<Option<ValidatedBar>, BrokerError>;

    /// Historical bars over `[first, last]`, validated and sorted
    /// oldest-first.
    async fn underlying_bars_range(
        &self,
        symbol: &str,
        interval: u32,
        unit: BarUnit,
        first: DateTime<Utc>,
        last: DateTime<Utc>,
    ) -> Result<Vec<ValidatedBar>, BrokerError>;

    async fn option_expirations(&self, underlying: &str) -> Result<Vec<NaiveDate>, BrokerError>;

    async fn option_strikes(
        &self,
        underlying: &str,
        expiration: NaiveDate,
    ) -> Result<Vec<f64>, BrokerError>;

    /// Quotes for the requested contracts, validated; invalid payloads are
    /// dropped with a warning.
    async fn option_chain(
        &self,
        symbols: &[String],
    ) -> Result<Vec<ValidatedOptionQuote>, BrokerError>;

    fn clock(&self) -> MarketClock;
}

pub struct BrokerClient {
    http: Client,
    base_url: String,
    tokens: Arc<TokenSource>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl BrokerClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        tokens: Arc<TokenSource>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            tokens,
            retry,
            timeout,
        }
    }

    pub async fn quotes(&self, symbols: &[String]) -> Result<Vec<WireQuote>, BrokerError> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let path = format!("marketdata/quotes/{}", symbols.join(","));
        let resp: QuotesResponse = self.get_json(&path, &[]).await?;
        Ok(resp.quotes.unwrap_or_default())
    }

    pub async fn bars(
        &self,
        symbol: &str,
        interval: u32,
        unit: BarUnit,
        query: &BarQuery,
        session_template: &str,
    ) -> Result<Vec<WireBar>, BrokerError> {
        let mut params = vec![
            ("interval", interval.to_string()),
            ("unit", unit.as_str().to_string()),
            ("sessiontemplate", session_template.to_string()),
        ];
        match query {
            BarQuery::BarsBack(n) => params.push(("barsback", n.to_string())),
            BarQuery::Range { first, last } => {
                params.push(("firstdate", first.format("%Y-%m-%dT%H:%M:%SZ").to_string()));
                params.push(("lastdate", last.format("%Y-%m-%dT%H:%M:%SZ").to_string()));
            }
        }
        let path = format!("marketdata/barcharts/{symbol}");
        let resp: BarsResponse = self.get_json(&path, &params).await?;
        Ok(resp.bars.unwrap_or_default())
    }

    /// Available expiration dates, ascending.
    pub async fn expirations(&self, underlying: &str) -> Result<Vec<NaiveDate>, BrokerError> {
        let path = format!("marketdata/options/expirations/{underlying}");
        let resp: ExpirationsResponse = self.get_json(&path, &[]).await?;
        let mut dates: Vec<NaiveDate> = resp
            .expirations
            .unwrap_or_default()
            .iter()
            .filter_map(|entry| {
                entry
                    .date
                    .as_deref()
                    .and_then(validate::parse_timestamp)
                    .map(|dt| dt.date_naive())
            })
            .collect();
        dates.sort();
        dates.dedup();
        Ok(dates)
    }

    /// Available strikes for one expiration, ascending.
    pub async fn strikes(
        &self,
        underlying: &str,
        expiration: NaiveDate,
    ) -> Result<Vec<f64>, BrokerError> {
        let path = format!("marketdata/options/strikes/{underlying}");
        let params = vec![("expiration", expiration.format("%m-%d-%Y").to_string())];
        let resp: StrikesResponse = self.get_json(&path, &params).await?;
        let mut strikes: Vec<f64> = resp
            .strikes
            .unwrap_or_default()
            .iter()
            .filter_map(|row| row.first().and_then(|s| s.parse::<f64>().ok()))
            .filter(|s| s.is_finite() && *s > 0.0)
            .collect();
        strikes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Ok(strikes)
    }

    pub async fn search_symbols(&self, query: &str) -> Result<Vec<WireSymbol>, BrokerError> {
        let params = vec![("search", query.to_string())];
        let resp: SymbolSearchResponse = self.get_json("marketdata/symbols/search", &params).await?;
        Ok(resp.symbols.unwrap_or_default())
    }

    /// Level-2 depth snapshot, passed through untyped; diagnostics only.
    pub async fn market_depth(&self, symbols: &[String]) -> Result<serde_json::Value, BrokerError> {
        let path = format!("marketdata/marketdepth/quotes/{}", symbols.join(","));
        self.get_json(&path, &[]).await
    }

    fn endpoint_url(&self, path: &str, params: &[(&str, String)]) -> Result<Url, BrokerError> {
        let mut url = Url::parse(&format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path
        ))?;
        for (key, value) in params {
            url.query_pairs_mut().append_pair(key, value);
        }
        Ok(url)
    }

    /// Issue one GET with the standard policy: bearer token from the source,
    /// hard timeout, bounded retry on network errors / 5xx / 429 (honouring
    /// any `Retry-After` hint), fail-fast on other 4xx, and a single forced
    /// token refresh on 401 that does not consume a retry attempt.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, BrokerError> {
        let mut attempt = 0;
        let mut refreshed_after_401 = false;
        loop {
            let token = self.tokens.token().await?;
            let url = self.endpoint_url(path, params)?;
            let outcome = self
                .http
                .get(url)
                .bearer_auth(&token.value)
                .timeout(self.timeout)
                .send()
                .await;
            let (detail, hint) = match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    match disposition_for(status, refreshed_after_401) {
                        StatusDisposition::Success => {
                            return resp
                                .json::<T>()
                                .await
                                .map_err(|err| BrokerError::Malformed(err.to_string()));
                        }
                        StatusDisposition::RefreshToken => {
                            refreshed_after_401 = true;
                            warn!("broker returned 401 for {path}, forcing token refresh");
                            self.tokens.invalidate().await;
                            continue;
                        }
                        StatusDisposition::Retry => {
                            let hint = retry_after_hint(resp.headers());
                            (format!("retryable status ({})", status.as_u16()), hint)
                        }
                        StatusDisposition::FailFast => {
                            return Err(BrokerError::Permanent {
                                status: status.as_u16(),
                            });
                        }
                    }
                }
                Err(err) => (format!("request failed: {err}"), None),
            };
            attempt += 1;
            if attempt >= self.retry.max_attempts {
                return Err(BrokerError::Transient { detail });
            }
            let delay = hint.unwrap_or_else(|| self.retry.delay_for(attempt - 1));
            warn!("{detail} on {path}, retrying in {delay:?}");
            sleep(delay).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusDisposition {
    Success,
    /// Network-level failures, 5xx and 429 go through the retry ladder.
    Retry,
    /// A single 401 forces a token refresh outside the retry counter.
    RefreshToken,
    /// Remaining 4xx fail fast.
    FailFast,
}

fn disposition_for(status: StatusCode, already_refreshed: bool) -> StatusDisposition {
    if status.is_success() {
        StatusDisposition::Success
    } else if status == StatusCode::UNAUTHORIZED && !already_refreshed {
        StatusDisposition::RefreshToken
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StatusDisposition::Retry
    } else {
        StatusDisposition::FailFast
    }
}

fn retry_after_hint(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl MarketDataSource for BrokerClient {
    async fn latest_underlying_bar(
        &self,
        symbol: &str,
    ) -> Result<Option<ValidatedBar>, BrokerError> {
        let bars = self
            .bars(symbol, 1, BarUnit::Minute, &BarQuery::BarsBack(1), "USEQPre")
            .await?;
        let Some(bar) = bars.first() else {
            return Ok(None);
        };
        match validate::validated_bar(bar) {
            Ok(validated) => Ok(Some(validated)),
            Err(err) => {
                warn!("dropping invalid {symbol} bar: {err}");
                Ok(None)
            }
        }
    }

    async fn underlying_bars_range(
        &self,
        symbol: &str,
        interval: u32,
        unit: BarUnit,
        first: DateTime<Utc>,
        last: DateTime<Utc>,
    ) -> Result<Vec<ValidatedBar>, BrokerError> {
        let bars = self
            .bars(
                symbol,
                interval,
                unit,
                &BarQuery::Range { first, last },
                "USEQ24Hour",
            )
            .await?;
        let mut validated: Vec<ValidatedBar> = bars
            .iter()
            .filter_map(|bar| match validate::validated_bar(bar) {
                Ok(v) => Some(v),
                Err(err) => {
                    warn!("dropping invalid {symbol} bar: {err}");
                    None
                }
            })
            .collect();
        validated.sort_by_key(|bar| bar.timestamp);
        Ok(validated)
    }

    async fn option_expirations(&self, underlying: &str) -> Result<Vec<NaiveDate>, BrokerError> {
        self.expirations(underlying).await
    }

    async fn option_strikes(
        &self,
        underlying: &str,
        expiration: NaiveDate,
    ) -> Result<Vec<f64>, BrokerError> {
        self.strikes(underlying, expiration).await
    }

    async fn option_chain(
        &self,
        symbols: &[String],
    ) -> Result<Vec<ValidatedOptionQuote>, BrokerError> {
        let quotes = self.quotes(symbols).await?;
        let now = Utc::now();
        Ok(quotes
            .iter()
            .filter_map(|quote| match validate::validated_option_quote(quote, now) {
                Ok(v) => Some(v),
                Err(err) => {
                    warn!("dropping option quote: {err}");
                    None
                }
            })
            .collect())
    }

    fn clock(&self) -> MarketClock {
        let now = Utc::now();
        MarketClock {
            session: session_at(now),
            now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_response_parses_broker_shape() {
        let raw = r#"{
            "Quotes": [{
                "Symbol": "SPY 260321C450",
                "TimeStamp": "2026-03-02T14:30:30Z",
                "Last": "12.10",
                "Bid": "12.00",
                "Ask": "12.20",
                "Volume": "0",
                "OpenInterest": "1000"
            }]
        }"#;
        let resp: QuotesResponse = serde_json::from_str(raw).unwrap();
        let quotes = resp.quotes.unwrap();
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].symbol.as_deref(), Some("SPY 260321C450"));
        assert_eq!(quotes[0].open_interest.as_deref(), Some("1000"));
    }

    #[test]
    fn expirations_response_parses_dates() {
        let raw = r#"{"Expirations": [
            {"Date": "2026-03-21T00:00:00Z"},
            {"Date": "2026-03-28T00:00:00Z"}
        ]}"#;
        let resp: ExpirationsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.expirations.unwrap().len(), 2);
    }

    #[test]
    fn strikes_response_is_nested_string_rows() {
        let raw = r#"{"Strikes": [["445"], ["450"], ["455.5"]]}"#;
        let resp: StrikesResponse = serde_json::from_str(raw).unwrap();
        let strikes = resp.strikes.unwrap();
        assert_eq!(strikes[2][0], "455.5");
    }

    #[test]
    fn status_dispositions_match_the_retry_policy() {
        assert_eq!(
            disposition_for(StatusCode::OK, false),
            StatusDisposition::Success
        );
        assert_eq!(
            disposition_for(StatusCode::SERVICE_UNAVAILABLE, false),
            StatusDisposition::Retry
        );
        assert_eq!(
            disposition_for(StatusCode::TOO_MANY_REQUESTS, false),
            StatusDisposition::Retry
        );
        assert_eq!(
            disposition_for(StatusCode::NOT_FOUND, false),
            StatusDisposition::FailFast
        );
        // One forced refresh per request; a second 401 fails fast.
        assert_eq!(
            disposition_for(StatusCode::UNAUTHORIZED, false),
            StatusDisposition::RefreshToken
        );
        assert_eq!(
            disposition_for(StatusCode::UNAUTHORIZED, true),
            StatusDisposition::FailFast
        );
    }

    #[test]
    fn retry_after_header_parses_delta_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after_hint(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, "later".parse().unwrap());
        assert_eq!(retry_after_hint(&headers), None);
    }
}
