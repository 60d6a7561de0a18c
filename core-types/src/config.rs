// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::time::Duration;

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::retry::RetryPolicy;
use crate::types::MarketSession;

/// Runtime configuration, loaded from the process environment.
///
/// Every field maps to an environment variable of the same name uppercased
/// (`UNDERLYING`, `API_RETRY_ATTEMPTS`, ...) with the default applied when
/// the variable is absent.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "d_underlying")]
    pub underlying: String,
    #[serde(default = "d_expirations")]
    pub expirations: usize,
    #[serde(default = "d_strike_distance")]
    pub strike_distance: f64,
    #[serde(default = "d_strike_recalc_interval")]
    pub strike_recalc_interval: u64,
    #[serde(default = "d_price_move_threshold")]
    pub price_move_threshold: f64,
    #[serde(default = "d_strike_cleanup_interval")]
    pub strike_cleanup_interval: u64,

    #[serde(default = "d_market_hours_poll_interval")]
    pub market_hours_poll_interval: u64,
    #[serde(default = "d_extended_hours_poll_interval")]
    pub extended_hours_poll_interval: u64,
    #[serde(default = "d_closed_hours_poll_interval")]
    pub closed_hours_poll_interval: u64,

    #[serde(default = "d_aggregation_bucket_seconds")]
    pub aggregation_bucket_seconds: i64,
    #[serde(default = "d_max_buffer_size")]
    pub max_buffer_size: usize,
    #[serde(default = "d_buffer_flush_interval")]
    pub buffer_flush_interval: u64,

    #[serde(default = "d_api_request_timeout")]
    pub api_request_timeout: u64,
    #[serde(default = "d_api_retry_attempts")]
    pub api_retry_attempts: usize,
    #[serde(default = "d_api_retry_delay")]
    pub api_retry_delay: f64,
    #[serde(default = "d_api_retry_backoff")]
    pub api_retry_backoff: f64,
    #[serde(default = "d_quote_batch_size")]
    pub quote_batch_size: usize,
    #[serde(default = "d_option_batch_size")]
    pub option_batch_size: usize,

    #[serde(default = "d_greeks_enabled")]
    pub greeks_enabled: bool,
    #[serde(default = "d_iv_calculation_enabled")]
    pub iv_calculation_enabled: bool,
    #[serde(default = "d_iv_max_iterations")]
    pub iv_max_iterations: usize,
    #[serde(default = "d_iv_tolerance")]
    pub iv_tolerance: f64,
    #[serde(default = "d_iv_min")]
    pub iv_min: f64,
    #[serde(default = "d_iv_max")]
    pub iv_max: f64,
    #[serde(default = "d_risk_free_rate")]
    pub risk_free_rate: f64,
    #[serde(default = "d_implied_volatility_default")]
    pub implied_volatility_default: f64,

    #[serde(default = "d_analytics_interval")]
    pub analytics_interval: u64,
    #[serde(default = "d_analytics_staleness_window")]
    pub analytics_staleness_window: u64,

    #[serde(default = "d_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "d_backfill_on_startup")]
    pub backfill_on_startup: bool,
    #[serde(default = "d_backfill_sample_every_n_bars")]
    pub backfill_sample_every_n_bars: usize,

    #[serde(default = "d_data_retention_days")]
    pub data_retention_days: i64,

    #[serde(default)]
    pub broker_client_id: String,
    #[serde(default)]
    pub broker_client_secret: String,
    #[serde(default)]
    pub broker_refresh_token: String,
    #[serde(default)]
    pub broker_use_sandbox: bool,

    #[serde(default = "d_db_host")]
    pub db_host: String,
    #[serde(default = "d_db_port")]
    pub db_port: u16,
    #[serde(default = "d_db_name")]
    pub db_name: String,
    #[serde(default = "d_db_user")]
    pub db_user: String,
    #[serde(default)]
    pub db_password: String,
    #[serde(default = "d_db_pool_min")]
    pub db_pool_min: u32,
    #[serde(default = "d_db_pool_max")]
    pub db_pool_max: u32,
}

fn d_underlying() -> String {
    "SPY".to_string()
}
fn d_expirations() -> usize {
    3
}
fn d_strike_distance() -> f64 {
    10.0
}
fn d_strike_recalc_interval() -> u64 {
    10
}
fn d_price_move_threshold() -> f64 {
    1.0
}
fn d_strike_cleanup_interval() -> u64 {
    100
}
fn d_market_hours_poll_interval() -> u64 {
    5
}
fn d_extended_hours_poll_interval() -> u64 {
    30
}
fn d_closed_hours_poll_interval() -> u64 {
    300
}
fn d_aggregation_bucket_seconds() -> i64 {
    60
}
fn d_max_buffer_size() -> usize {
    1000
}
fn d_buffer_flush_interval() -> u64 {
    60
}
fn d_api_request_timeout() -> u64 {
    30
}
fn d_api_retry_attempts() -> usize {
    3
}
fn d_api_retry_delay() -> f64 {
    1.0
}
fn d_api_retry_backoff() -> f64 {
    2.0
}
fn d_quote_batch_size() -> usize {
    100
}
fn d_option_batch_size() -> usize {
    100
}
fn d_greeks_enabled() -> bool {
    true
}
fn d_iv_calculation_enabled() -> bool {
    true
}
fn d_iv_max_iterations() -> usize {
    100
}
fn d_iv_tolerance() -> f64 {
    1e-5
}
fn d_iv_min() -> f64 {
    0.01
}
fn d_iv_max() -> f64 {
    5.0
}
fn d_risk_free_rate() -> f64 {
    0.05
}
fn d_implied_volatility_default() -> f64 {
    0.20
}
fn d_analytics_interval() -> u64 {
    60
}
fn d_analytics_staleness_window() -> u64 {
    300
}
fn d_lookback_days() -> i64 {
    7
}
fn d_backfill_on_startup() -> bool {
    true
}
fn d_backfill_sample_every_n_bars() -> usize {
    1
}
fn d_data_retention_days() -> i64 {
    90
}
fn d_db_host() -> String {
    "localhost".to_string()
}
fn d_db_port() -> u16 {
    5432
}
fn d_db_name() -> String {
    "gexflow".to_string()
}
fn d_db_user() -> String {
    "postgres".to_string()
}
fn d_db_pool_min() -> u32 {
    1
}
fn d_db_pool_max() -> u32 {
    10
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?;
        settings.try_deserialize()
    }

    /// Broker credentials must be present before ingestion can start.
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("BROKER_CLIENT_ID", &self.broker_client_id),
            ("BROKER_CLIENT_SECRET", &self.broker_client_secret),
            ("BROKER_REFRESH_TOKEN", &self.broker_refresh_token),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Message(format!(
                    "missing required environment variable {name}"
                )));
            }
        }
        Ok(())
    }

    /// Broker call policy per the configured retry knobs. No jitter: the
    /// delay ladder is exactly `d, d·b, d·b²`.
    pub fn broker_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.api_retry_attempts,
            (self.api_retry_delay * 1000.0) as u64,
            self.api_retry_backoff,
            0.0,
        )
    }

    pub fn numerics(&self) -> NumericsConfig {
        NumericsConfig {
            greeks_enabled: self.greeks_enabled,
            iv_calculation_enabled: self.iv_calculation_enabled,
            max_iterations: self.iv_max_iterations,
            tolerance: self.iv_tolerance,
            iv_min: self.iv_min,
            iv_max: self.iv_max,
            risk_free_rate: self.risk_free_rate,
            default_iv: self.implied_volatility_default,
        }
    }

    pub fn poll_interval(&self, session: MarketSession) -> Duration {
        let secs = match session {
            MarketSession::RegularOpen => self.market_hours_poll_interval,
            MarketSession::PreOpen | MarketSession::AfterHours => {
                self.extended_hours_poll_interval
            }
            MarketSession::Closed => self.closed_hours_poll_interval,
        };
        Duration::from_secs(secs)
    }
}

/// Solver and Greeks tuning shared by the enrichment stage and analytics.
#[derive(Debug, Clone)]
pub struct NumericsConfig {
    pub greeks_enabled: bool,
    pub iv_calculation_enabled: bool,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub iv_min: f64,
    pub iv_max: f64,
    pub risk_free_rate: f64,
    pub default_iv: f64,
}

impl Default for NumericsConfig {
    fn default() -> Self {
        Self {
            greeks_enabled: true,
            iv_calculation_enabled: true,
            max_iterations: d_iv_max_iterations(),
            tolerance: d_iv_tolerance(),
            iv_min: d_iv_min(),
            iv_max: d_iv_max(),
            risk_free_rate: d_risk_free_rate(),
            default_iv: d_implied_volatility_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_follows_session() {
        let cfg: AppConfig = Config::builder()
            .build()
            .and_then(|c| c.try_deserialize())
            .unwrap();
        assert_eq!(
            cfg.poll_interval(MarketSession::RegularOpen),
            Duration::from_secs(5)
        );
        assert_eq!(
            cfg.poll_interval(MarketSession::PreOpen),
            Duration::from_secs(30)
        );
        assert_eq!(
            cfg.poll_interval(MarketSession::AfterHours),
            Duration::from_secs(30)
        );
        assert_eq!(
            cfg.poll_interval(MarketSession::Closed),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let cfg: AppConfig = Config::builder()
            .build()
            .and_then(|c| c.try_deserialize())
            .unwrap();
        assert!(cfg.require_credentials().is_err());
    }
}
