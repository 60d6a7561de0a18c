// Copyright (c) James Kassemi, SC, US. All rights reserved.
//! Black-Scholes evaluator and Newton-Raphson implied-volatility solver,
//! plus the contract-level IV resolution ladder.

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::US::Eastern;
use core_types::config::NumericsConfig;
use core_types::types::{IvSource, OptionType};
use libm::erf;
use std::f64::consts::SQRT_2;
use thiserror::Error;

const INV_SQRT_TWO_PI: f64 = 0.3989422804014327;
const DAYS_PER_YEAR: f64 = 365.0;
/// Floor on time to expiry: one minute, in years.
const MIN_TAU_YEARS: f64 = 1.0 / 525_600.0;
const IV_INITIAL_GUESS: f64 = 0.3;
const VEGA_FLOOR: f64 = 1e-8;
/// Quotes down to 99% of intrinsic are tolerated before rejection.
const INTRINSIC_SLACK: f64 = 0.99;

#[derive(Debug, Error, PartialEq)]
pub enum GreeksError {
    #[error("inputs not evaluable")]
    NotEvaluable,
}

#[derive(Debug, Error, PartialEq)]
pub enum IvError {
    #[error("no implied volatility solution")]
    NoSolution,
}

/// Closed-form outputs. Theta and charm are per calendar day, vega per
/// volatility point; everything else per unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Greeks {
    pub price: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub vanna: f64,
    pub charm: f64,
}

fn norm_pdf(x: f64) -> f64 {
    INV_SQRT_TWO_PI * (-0.5 * x * x).exp()
}

fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / SQRT_2))
}

/// Black-Scholes under constant rate, no dividends (carry equals the rate).
pub fn black_scholes(
    option_type: OptionType,
    spot: f64,
    strike: f64,
    rate: f64,
    vol: f64,
    tau: f64,
) -> Result<Greeks, GreeksError> {
    if !(spot > 0.0 && strike > 0.0 && vol > 0.0 && tau > 0.0) || !tau.is_finite() {
        return Err(GreeksError::NotEvaluable);
    }
    let sqrt_tau = tau.sqrt();
    let denom = vol * sqrt_tau;
    let log_term = (spot / strike).ln();
    if !log_term.is_finite() || denom <= 0.0 {
        return Err(GreeksError::NotEvaluable);
    }
    let d1 = (log_term + (rate + 0.5 * vol * vol) * tau) / denom;
    let d2 = d1 - denom;
    let disc = (-rate * tau).exp();
    let pdf_d1 = norm_pdf(d1);
    let nd1 = norm_cdf(d1);
    let nd2 = norm_cdf(d2);

    let gamma = pdf_d1 / (spot * denom);
    let vega = spot * pdf_d1 * sqrt_tau / 100.0;
    let (price, delta, theta_per_year) = match option_type {
        OptionType::Call => {
            let price = spot * nd1 - strike * disc * nd2;
            let theta = -spot * pdf_d1 * vol / (2.0 * sqrt_tau) - rate * strike * disc * nd2;
            (price, nd1, theta)
        }
        OptionType::Put => {
            let price = strike * disc * norm_cdf(-d2) - spot * norm_cdf(-d1);
            let theta =
                -spot * pdf_d1 * vol / (2.0 * sqrt_tau) + rate * strike * disc * norm_cdf(-d2);
            (price, nd1 - 1.0, theta)
        }
    };
    let theta = theta_per_year / DAYS_PER_YEAR;
    let vanna = -pdf_d1 * d2 / vol;
    let charm = -pdf_d1 * (2.0 * rate * tau - d2 * denom) / (2.0 * tau * denom) / DAYS_PER_YEAR;

    let out = Greeks {
        price,
        delta,
        gamma,
        theta,
        vega,
        vanna,
        charm,
    };
    for value in [
        out.price, out.delta, out.gamma, out.theta, out.vega, out.vanna, out.charm,
    ] {
        if !value.is_finite() {
            return Err(GreeksError::NotEvaluable);
        }
    }
    Ok(out)
}

/// Solve for the volatility that reprices `target`.
///
/// Newton iteration seeded at 0.3, every iterate clamped to the configured
/// range; when vega degenerates the remaining iterations switch to bisection
/// over the same range.
pub fn implied_vol(
    target: f64,
    option_type: OptionType,
    spot: f64,
    strike: f64,
    rate: f64,
    tau: f64,
    cfg: &NumericsConfig,
) -> Result<f64, IvError> {
    if !(target.is_finite() && target > 0.0 && spot > 0.0 && strike > 0.0 && tau > 0.0) {
        return Err(IvError::NoSolution);
    }
    let intrinsic = match option_type {
        OptionType::Call => (spot - strike).max(0.0),
        OptionType::Put => (strike - spot).max(0.0),
    };
    if target < intrinsic * INTRINSIC_SLACK {
        return Err(IvError::NoSolution);
    }
    let mut sigma = IV_INITIAL_GUESS.clamp(cfg.iv_min, cfg.iv_max);
    for iteration in 0..cfg.max_iterations {
        let greeks = black_scholes(option_type, spot, strike, rate, sigma, tau)
            .map_err(|_| IvError::NoSolution)?;
        let diff = greeks.price - target;
        if diff.abs() < cfg.tolerance {
            return Ok(sigma);
        }
        // vega is stored per point; the Newton step needs the per-unit slope.
        let slope = greeks.vega * 100.0;
        if slope.abs() < VEGA_FLOOR {
            return bisect(
                target,
                option_type,
                spot,
                strike,
                rate,
                tau,
                cfg,
                cfg.max_iterations - iteration,
            );
        }
        sigma -= diff / slope;
        if !sigma.is_finite() {
            return Err(IvError::NoSolution);
        }
        sigma = sigma.clamp(cfg.iv_min, cfg.iv_max);
    }
    Err(IvError::NoSolution)
}

#[allow(clippy::too_many_arguments)]
fn bisect(
    target: f64,
    option_type: OptionType,
    spot: f64,
    strike: f64,
    rate: f64,
    tau: f64,
    cfg: &NumericsConfig,
    iterations: usize,
) -> Result<f64, IvError> {
    let (mut lo, mut hi) = (cfg.iv_min, cfg.iv_max);
    for _ in 0..iterations.max(1) {
        let mid = 0.5 * (lo + hi);
        let price = black_scholes(option_type, spot, strike, rate, mid, tau)
            .map_err(|_| IvError::NoSolution)?
            .price;
        let diff = price - target;
        if diff.abs() < cfg.tolerance {
            return Ok(mid);
        }
        if diff > 0.0 {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    Err(IvError::NoSolution)
}

/// Outcome of the contract IV fallback ladder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IvResolution {
    pub iv: f64,
    pub source: IvSource,
}

/// Resolve a contract's volatility, first success wins:
/// broker-provided IV in range, then the bid/ask mid, then the last trade,
/// then the configured default. The chosen rung is a pure function of which
/// inputs are present and solvable.
#[allow(clippy::too_many_arguments)]
pub fn resolve_iv(
    broker_iv: Option<f64>,
    bid: Option<f64>,
    ask: Option<f64>,
    last: Option<f64>,
    option_type: OptionType,
    spot: f64,
    strike: f64,
    tau: f64,
    cfg: &NumericsConfig,
) -> IvResolution {
    if let Some(iv) = broker_iv.filter(|iv| (cfg.iv_min..=cfg.iv_max).contains(iv)) {
        return IvResolution {
            iv,
            source: IvSource::Broker,
        };
    }
    if cfg.iv_calculation_enabled {
        if let (Some(bid), Some(ask)) = (bid, ask) {
            if ask >= bid {
                let mid = 0.5 * (bid + ask);
                if let Ok(iv) = implied_vol(
                    mid,
                    option_type,
                    spot,
                    strike,
                    cfg.risk_free_rate,
                    tau,
                    cfg,
                ) {
                    return IvResolution {
                        iv,
                        source: IvSource::SolvedMid,
                    };
                }
            }
        }
        if let Some(last) = last {
            if let Ok(iv) = implied_vol(
                last,
                option_type,
                spot,
                strike,
                cfg.risk_free_rate,
                tau,
                cfg,
            ) {
                return IvResolution {
                    iv,
                    source: IvSource::SolvedLast,
                };
            }
        }
    }
    IvResolution {
        iv: cfg.default_iv,
        source: IvSource::Default,
    }
}

/// Time to expiry in years: 16:00 US/Eastern on the expiration date,
/// 365-day calendar count, floored at one minute.
pub fn years_to_expiry(now: DateTime<Utc>, expiration: chrono::NaiveDate) -> f64 {
    let close = NaiveTime::from_hms_opt(16, 0, 0).unwrap();
    let naive_expiry = expiration.and_time(close);
    let expiry_utc = match Eastern.from_local_datetime(&naive_expiry) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
        chrono::LocalResult::None => Utc.from_utc_datetime(&naive_expiry),
    };
    let seconds = (expiry_utc - now).num_seconds() as f64;
    (seconds / 86_400.0 / DAYS_PER_YEAR).max(MIN_TAU_YEARS)
}
