//! GEX derivations over a per-contract snapshot: per-strike exposure,
//! gamma flip, max pain, and the summary row.

use chrono::{DateTime, NaiveDate, Utc};
use core_types::config::NumericsConfig;
use core_types::types::{GexStrikeRow, GexSummary, OptionQuoteRow, OptionType};
use std::collections::BTreeMap;

const CONTRACT_MULTIPLIER: f64 = 100.0;

/// Strikes are grouped on a milli-dollar grid so f64 noise cannot split a
/// strike into two groups.
fn strike_key(strike: f64) -> i64 {
    (strike * 1000.0).round() as i64
}

/// Per-(strike, expiration) gamma exposure.
///
/// `call_gamma`/`put_gamma` are gamma x open interest x contract multiplier
/// sums over the side, so `net_gex = call_gamma - put_gamma` holds on every
/// row (dealers short calls, long puts). Vanna and charm exposures use the
/// same weighting, evaluated at the reference spot with the row's stored IV
/// (or the configured default when absent).
pub fn gex_by_strike(
    options: &[OptionQuoteRow],
    spot: f64,
    calc_time: DateTime<Utc>,
    numerics: &NumericsConfig,
) -> Vec<GexStrikeRow> {
    let mut groups: BTreeMap<(i64, NaiveDate), Vec<&OptionQuoteRow>> = BTreeMap::new();
    for row in options {
        groups
            .entry((strike_key(row.strike), row.expiration))
            .or_default()
            .push(row);
    }

    let mut out = Vec::with_capacity(groups.len());
    for ((_, expiration), rows) in groups {
        let strike = rows[0].strike;
        let underlying = rows[0].underlying.clone();
        let tau = greeks_engine::years_to_expiry(calc_time, expiration);
        let mut call_gamma = 0.0;
        let mut put_gamma = 0.0;
        let mut call_volume = 0i64;
        let mut put_volume = 0i64;
        let mut call_oi = 0i64;
        let mut put_oi = 0i64;
        let mut vanna_exposure = 0.0;
        let mut charm_exposure = 0.0;
        for row in &rows {
            let oi = row.open_interest as f64;
            let weighted = row.gamma.unwrap_or(0.0) * oi * CONTRACT_MULTIPLIER;
            match row.option_type {
                OptionType::Call => {
                    call_gamma += weighted;
                    call_volume += row.volume;
                    call_oi += row.open_interest;
                }
                OptionType::Put => {
                    put_gamma += weighted;
                    put_volume += row.volume;
                    put_oi += row.open_interest;
                }
            }
            let iv = row.iv.filter(|v| *v > 0.0).unwrap_or(numerics.default_iv);
            if let Ok(greeks) = greeks_engine::black_scholes(
                row.option_type,
                spot,
                strike,
                numerics.risk_free_rate,
                iv,
                tau,
            ) {
                vanna_exposure += greeks.vanna * oi * CONTRACT_MULTIPLIER;
                charm_exposure += greeks.charm * oi * CONTRACT_MULTIPLIER;
            }
        }
        out.push(GexStrikeRow {
            underlying,
            calc_time,
            strike,
            expiration,
            total_gamma: call_gamma + put_gamma,
            call_gamma,
            put_gamma,
            net_gex: call_gamma - put_gamma,
            call_volume,
            put_volume,
            call_oi,
            put_oi,
            vanna_exposure,
            charm_exposure,
        });
    }
    out
}

/// The strike where cumulative net GEX (ascending by strike, summed across
/// expirations) crosses zero, linearly interpolated between the straddling
/// strikes. With no crossing, the strike whose cumulative value is smallest
/// in magnitude; ties resolve to the lowest strike.
pub fn gamma_flip_point(rows: &[GexStrikeRow]) -> Option<f64> {
    if rows.is_empty() {
        return None;
    }
    let mut per_strike: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    for row in rows {
        let entry = per_strike
            .entry(strike_key(row.strike))
            .or_insert((row.strike, 0.0));
        entry.1 += row.net_gex;
    }
    let mut cumulative = Vec::with_capacity(per_strike.len());
    let mut running = 0.0;
    for (_, (strike, net)) in per_strike {
        running += net;
        cumulative.push((strike, running));
    }

    for &(strike, value) in &cumulative {
        if value == 0.0 {
            return Some(strike);
        }
    }
    for window in cumulative.windows(2) {
        let (k1, c1) = window[0];
        let (k2, c2) = window[1];
        if (c1 < 0.0) != (c2 < 0.0) {
            return Some(k1 + (k2 - k1) * (-c1) / (c2 - c1));
        }
    }

    let mut best = cumulative[0];
    for &(strike, value) in &cumulative[1..] {
        if value.abs() < best.1.abs() {
            best = (strike, value);
        }
    }
    Some(best.0)
}

/// The candidate settlement strike minimising total option-holder payoff,
/// `pain(K) = sum max(0, S_i - K) * OI_call(S_i)
///          + sum max(0, K - S_i) * OI_put(S_i)`
/// over the union of strikes in the snapshot. Ties resolve to the lowest
/// strike.
pub fn max_pain(options: &[OptionQuoteRow]) -> Option<f64> {
    let mut per_strike: BTreeMap<i64, (f64, i64, i64)> = BTreeMap::new();
    for row in options {
        let entry = per_strike
            .entry(strike_key(row.strike))
            .or_insert((row.strike, 0, 0));
        match row.option_type {
            OptionType::Call => entry.1 += row.open_interest,
            OptionType::Put => entry.2 += row.open_interest,
        }
    }
    if per_strike.is_empty() {
        return None;
    }
    let strikes: Vec<(f64, i64, i64)> = per_strike.into_values().collect();
    let mut best: Option<(f64, f64)> = None;
    for &(candidate, _, _) in &strikes {
        let mut pain = 0.0;
        for &(strike, call_oi, put_oi) in &strikes {
            pain += (strike - candidate).max(0.0) * call_oi as f64;
            pain += (candidate - strike).max(0.0) * put_oi as f64;
        }
        best = match best {
            Some((_, current)) if pain < current => Some((candidate, pain)),
            None => Some((candidate, pain)),
            other => other,
        };
    }
    best.map(|(strike, _)| strike)
}

/// One summary row per calculation.
pub fn summarize(
    strike_rows: &[GexStrikeRow],
    options: &[OptionQuoteRow],
    underlying: &str,
    calc_time: DateTime<Utc>,
) -> Option<GexSummary> {
    if strike_rows.is_empty() {
        return None;
    }
    let mut per_strike: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    for row in strike_rows {
        let entry = per_strike
            .entry(strike_key(row.strike))
            .or_insert((row.strike, 0.0));
        entry.1 += row.net_gex;
    }
    let mut max_gamma_strike = 0.0;
    let mut max_gamma_value = 0.0;
    let mut total_net_gex = 0.0;
    let mut best_magnitude = -1.0;
    for (_, (strike, net)) in per_strike {
        total_net_gex += net;
        if net.abs() > best_magnitude {
            best_magnitude = net.abs();
            max_gamma_strike = strike;
            max_gamma_value = net;
        }
    }

    let mut total_call_volume = 0i64;
    let mut total_put_volume = 0i64;
    let mut total_call_oi = 0i64;
    let mut total_put_oi = 0i64;
    for row in options {
        match row.option_type {
            OptionType::Call => {
                total_call_volume += row.volume;
                total_call_oi += row.open_interest;
            }
            OptionType::Put => {
                total_put_volume += row.volume;
                total_put_oi += row.open_interest;
            }
        }
    }
    let put_call_ratio = if total_call_volume > 0 {
        Some(total_put_volume as f64 / total_call_volume as f64)
    } else {
        None
    };

    Some(GexSummary {
        underlying: underlying.to_string(),
        calc_time,
        max_gamma_strike,
        max_gamma_value,
        gamma_flip_point: gamma_flip_point(strike_rows),
        put_call_ratio,
        max_pain: max_pain(options)?,
        total_call_volume,
        total_put_volume,
        total_call_oi,
        total_put_oi,
        total_net_gex,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn calc_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 19, 30, 0).unwrap()
    }

    fn expiry() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 20).unwrap()
    }

    fn row(
        strike: f64,
        option_type: OptionType,
        gamma: f64,
        oi: i64,
        volume: i64,
    ) -> OptionQuoteRow {
        let contract = core_types::types::ContractId {
            underlying: "SPY".to_string(),
            expiration: expiry(),
            strike,
            option_type,
        };
        OptionQuoteRow {
            contract_symbol: contract.symbol(),
            bucket_start: calc_time(),
            underlying: "SPY".to_string(),
            expiration: expiry(),
            strike,
            option_type,
            last: Some(1.0),
            bid: None,
            ask: None,
            volume,
            open_interest: oi,
            iv: Some(0.2),
            delta: Some(0.5),
            gamma: Some(gamma),
            theta: Some(-0.02),
            vega: Some(0.1),
            iv_source: Some(core_types::types::IvSource::SolvedMid),
        }
    }

    /// Three-strike fixture: {445, 450, 455} with known gamma and OI.
    fn fixture() -> Vec<OptionQuoteRow> {
        vec![
            row(445.0, OptionType::Call, 0.04, 1000, 100),
            row(445.0, OptionType::Put, 0.04, 2000, 200),
            row(450.0, OptionType::Call, 0.05, 2000, 200),
            row(450.0, OptionType::Put, 0.05, 1000, 100),
            row(455.0, OptionType::Call, 0.03, 1500, 150),
            row(455.0, OptionType::Put, 0.03, 500, 50),
        ]
    }

    #[test]
    fn per_strike_rows_satisfy_the_net_gex_identity() {
        let rows = gex_by_strike(&fixture(), 450.0, calc_time(), &NumericsConfig::default());
        assert_eq!(rows.len(), 3);
        for row in &rows {
            let expected = row.call_gamma - row.put_gamma;
            let scale = expected.abs().max(1.0);
            assert!(
                (row.net_gex - expected).abs() / scale < 1e-6,
                "identity broken at {}",
                row.strike
            );
        }
        // 450: call 0.05*2000*100 = 10000, put 0.05*1000*100 = 5000.
        let atm = rows.iter().find(|r| r.strike == 450.0).unwrap();
        assert!((atm.call_gamma - 10_000.0).abs() < 1e-9);
        assert!((atm.put_gamma - 5_000.0).abs() < 1e-9);
        assert!((atm.net_gex - 5_000.0).abs() < 1e-9);
        assert_eq!(atm.call_oi, 2000);
        assert_eq!(atm.put_oi, 1000);
        assert!(atm.vanna_exposure.is_finite());
        assert!(atm.charm_exposure.is_finite());
    }

    #[test]
    fn summary_pins_argmax_totals_flip_and_max_pain() {
        let options = fixture();
        let rows = gex_by_strike(&options, 450.0, calc_time(), &NumericsConfig::default());
        let summary = summarize(&rows, &options, "SPY", calc_time()).unwrap();

        // Nets: 445 -> -4000, 450 -> +5000, 455 -> +3000.
        assert_eq!(summary.max_gamma_strike, 450.0);
        assert!((summary.max_gamma_value - 5_000.0).abs() < 1e-9);
        assert!((summary.total_net_gex - 4_000.0).abs() < 1e-9);

        // Cumulative: -4000 at 445, +1000 at 450 -> crossing interpolates to
        // 445 + 5 * 4000/5000 = 449.
        let flip = summary.gamma_flip_point.unwrap();
        assert!((flip - 449.0).abs() < 1e-9, "flip {flip}");

        // pain(445)=25000, pain(450)=17500, pain(455)=25000.
        assert_eq!(summary.max_pain, 450.0);

        assert_eq!(summary.total_call_volume, 450);
        assert_eq!(summary.total_put_volume, 350);
        assert!((summary.put_call_ratio.unwrap() - 350.0 / 450.0).abs() < 1e-12);
    }

    #[test]
    fn flip_without_crossing_reports_smallest_cumulative_magnitude() {
        let options = vec![
            row(445.0, OptionType::Call, 0.04, 1000, 10),
            row(450.0, OptionType::Call, 0.05, 1000, 10),
        ];
        let rows = gex_by_strike(&options, 450.0, calc_time(), &NumericsConfig::default());
        // Cumulative is 4000 then 9000; no crossing, 445 is closest to zero.
        assert_eq!(gamma_flip_point(&rows), Some(445.0));
    }

    #[test]
    fn max_pain_ties_resolve_to_the_lowest_strike() {
        // Symmetric book: pain(445) == pain(455).
        let options = vec![
            row(445.0, OptionType::Call, 0.01, 1000, 10),
            row(455.0, OptionType::Put, 0.01, 1000, 10),
        ];
        // pain(445) = put side (445-455 clamps to 0) = 0; call side 0.
        // pain(455) = call (445): 0 for calls at 445? call contributes
        // max(0, 445-455)=0; put contributes max(0,455-455)=0.
        // Both zero -> lowest strike wins.
        assert_eq!(max_pain(&options), Some(445.0));
    }

    #[test]
    fn put_call_ratio_is_null_without_call_volume() {
        let options = vec![
            row(450.0, OptionType::Put, 0.05, 1000, 100),
            row(450.0, OptionType::Call, 0.05, 1000, 0),
        ];
        let rows = gex_by_strike(&options, 450.0, calc_time(), &NumericsConfig::default());
        let summary = summarize(&rows, &options, "SPY", calc_time()).unwrap();
        assert!(summary.put_call_ratio.is_none());
    }
}
