// Copyright (c) James Kassemi, SC, US. All rights reserved.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::US::Eastern;
use core_types::types::MarketSession;

/// Snapshot of the exchange clock.
#[derive(Debug, Clone, Copy)]
pub struct MarketClock {
    pub session: MarketSession,
    pub now: DateTime<Utc>,
}

/// Classify a UTC instant against the US equity session grid:
/// pre-open 04:00–09:30 ET, regular 09:30–16:00 ET, after-hours
/// 16:00–20:00 ET, closed otherwise and on weekends.
pub fn session_at(now: DateTime<Utc>) -> MarketSession {
    let et = now.with_timezone(&Eastern);
    if matches!(et.weekday(), Weekday::Sat | Weekday::Sun) {
        return MarketSession::Closed;
    }
    let t = et.time();
    let pre_open = NaiveTime::from_hms_opt(4, 0, 0).unwrap();
    let regular_open = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
    let regular_close = NaiveTime::from_hms_opt(16, 0, 0).unwrap();
    let after_close = NaiveTime::from_hms_opt(20, 0, 0).unwrap();
    if t < pre_open {
        MarketSession::Closed
    } else if t < regular_open {
        MarketSession::PreOpen
    } else if t < regular_close {
        MarketSession::RegularOpen
    } else if t < after_close {
        MarketSession::AfterHours
    } else {
        MarketSession::Closed
    }
}

/// Calendar date on the exchange clock; expirations compare against this.
pub fn exchange_date(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Eastern).date_naive()
}
