//! Quiet-hours evaluation and digest scheduling.
//!
//! Everything here is pure: callers pass `now` explicitly. Times of day are
//! read in the subscription's timezone (UTC when none is set).

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc,
};
use chrono_tz::Tz;

use crate::db::models::{DigestFrequency, QuietHoursWindow};

/// Parse `HH:mm` into minutes since midnight.
fn parse_minutes(s: &str) -> Option<u32> {
    let t = NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()?;
    Some(t.hour() * 60 + t.minute())
}

fn parse_timezone(timezone: Option<&str>) -> Option<Tz> {
    match timezone {
        None => Some(chrono_tz::UTC),
        Some(s) if s.trim().is_empty() => Some(chrono_tz::UTC),
        Some(s) => s.trim().parse().ok(),
    }
}

/// Whether `now` falls inside `window`, both bounds inclusive.
///
/// `start > end` wraps midnight. A window or timezone that fails to parse
/// never suppresses delivery.
pub fn is_within_quiet_hours(
    window: &QuietHoursWindow,
    now: NaiveDateTime,
    timezone: Option<&str>,
) -> bool {
    let (Some(s), Some(e)) = (parse_minutes(&window.start), parse_minutes(&window.end)) else {
        tracing::debug!(
            start = %window.start,
            end = %window.end,
            "Unparseable quiet-hours window; not suppressing"
        );
        return false;
    };
    let Some(tz) = parse_timezone(timezone) else {
        tracing::debug!(timezone = ?timezone, "Unknown timezone; not suppressing");
        return false;
    };

    let local = Utc.from_utc_datetime(&now).with_timezone(&tz);
    let n = local.hour() * 60 + local.minute();

    minutes_in_window(s, e, n)
}

fn minutes_in_window(s: u32, e: u32, n: u32) -> bool {
    if s <= e {
        s <= n && n <= e
    } else {
        n >= s || n <= e
    }
}

/// First digest boundary strictly after `now`.
///
/// Hourly: next top of the hour. Daily: next local midnight. Weekly: next
/// local Monday 00:00. An unknown timezone falls back to UTC.
pub fn next_digest_boundary(
    frequency: DigestFrequency,
    now: NaiveDateTime,
    timezone: Option<&str>,
) -> NaiveDateTime {
    let tz = parse_timezone(timezone).unwrap_or(chrono_tz::UTC);
    let local = Utc.from_utc_datetime(&now).with_timezone(&tz);

    match frequency {
        DigestFrequency::Hourly => {
            let floor = now
                .date()
                .and_hms_opt(now.hour(), 0, 0)
                .unwrap_or(now);
            // Zones with sub-hour offsets would shift this; the hour
            // boundary is taken in UTC.
            floor + Duration::hours(1)
        }
        DigestFrequency::Daily => {
            let next_day = local.date_naive() + Duration::days(1);
            local_midnight_utc(&tz, next_day)
        }
        DigestFrequency::Weekly => {
            let days_since_monday = local.weekday().num_days_from_monday() as i64;
            let next_monday = local.date_naive() + Duration::days(7 - days_since_monday);
            local_midnight_utc(&tz, next_monday)
        }
    }
}

/// UTC instant of local midnight on `date`; when midnight falls in a DST gap,
/// the first valid local time after it.
fn local_midnight_utc(tz: &Tz, date: NaiveDate) -> NaiveDateTime {
    let mut candidate = date.and_time(NaiveTime::MIN);
    for _ in 0..4 {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return to_naive_utc(dt),
            LocalResult::Ambiguous(earliest, _) => return to_naive_utc(earliest),
            LocalResult::None => candidate += Duration::minutes(30),
        }
    }
    // No real zone has a gap this long.
    date.and_time(NaiveTime::MIN)
}

fn to_naive_utc(dt: DateTime<Tz>) -> NaiveDateTime {
    dt.with_timezone(&Utc).naive_utc()
}
