use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate};
use rand::Rng;
use std::time::Duration;

use crate::models::price::FetchWindow;

// 日期转换工具

/// Unix seconds of UTC midnight for `date`.
pub fn date_to_timestamp(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

/// Whole UTC calendar date of a unix timestamp.
pub fn timestamp_to_date(ts: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(ts, 0).map(|dt| dt.date_naive())
}

/// 版本号格式 YYYY.M.D（去掉前导零）
pub fn date_version(date: NaiveDate) -> String {
    format!("{}.{}.{}", date.year(), date.month(), date.day())
}

/// Compute the `[start, end)` window still missing for a symbol.
///
/// `start = max(last_date + 1, today - years)`, `end = today + 1`. The start
/// is clamped to `end`, so a symbol that is already current yields an empty
/// window rather than an inverted one.
pub fn compute_window(last_date: Option<NaiveDate>, today: NaiveDate, years_back: i64) -> FetchWindow {
    let horizon = today - ChronoDuration::days(365 * years_back);
    let end = today + ChronoDuration::days(1);

    let start = match last_date {
        Some(last) => (last + ChronoDuration::days(1)).max(horizon),
        None => horizon,
    };

    FetchWindow { start: start.min(end), end }
}

/// `base * 2^(attempt-1)`; attempts are counted from 1.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp)
}

/// Exponential delay scaled by `1 + U(0,1)`.
pub fn jittered_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen::<f64>();
    backoff_delay(base, attempt).mul_f64(factor)
}
