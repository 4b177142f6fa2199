//! Timezone-Aware Time Operations
//!
//! All timestamps are generated in the configured service timezone (default
//! `Asia/Tokyo`) and stored as RFC 3339 with offset. Date-range queries
//! accept relative phrases in Japanese and English, absolute dates, and
//! `start..end` spans.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Resolve the configured timezone, falling back to UTC on an invalid name.
pub fn service_timezone(name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or_else(|_| {
        tracing::warn!("Invalid timezone '{}', using UTC", name);
        chrono_tz::UTC
    })
}

/// Current time in the service timezone with a fixed offset.
pub fn now_in_tz(tz_name: &str) -> DateTime<FixedOffset> {
    let tz = service_timezone(tz_name);
    Utc::now().with_timezone(&tz).fixed_offset()
}

/// Key timestamp component: `YYYYMMDDHHMMSS` of the current service time.
pub fn key_timestamp(now: DateTime<FixedOffset>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

fn start_of_day(dt: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    dt.with_hour(0)
        .and_then(|d| d.with_minute(0))
        .and_then(|d| d.with_second(0))
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt)
}

fn end_of_day(dt: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    dt.with_hour(23)
        .and_then(|d| d.with_minute(59))
        .and_then(|d| d.with_second(59))
        .and_then(|d| d.with_nanosecond(999_999_000))
        .unwrap_or(dt)
}

fn parse_single_date(
    text: &str,
    reference: DateTime<FixedOffset>,
) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt);
    }
    let date = text.parse::<NaiveDate>().ok()?;
    let naive = date.and_hms_opt(0, 0, 0)?;
    reference.timezone().from_local_datetime(&naive).single()
}

/// Parse a date query into an inclusive (start, end) range.
///
/// Accepted: 今日/today, 昨日/yesterday, 今週/this week, 先週/last week,
/// 今月/this month, `N日前`/`N days ago`, `last_30_days`, `YYYY-MM-DD`,
/// and `YYYY-MM-DD..YYYY-MM-DD`.
pub fn parse_date_query(
    query: &str,
    now: DateTime<FixedOffset>,
) -> Result<(DateTime<FixedOffset>, DateTime<FixedOffset>), String> {
    let q = query.trim();
    match q {
        "今日" | "today" => return Ok((start_of_day(now), end_of_day(now))),
        "昨日" | "yesterday" => {
            let yesterday = now - Duration::days(1);
            return Ok((start_of_day(yesterday), end_of_day(yesterday)));
        }
        "今週" | "this week" => {
            let monday = now - Duration::days(now.weekday().num_days_from_monday() as i64);
            return Ok((start_of_day(monday), now));
        }
        "先週" | "last week" => {
            let monday = now - Duration::days(now.weekday().num_days_from_monday() as i64 + 7);
            let start = start_of_day(monday);
            return Ok((start, end_of_day(start + Duration::days(6))));
        }
        "今月" | "this month" => {
            let first = now.with_day(1).map(start_of_day).unwrap_or(now);
            return Ok((first, now));
        }
        "last_30_days" => return Ok((start_of_day(now - Duration::days(30)), now)),
        _ => {}
    }

    if q.contains("日前") || q.contains("days ago") {
        let digits: String = q.chars().filter(|c| c.is_ascii_digit()).collect();
        let days: i64 = digits
            .parse()
            .map_err(|_| format!("Could not parse days from: '{}'", q))?;
        let target = now - Duration::days(days);
        return Ok((start_of_day(target), end_of_day(target)));
    }

    if let Some((start_text, end_text)) = q.split_once("..") {
        let start = parse_single_date(start_text, now)
            .ok_or_else(|| format!("Invalid date range format: '{}' (expected YYYY-MM-DD..YYYY-MM-DD)", q))?;
        let end = parse_single_date(end_text, now)
            .ok_or_else(|| format!("Invalid date range format: '{}' (expected YYYY-MM-DD..YYYY-MM-DD)", q))?;
        return Ok((start, end_of_day(end)));
    }

    let target = parse_single_date(q, now).ok_or_else(|| {
        format!(
            "Invalid date format: '{}'. Use 'YYYY-MM-DD', '今日', '昨日', '3日前', or 'YYYY-MM-DD..YYYY-MM-DD'",
            q
        )
    })?;
    Ok((start_of_day(target), end_of_day(target)))
}

/// Elapsed time between `from` and `now`, formatted as `N日 N時間 N分`.
pub fn format_elapsed(from: DateTime<FixedOffset>, now: DateTime<FixedOffset>) -> String {
    let delta = now.signed_duration_since(from);
    let total_seconds = delta.num_seconds().max(0);
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}日", days));
    }
    if hours > 0 {
        parts.push(format!("{}時間", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}分", minutes));
    }
    if parts.is_empty() {
        "1分未満".to_string()
    } else {
        parts.join(" ")
    }
}

/// Memory age in fractional days at `now`.
pub fn age_days(created_at: DateTime<FixedOffset>, now: DateTime<FixedOffset>) -> f64 {
    now.signed_duration_since(created_at).num_seconds().max(0) as f64 / 86_400.0
}
