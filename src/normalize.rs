//! Pure normalization helpers for call-monitor records: timestamp parsing,
//! phone-number canonicalization and MSN detection. These never fail; they
//! fall back to the current instant or an empty string.

use chrono::{DateTime, Datelike, FixedOffset, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

const TIMESTAMP_LAYOUT: &str = "%d.%m.%y %H:%M:%S";

/// Parses the router's `DD.MM.YY hh:mm:ss` timestamp in the given zone.
///
/// Two-digit years are resolved so the instant falls inside
/// `[now - 50 years, now + 10 years]`; a naive parse outside that window is
/// shifted by one century. Unparseable input yields the current instant.
pub fn parse_timestamp(raw: &str, tz: Tz) -> DateTime<FixedOffset> {
    let now = Utc::now().with_timezone(&tz);

    let naive = match NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_LAYOUT) {
        Ok(naive) => resolve_century(naive, now.year()),
        Err(_) => return now.fixed_offset(),
    };

    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.fixed_offset(),
        // DST-ambiguous local times resolve to the earlier instant.
        LocalResult::Ambiguous(earliest, _) => earliest.fixed_offset(),
        LocalResult::None => now.fixed_offset(),
    }
}

fn resolve_century(naive: NaiveDateTime, current_year: i32) -> NaiveDateTime {
    let year = naive.year();
    let shifted = if year < current_year - 50 {
        naive.with_year(year + 100)
    } else if year > current_year + 10 {
        naive.with_year(year - 100)
    } else {
        return naive;
    };
    shifted.unwrap_or(naive)
}

/// Canonicalizes a raw phone number towards E.164 using the configured
/// country code and local-area code.
///
/// `00` becomes `+`, a single leading `0` becomes `+<country>`, and a bare
/// subscriber number gets `+<country><area>` prepended. Anything else is
/// returned unchanged, which makes the function idempotent.
pub fn normalize_number(raw: &str, country_code: &str, area_code: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }

    if let Some(rest) = raw.strip_prefix("00") {
        return format!("+{}", rest);
    }

    if let Some(rest) = raw.strip_prefix('0') {
        if !country_code.is_empty() {
            return format!("+{}{}", country_code, rest);
        }
        return raw.to_string();
    }

    if !raw.starts_with('+') && !country_code.is_empty() && !area_code.is_empty() {
        return format!("+{}{}{}", country_code, area_code, raw);
    }

    raw.to_string()
}

/// Returns the first configured MSN that the normalized number ends with,
/// or an empty string.
pub fn detect_msn(number: &str, msns: &[String]) -> String {
    if number.is_empty() {
        return String::new();
    }
    msns.iter()
        .find(|msn| !msn.is_empty() && number.ends_with(msn.as_str()))
        .cloned()
        .unwrap_or_default()
}
