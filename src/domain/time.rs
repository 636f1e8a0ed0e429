//! Timestamp conventions: UTC everywhere internally, stored in a
//! sqlite-datetime()-compatible ISO format. Local time appears only at
//! scheduling boundaries and daily snapshot dates.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

const STORE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Format for storage; lexicographic order matches chronological order and
/// sqlite's datetime() parses it.
pub fn fmt_utc(ts: DateTime<Utc>) -> String {
    ts.format(STORE_FORMAT).to_string()
}

/// Parse a stored timestamp. Accepts RFC 3339 and the bare formats older
/// rows may carry; ambiguous values are read as UTC.
pub fn parse_utc_lossy(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in [STORE_FORMAT, "%Y-%m-%d %H:%M:%S", "%Y-%m-%d"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
        }
    }
    None
}

/// Today's date string (YYYY-MM-DD) in the configured timezone.
pub fn local_date_string(tz: Tz) -> String {
    Utc::now().with_timezone(&tz).format("%Y-%m-%d").to_string()
}

/// Local midnight of the current day, expressed in UTC. This is the daily
/// counter boundary.
pub fn local_midnight_utc(tz: Tz) -> DateTime<Utc> {
    let local_now = Utc::now().with_timezone(&tz);
    let midnight = local_now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid");
    tz.from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap();
        assert_eq!(parse_utc_lossy(&fmt_utc(ts)), Some(ts));
    }

    #[test]
    fn legacy_formats_read_as_utc() {
        let ts = parse_utc_lossy("2024-01-02 03:04:05").unwrap();
        assert_eq!(fmt_utc(ts), "2024-01-02T03:04:05");
        let date_only = parse_utc_lossy("2024-01-02").unwrap();
        assert_eq!(fmt_utc(date_only), "2024-01-02T00:00:00");
        assert!(parse_utc_lossy("not a date").is_none());
    }
}
