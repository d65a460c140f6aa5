// Timestamp helpers: storage keeps unix seconds (f64), the API renders RFC 3339.
use chrono::{DateTime, Datelike, TimeZone, Utc};

pub fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

pub fn format_ts(ts: f64) -> String {
    let millis = (ts * 1000.0).round() as i64;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn format_opt_ts(ts: Option<f64>) -> Option<String> {
    ts.map(format_ts)
}

/// First instant of the UTC month containing `ts`.
pub fn month_start_ts(ts: f64) -> f64 {
    let millis = (ts * 1000.0) as i64;
    let now = DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default();
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .map(|value| value.timestamp() as f64)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_start_truncates_to_first_day() {
        // 2024-03-17T12:30:00Z
        let ts = 1_710_678_600.0;
        // 2024-03-01T00:00:00Z
        assert_eq!(month_start_ts(ts), 1_709_251_200.0);
    }

    #[test]
    fn format_renders_utc_rfc3339() {
        assert_eq!(format_ts(1_709_251_200.5), "2024-03-01T00:00:00.500Z");
    }
}
