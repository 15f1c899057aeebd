//! Shared helpers: fixed-decimal rounding, exchange wall-clock and
//! display formatting.

use chrono::{Duration, Utc};
use chrono_tz::Europe::Rome;

/// Round to three fractional digits (cash amounts, quotes).
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Round to two fractional digits (traded value, spreads).
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Exchange-local date, `YYYY-MM-DD`.
pub fn today() -> String {
    Utc::now().with_timezone(&Rome).format("%Y-%m-%d").to_string()
}

/// Exchange-local date of the next day, `YYYY-MM-DD`.
pub fn tomorrow() -> String {
    (Utc::now().with_timezone(&Rome) + Duration::days(1))
        .format("%Y-%m-%d")
        .to_string()
}

/// Exchange-local timestamp, `YYYY-MM-DD HH:MM:SS`.
pub fn now() -> String {
    Utc::now()
        .with_timezone(&Rome)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Exchange-local time of day, `HH:MM:SS`.
pub fn nowtime() -> String {
    Utc::now().with_timezone(&Rome).format("%H:%M:%S").to_string()
}

/// Render an optional numeric cell; missing values display as `--`.
pub fn value_fmt(value: Option<f64>) -> serde_json::Value {
    match value {
        Some(v) => serde_json::json!(v),
        None => serde_json::Value::String("--".into()),
    }
}

/// Integer variant of [`value_fmt`].
pub fn value_fmt_int(value: Option<i64>) -> serde_json::Value {
    match value {
        Some(v) => serde_json::json!(v),
        None => serde_json::Value::String("--".into()),
    }
}

/// Canonical string key for a price level in the depth-by-price maps.
pub fn price_key(price: f64) -> String {
    format!("{}", price)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round3() {
        assert_eq!(round3(1.23456), 1.235);
        assert_eq!(round3(400.0004), 400.0);
        assert_eq!(round3(-0.0005), -0.001);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(12.345), 12.35);
        assert_eq!(round2(100.004), 100.0);
    }

    #[test]
    fn test_value_fmt() {
        assert_eq!(value_fmt(None), serde_json::json!("--"));
        assert_eq!(value_fmt(Some(1.5)), serde_json::json!(1.5));
    }

    #[test]
    fn test_price_key() {
        assert_eq!(price_key(100.0), "100");
        assert_eq!(price_key(99.5), "99.5");
    }
}
