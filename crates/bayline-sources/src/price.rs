//! Vendor price-string normalization.
//!
//! Vendors report prices as `"$64.50"`, `"64.5"`, `"N/A"`, `"Call"`, empty
//! strings, or garbage. Everything unusable normalizes to `None`; a parsed
//! price must be strictly positive.

/// Normalizes a raw vendor price string. Returns `None` for "N/A", "Call",
/// empty, non-numeric, zero and negative inputs.
pub fn normalize_price(raw: &str) -> Option<f64> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }
    let lowered = cleaned.to_ascii_lowercase();
    if matches!(lowered.as_str(), "n/a" | "na" | "call" | "call for price" | "-") {
        return None;
    }
    let numeric: String = cleaned
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    let value: f64 = numeric.parse().ok()?;
    if value.is_finite() && value > 0.0 {
        Some(round_cents(value))
    } else {
        None
    }
}

/// Optional variant for vendors that send JSON numbers directly.
pub fn normalize_price_value(value: Option<f64>) -> Option<f64> {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => Some(round_cents(v)),
        _ => None,
    }
}

/// Rounds half-up to two decimal places using integer cents.
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Shop markup for matrix-fallback retail: wholesale × (1 + pct/100),
/// rounded to cents.
pub fn apply_markup(wholesale: f64, markup_percent: f64) -> f64 {
    round_cents(wholesale * (1.0 + markup_percent / 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unusable_inputs_normalize_to_none() {
        for raw in ["$0.00", "-5", "N/A", "", "Call", "abc", "0", "n/a", "-"] {
            assert_eq!(normalize_price(raw), None, "{raw:?} should be None");
        }
    }

    #[test]
    fn valid_prices_parse_with_currency_noise() {
        assert_eq!(normalize_price("$64.50"), Some(64.50));
        assert_eq!(normalize_price("64.5"), Some(64.5));
        assert_eq!(normalize_price(" 1,234.99 "), Some(1234.99));
        assert_eq!(normalize_price("USD 12"), Some(12.0));
    }

    #[test]
    fn json_number_variant_rejects_nonpositive() {
        assert_eq!(normalize_price_value(Some(12.345)), Some(12.35));
        assert_eq!(normalize_price_value(Some(0.0)), None);
        assert_eq!(normalize_price_value(Some(-3.0)), None);
        assert_eq!(normalize_price_value(Some(f64::NAN)), None);
        assert_eq!(normalize_price_value(None), None);
    }

    #[test]
    fn markup_is_multiplicative_and_rounded() {
        assert_eq!(apply_markup(64.50, 40.0), 90.30);
        assert_eq!(apply_markup(10.0, 0.0), 10.0);
        assert_eq!(apply_markup(33.333, 10.0), 36.67);
    }
}
