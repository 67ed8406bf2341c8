//! Numeric coercion of telemetry values.
//!
//! The server delivers every value as a string. A string is promoted to a
//! number only when printing that number back yields the exact same string,
//! so `"42"` becomes `42` while `"42.0"`, `"007"` and `"1e3"` stay strings.

use serde_json::{Number, Value};

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Coerces a numeric-looking string to a JSON number. Idempotent.
pub fn convert_value(value: &Value) -> Value {
    match value {
        Value::String(text) if !text.is_empty() => match text.parse::<f64>() {
            Ok(number) if number.is_finite() && js_number_string(number) == *text => {
                number_value(number)
            }
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}

/// Numeric view of a value, accepting numbers and numeric strings.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Wraps an `f64` as a JSON number, preferring the integer representation.
/// Non-finite input has no JSON form and maps to `null`.
pub fn number_value(number: f64) -> Value {
    if number.fract() == 0.0 && number.abs() <= MAX_SAFE_INTEGER {
        Value::from(number as i64)
    } else {
        Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Formats a finite number the way the dashboard's script runtime prints it:
/// plain decimal in `[1e-6, 1e21)`, exponent form with an explicit sign
/// outside that range.
pub fn js_number_string(number: f64) -> String {
    if number == 0.0 {
        return "0".to_string();
    }
    let magnitude = number.abs();
    if (1e-6..1e21).contains(&magnitude) {
        return format!("{}", number);
    }
    let formatted = format!("{:e}", number);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) if !exponent.starts_with('-') => {
            format!("{}e+{}", mantissa, exponent)
        }
        _ => formatted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_convert_numeric_strings() {
        assert_eq!(convert_value(&json!("42")), json!(42));
        assert_eq!(convert_value(&json!("-7")), json!(-7));
        assert_eq!(convert_value(&json!("21.5")), json!(21.5));
        assert_eq!(convert_value(&json!("0.1")), json!(0.1));
    }

    #[test]
    fn test_convert_keeps_non_canonical_strings() {
        for text in ["42.0", "007", "1e3", " 42", "foo", "", "Infinity", "NaN", "0x10"] {
            assert_eq!(convert_value(&json!(text)), json!(text), "input {:?}", text);
        }
    }

    #[test]
    fn test_convert_is_idempotent() {
        for value in [json!("42"), json!("42.0"), json!("foo"), json!(3.25), json!(true), json!(null)] {
            let once = convert_value(&value);
            assert_eq!(convert_value(&once), once);
        }
    }

    #[test]
    fn test_js_number_string() {
        assert_eq!(js_number_string(42.0), "42");
        assert_eq!(js_number_string(-0.0), "0");
        assert_eq!(js_number_string(0.000001), "0.000001");
        assert_eq!(js_number_string(0.0000001), "1e-7");
        assert_eq!(js_number_string(1e21), "1e+21");
        assert_eq!(js_number_string(123456789.5), "123456789.5");
    }

    #[test]
    fn test_as_number() {
        assert_eq!(as_number(&json!("40")), Some(40.0));
        assert_eq!(as_number(&json!(2.5)), Some(2.5));
        assert_eq!(as_number(&json!("n/a")), None);
        assert_eq!(as_number(&json!({"a": 1})), None);
    }
}
