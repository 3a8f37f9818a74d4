//! Property types and raw-to-typed coercion.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The declared type of a configuration property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    /// `true` / `false`
    Boolean,
    /// Free-form text
    String,
    /// Floating point number
    Number,
}

/// A raw value coerced to its declared type.
///
/// Numbers that fail to parse become `NaN` rather than an error, so comparing
/// two `Number` values with `==` follows IEEE semantics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TypedValue {
    /// A boolean property value.
    Boolean(bool),
    /// A numeric property value.
    Number(f64),
    /// A string property value.
    String(String),
}

impl TypedValue {
    /// Coerce a raw string according to the declared property type.
    ///
    /// - boolean: `raw == "true"`
    /// - number: lenient float parse of the leading numeric prefix, `NaN` on failure
    /// - string: identity
    ///
    /// # Examples
    ///
    /// ```rust
    /// use confsync::core::{PropertyType, TypedValue};
    ///
    /// assert_eq!(TypedValue::coerce("4000", PropertyType::Number), TypedValue::Number(4000.0));
    /// assert_eq!(TypedValue::coerce("yes", PropertyType::Boolean), TypedValue::Boolean(false));
    /// assert!(TypedValue::coerce("n/a", PropertyType::Number).as_f64().unwrap().is_nan());
    /// ```
    pub fn coerce(raw: &str, property_type: PropertyType) -> Self {
        match property_type {
            PropertyType::Boolean => TypedValue::Boolean(raw == "true"),
            PropertyType::Number => TypedValue::Number(parse_lenient_f64(raw)),
            PropertyType::String => TypedValue::String(raw.to_string()),
        }
    }

    /// The value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TypedValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// The value as a number, if it is one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TypedValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The value as a string slice, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The type this value was coerced to.
    pub fn property_type(&self) -> PropertyType {
        match self {
            TypedValue::Boolean(_) => PropertyType::Boolean,
            TypedValue::Number(_) => PropertyType::Number,
            TypedValue::String(_) => PropertyType::String,
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Boolean(b) => write!(f, "{}", b),
            TypedValue::Number(n) => write!(f, "{}", n),
            TypedValue::String(s) => f.write_str(s),
        }
    }
}

/// Parse the longest leading decimal literal, ignoring whatever follows it.
///
/// Accepts an optional sign, digits with an optional fraction, an optional
/// exponent and the literal `Infinity`. Leading whitespace is skipped.
fn parse_lenient_f64(raw: &str) -> f64 {
    let s = raw.trim_start();
    let bytes = s.as_bytes();

    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }

    if s[end..].starts_with("Infinity") {
        return if bytes.first() == Some(&b'-') {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }

    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut mantissa_digits = end - int_start;

    if bytes.get(end) == Some(&b'.') {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        mantissa_digits += frac_end - frac_start;
        end = frac_end;
    }

    if mantissa_digits == 0 {
        return f64::NAN;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }

    s[..end].parse().unwrap_or(f64::NAN)
}
