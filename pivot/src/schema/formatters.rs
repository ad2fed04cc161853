//! First-class formatter combinators for field formatter chains.
//!
//! Each combinator has the [`FormatterFn`](crate::schema::field::FormatterFn)
//! shape so it can be passed to `Field::with_formatter` directly.

use chrono::Utc;
use nanoid::nanoid;
use uuid::Uuid;

use crate::errors::Result;
use crate::schema::field::Operation;
use crate::value::Value;

/// Alphabet for encoded identifiers: alphanumerics minus ambiguous glyphs.
const ENCODED_ID_ALPHABET: &[char] = &[
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'J', 'K', 'L', 'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y',
    'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'j', 'm', 'n', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];
const ENCODED_ID_LENGTH: usize = 20;

/// Trim surrounding whitespace from string values; other kinds pass through.
pub fn trim_space(value: Value, _op: Operation) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other,
    })
}

/// Lowercase string values; other kinds pass through.
pub fn lowercase(value: Value, _op: Operation) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(s.to_lowercase()),
        other => other,
    })
}

/// Fill empty values with a fresh v4 UUID.
pub fn generate_uuid(value: Value, _op: Operation) -> Result<Value> {
    Ok(if value.is_zero() {
        Value::String(Uuid::new_v4().to_string())
    } else {
        value
    })
}

/// Fill empty values with a compact URL-safe identifier.
pub fn generate_encoded_uuid(value: Value, _op: Operation) -> Result<Value> {
    Ok(if value.is_zero() {
        Value::String(nanoid!(ENCODED_ID_LENGTH, ENCODED_ID_ALPHABET))
    } else {
        value
    })
}

/// Fill empty values with the current UTC time.
pub fn current_time(value: Value, _op: Operation) -> Result<Value> {
    Ok(if value.is_zero() {
        Value::Time(Utc::now())
    } else {
        value
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_and_lowercase() {
        let v = trim_space(Value::from("  Hi  "), Operation::Create).unwrap();
        assert_eq!(v, Value::from("Hi"));
        let v = lowercase(Value::from("HELLO"), Operation::Create).unwrap();
        assert_eq!(v, Value::from("hello"));
        // non-strings pass through untouched
        assert_eq!(trim_space(Value::Int(3), Operation::Create).unwrap(), Value::Int(3));
    }

    #[test]
    fn generators_only_fill_empty_values() {
        let existing = Value::from("keep");
        assert_eq!(
            generate_uuid(existing.clone(), Operation::Create).unwrap(),
            existing
        );

        let fresh = generate_uuid(Value::Null, Operation::Create).unwrap();
        assert!(uuid::Uuid::parse_str(fresh.as_str().unwrap()).is_ok());

        let encoded = generate_encoded_uuid(Value::Null, Operation::Create).unwrap();
        let s = encoded.as_str().unwrap();
        assert_eq!(s.len(), ENCODED_ID_LENGTH);
        assert!(s.chars().all(|c| ENCODED_ID_ALPHABET.contains(&c)));
    }

    #[test]
    fn current_time_fills_empty() {
        assert!(matches!(
            current_time(Value::Null, Operation::Create).unwrap(),
            Value::Time(_)
        ));
        let set = Value::from("already");
        assert_eq!(current_time(set.clone(), Operation::Create).unwrap(), set);
    }
}
