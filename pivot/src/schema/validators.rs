//! Validator combinators for field validator chains.
//!
//! Validators are predicates over a candidate value; a failure carries a
//! message that `Field::validate` re-attaches to the field name.

use email_address::EmailAddress;
use regex::Regex;
use url::Url;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::value::Value;

fn reject(message: impl Into<String>) -> Error {
    Error::validation("", message)
}

/// Reject null and zero values.
pub fn not_empty(value: &Value) -> Result<()> {
    if value.is_zero() {
        Err(reject("value must not be empty"))
    } else {
        Ok(())
    }
}

/// Accept only values whose string rendering is one of the given set.
pub fn is_one_of(allowed: &[&str]) -> impl Fn(&Value) -> Result<()> + Send + Sync + 'static {
    let allowed: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
    move |value: &Value| {
        let candidate = value.to_display_string();
        if allowed.iter().any(|a| a == &candidate) {
            Ok(())
        } else {
            Err(reject(format!("value must be one of {:?}", allowed)))
        }
    }
}

/// Accept string values matching the given pattern. An invalid pattern
/// rejects everything with the compile error in the message.
pub fn match_regex(pattern: &str) -> impl Fn(&Value) -> Result<()> + Send + Sync + 'static {
    let compiled = Regex::new(pattern).map_err(|err| err.to_string());
    let pattern = pattern.to_string();
    move |value: &Value| match &compiled {
        Ok(regex) => {
            let candidate = value.to_display_string();
            if regex.is_match(&candidate) {
                Ok(())
            } else {
                Err(reject(format!("value does not match pattern {pattern}")))
            }
        }
        Err(err) => Err(reject(format!("invalid pattern {pattern}: {err}"))),
    }
}

/// Accept syntactically valid email addresses.
pub fn is_email(value: &Value) -> Result<()> {
    match value.as_str() {
        Some(s) if EmailAddress::is_valid(s) => Ok(()),
        _ => Err(reject("value must be a valid email address")),
    }
}

/// Accept strings that parse as a URL with a scheme.
pub fn is_url(value: &Value) -> Result<()> {
    match value.as_str() {
        Some(s) if Url::parse(s).is_ok() => Ok(()),
        _ => Err(reject("value must be a valid URL")),
    }
}

/// Accept strings that parse as a UUID.
pub fn is_uuid(value: &Value) -> Result<()> {
    match value.as_str() {
        Some(s) if Uuid::parse_str(s).is_ok() => Ok(()),
        _ => Err(reject("value must be a valid UUID")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_empty_rejects_zero_values() {
        assert!(not_empty(&Value::from("x")).is_ok());
        assert!(not_empty(&Value::from("")).is_err());
        assert!(not_empty(&Value::Null).is_err());
        assert!(not_empty(&Value::Int(0)).is_err());
    }

    #[test]
    fn one_of_compares_renderings() {
        let v = is_one_of(&["a", "b", "3"]);
        assert!(v(&Value::from("a")).is_ok());
        assert!(v(&Value::Int(3)).is_ok());
        assert!(v(&Value::from("c")).is_err());
    }

    #[test]
    fn regex_matching() {
        let v = match_regex(r"^[a-z]+\d$");
        assert!(v(&Value::from("abc1")).is_ok());
        assert!(v(&Value::from("ABC1")).is_err());

        let broken = match_regex(r"(unclosed");
        assert!(broken(&Value::from("anything")).is_err());
    }

    #[test]
    fn format_validators() {
        assert!(is_email(&Value::from("test@example.com")).is_ok());
        assert!(is_email(&Value::from("nope")).is_err());
        assert!(is_url(&Value::from("https://example.com")).is_ok());
        assert!(is_url(&Value::from("not a url")).is_err());
        assert!(is_uuid(&Value::from("550e8400-e29b-41d4-a716-446655440000")).is_ok());
        assert!(is_uuid(&Value::from("xyz")).is_err());
    }
}
