//! Dynamic values and type coercion.
//!
//! Field values cross the API edge untyped; inside the core they travel as
//! [`Value`], a tagged union convertible to and from `serde_json::Value`.
//! Coercion is always directed by a declared [`Kind`]: on read, stored values
//! are pulled toward the field's kind; on write, [`convert_to`] decides
//! whether a value fits.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::errors::{Error, Result};

/// The closed set of field types a collection can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    #[default]
    String,
    Bool,
    Int,
    Float,
    Time,
    Object,
    Array,
    Raw,
}

impl Kind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Kind::String => "string",
            Kind::Bool => "bool",
            Kind::Int => "int",
            Kind::Float => "float",
            Kind::Time => "time",
            Kind::Object => "object",
            Kind::Array => "array",
            Kind::Raw => "raw",
        }
    }

    pub fn parse(s: &str) -> Option<Kind> {
        match s.to_ascii_lowercase().as_str() {
            "string" | "str" => Some(Kind::String),
            "bool" | "boolean" => Some(Kind::Bool),
            "int" | "integer" => Some(Kind::Int),
            "float" | "number" => Some(Kind::Float),
            "time" | "date" | "datetime" => Some(Kind::Time),
            "object" | "map" => Some(Kind::Object),
            "array" | "list" => Some(Kind::Array),
            "raw" | "bytes" => Some(Kind::Raw),
            _ => None,
        }
    }

    pub const fn is_scalar(self) -> bool {
        !matches!(self, Kind::Object | Kind::Array | Kind::Raw)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dynamically-typed field value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    String(String),
    Bool(bool),
    Int(i64),
    Float(f64),
    Time(DateTime<Utc>),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

/// Time layouts accepted by [`autotype`] and time coercion, beyond RFC 3339.
const TIME_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
];

const DATE_LAYOUTS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d %b %Y"];

impl Value {
    /// The narrowest [`Kind`] describing this value, or `None` for null.
    pub fn kind(&self) -> Option<Kind> {
        match self {
            Value::Null => None,
            Value::String(_) => Some(Kind::String),
            Value::Bool(_) => Some(Kind::Bool),
            Value::Int(_) => Some(Kind::Int),
            Value::Float(_) => Some(Kind::Float),
            Value::Time(_) => Some(Kind::Time),
            Value::Bytes(_) => Some(Kind::Raw),
            Value::Array(_) => Some(Kind::Array),
            Value::Object(_) => Some(Kind::Object),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for null and for each kind's zero value. Drives `omit_empty` and
    /// the "required field with default" rule in `Collection::make_record`.
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Bool(b) => !*b,
            Value::Int(i) => *i == 0,
            Value::Float(f) => *f == 0.0,
            Value::Time(t) => t.timestamp() == 0 && t.timestamp_subsec_nanos() == 0,
            Value::Bytes(b) => b.is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Object(o) => o.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }

    /// Bridge into `serde_json::Value`. Times render as RFC 3339 strings and
    /// raw bytes as arrays of numbers; the declared field kind pulls them
    /// back on read.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Time(t) => JsonValue::String(t.to_rfc3339()),
            Value::Bytes(b) => JsonValue::Array(b.iter().map(|byte| JsonValue::from(*byte)).collect()),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn from_json(value: JsonValue) -> Value {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => Value::Array(items.into_iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Kind-directed conversion; see [`convert_to`].
    pub fn coerce(&self, kind: Kind) -> Result<Value> {
        convert_to(kind, self)
    }

    /// Cross-type ordering used by in-memory sorting and range evaluation.
    /// Numbers compare numerically across `Int`/`Float`; times compare as
    /// instants; everything else falls back to string comparison within the
    /// same kind. `None` means the pair is not comparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::String(s)) => parse_time(s).map(|b| a.cmp(&b)),
            (Value::String(s), Value::Time(b)) => parse_time(s).map(|a| a.cmp(b)),
            _ => {
                let a = self.as_float()?;
                let b = other
                    .as_float()
                    .or_else(|| other.as_str().and_then(|s| s.parse::<f64>().ok()))?;
                a.partial_cmp(&b)
            }
        }
    }

    /// Loose equality used by filter evaluation: values compare equal if
    /// either side coerces into the other's kind and matches.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        if self == other {
            return true;
        }
        matches!(self.compare(other), Some(Ordering::Equal))
            || self.to_display_string() == other.to_display_string()
    }

    /// A flat string rendering, used for key construction and path-form
    /// filter output.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{:.0}", f)
                } else {
                    f.to_string()
                }
            }
            Value::Time(t) => t.to_rfc3339(),
            other => other.to_json().to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        JsonValue::deserialize(deserializer).map(Value::from_json)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Time(t)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_rfc2822(s) {
        return Some(t.with_timezone(&Utc));
    }
    for layout in TIME_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, layout) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for layout in DATE_LAYOUTS {
        if let Ok(date) = NaiveDate::parse_from_str(s, layout) {
            return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
        }
    }
    None
}

/// Inspect a string and produce the narrowest fitting scalar: bool, integer,
/// float, a recognised time layout, or the original string.
pub fn autotype(s: &str) -> Value {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Value::String(s.to_string());
    }
    match trimmed {
        "true" | "True" | "TRUE" => return Value::Bool(true),
        "false" | "False" | "FALSE" => return Value::Bool(false),
        "null" | "nil" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return Value::Float(f);
        }
    }
    if let Some(t) = parse_time(trimmed) {
        return Value::Time(t);
    }
    Value::String(s.to_string())
}

/// Type-directed conversion with explicit success or failure. Conversions
/// never guess: a string only becomes an int if it parses as one, and
/// non-scalar kinds only accept structurally matching values.
pub fn convert_to(kind: Kind, value: &Value) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let fail = || {
        Error::internal(format!(
            "cannot convert {} value to {}",
            value.kind().map(|k| k.as_str()).unwrap_or("null"),
            kind
        ))
    };
    match kind {
        Kind::String => Ok(Value::String(value.to_display_string())),
        Kind::Bool => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Int(i) => Ok(Value::Bool(*i != 0)),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "off" | "" => Ok(Value::Bool(false)),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
        Kind::Int => match value {
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::Float(f) if f.fract() == 0.0 => Ok(Value::Int(*f as i64)),
            Value::Bool(b) => Ok(Value::Int(if *b { 1 } else { 0 })),
            Value::Time(t) => Ok(Value::Int(t.timestamp())),
            Value::String(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| fail()),
            _ => Err(fail()),
        },
        Kind::Float => match value {
            Value::Float(f) => Ok(Value::Float(*f)),
            Value::Int(i) => Ok(Value::Float(*i as f64)),
            Value::String(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| fail()),
            _ => Err(fail()),
        },
        Kind::Time => match value {
            Value::Time(t) => Ok(Value::Time(*t)),
            Value::Int(secs) => Utc
                .timestamp_opt(*secs, 0)
                .single()
                .map(Value::Time)
                .ok_or_else(fail),
            Value::String(s) => parse_time(s).map(Value::Time).ok_or_else(fail),
            _ => Err(fail()),
        },
        Kind::Object => match value {
            Value::Object(_) => Ok(value.clone()),
            Value::String(s) => serde_json::from_str::<JsonValue>(s)
                .ok()
                .filter(JsonValue::is_object)
                .map(Value::from_json)
                .ok_or_else(fail),
            _ => Err(fail()),
        },
        Kind::Array => match value {
            Value::Array(_) => Ok(value.clone()),
            other => Ok(Value::Array(vec![other.clone()])),
        },
        Kind::Raw => match value {
            Value::Bytes(_) => Ok(value.clone()),
            Value::String(s) => Ok(Value::Bytes(s.clone().into_bytes())),
            _ => Err(fail()),
        },
    }
}

/// Walk a column of sampled values and widen to the least-specific kind that
/// admits every observed value. Used by CSV/TSV schema inference, which caps
/// the sample before calling in.
pub fn detect_convert_type<'a, I>(samples: I) -> Kind
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut detected: Option<Kind> = None;
    for sample in samples {
        let kind = match sample {
            Value::String(s) => match autotype(s) {
                Value::Null => continue,
                typed => typed.kind().unwrap_or(Kind::String),
            },
            Value::Null => continue,
            other => other.kind().unwrap_or(Kind::String),
        };
        detected = Some(match (detected, kind) {
            (None, k) => k,
            (Some(a), b) if a == b => a,
            (Some(Kind::Int), Kind::Float) | (Some(Kind::Float), Kind::Int) => Kind::Float,
            _ => return Kind::String,
        });
    }
    detected.unwrap_or(Kind::String)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autotype_narrows_scalars() {
        assert_eq!(autotype("true"), Value::Bool(true));
        assert_eq!(autotype("42"), Value::Int(42));
        assert_eq!(autotype("4.5"), Value::Float(4.5));
        assert_eq!(autotype("hello"), Value::String("hello".to_string()));
        assert!(matches!(autotype("2021-03-01T12:00:00Z"), Value::Time(_)));
        assert!(matches!(autotype("2021-03-01"), Value::Time(_)));
    }

    #[test]
    fn convert_is_explicit_about_failure() {
        assert_eq!(convert_to(Kind::Int, &Value::from("17")).unwrap(), Value::Int(17));
        assert!(convert_to(Kind::Int, &Value::from("seventeen")).is_err());
        assert_eq!(
            convert_to(Kind::Bool, &Value::from("yes")).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            convert_to(Kind::String, &Value::Int(5)).unwrap(),
            Value::from("5")
        );
        // Int with a fractional float fails rather than truncating.
        assert!(convert_to(Kind::Int, &Value::Float(1.5)).is_err());
    }

    #[test]
    fn convert_time_from_epoch_and_string() {
        let t = convert_to(Kind::Time, &Value::Int(0)).unwrap();
        assert_eq!(t.as_time().unwrap().timestamp(), 0);
        let t = convert_to(Kind::Time, &Value::from("2024-06-01 08:30:00")).unwrap();
        assert_eq!(t.as_time().unwrap().to_rfc3339(), "2024-06-01T08:30:00+00:00");
    }

    #[test]
    fn detect_widens_numeric_columns() {
        let ints = [Value::from("1"), Value::from("2")];
        assert_eq!(detect_convert_type(ints.iter()), Kind::Int);

        let mixed = [Value::from("1"), Value::from("2.5")];
        assert_eq!(detect_convert_type(mixed.iter()), Kind::Float);

        let stringy = [Value::from("1"), Value::from("x")];
        assert_eq!(detect_convert_type(stringy.iter()), Kind::String);
    }

    #[test]
    fn compare_crosses_numeric_kinds() {
        assert_eq!(
            Value::Int(3).compare(&Value::Float(3.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(Value::Int(2).compare(&Value::from("10")), Some(Ordering::Less));
        assert_eq!(
            Value::from("b").compare(&Value::from("a")),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::from("a").compare(&Value::Int(1)), None);
    }

    #[test]
    fn json_round_trip_preserves_shape() {
        let mut obj = BTreeMap::new();
        obj.insert("n".to_string(), Value::Int(1));
        obj.insert("s".to_string(), Value::from("x"));
        let v = Value::Object(obj);
        assert_eq!(Value::from_json(v.to_json()), v);
    }

    #[test]
    fn zero_values() {
        assert!(Value::Null.is_zero());
        assert!(Value::Int(0).is_zero());
        assert!(Value::from("").is_zero());
        assert!(!Value::Int(1).is_zero());
        assert!(!Value::from("x").is_zero());
    }
}
