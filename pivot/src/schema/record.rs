//! Records, identities, and result sets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::schema::collection::Collection;
use crate::schema::field::Operation;
use crate::value::Value;

/// A record identity: one scalar per composite-key member, canonicalised to
/// an ordered sequence. Single-key collections accept a bare scalar and a
/// one-element sequence interchangeably.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Id(Vec<Value>);

impl Id {
    pub fn single(value: impl Into<Value>) -> Id {
        Id(vec![value.into()])
    }

    pub fn composite<I, V>(values: I) -> Id
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Id(values.into_iter().map(Into::into).collect())
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty() || self.0.iter().all(Value::is_zero)
    }

    pub fn first(&self) -> Option<&Value> {
        self.0.first()
    }

    pub fn push(&mut self, value: impl Into<Value>) {
        self.0.push(value.into());
    }

    /// Canonical string form: member renderings joined by `sep`. This is the
    /// storage key for engines that address records by a flat string.
    pub fn to_key(&self, sep: &str) -> String {
        self.0
            .iter()
            .map(Value::to_display_string)
            .collect::<Vec<_>>()
            .join(sep)
    }

    /// Verify this identity's arity against the collection's key count,
    /// before any store is touched.
    pub fn check_arity(&self, collection: &Collection) -> Result<()> {
        let expected = collection.key_count();
        if self.0.len() == expected {
            Ok(())
        } else {
            Err(Error::BadArity {
                collection: collection.name.clone(),
                expected,
                actual: self.0.len(),
            })
        }
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_key(":"))
    }
}

impl From<Value> for Id {
    fn from(value: Value) -> Id {
        match value {
            Value::Array(items) => Id(items),
            scalar => Id(vec![scalar]),
        }
    }
}

impl From<Vec<Value>> for Id {
    fn from(values: Vec<Value>) -> Id {
        Id(values)
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Id {
        Id::single(value)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Id {
        Id::single(value)
    }
}

impl From<String> for Id {
    fn from(value: String) -> Id {
        Id::single(value)
    }
}

impl From<&[&str]> for Id {
    fn from(values: &[&str]) -> Id {
        Id::composite(values.iter().copied())
    }
}

/// A single keyed entity: an identity plus a field map with dotted-path
/// nested access. The `original` snapshot is taken at load time and drives
/// change detection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    pub id: Id,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    /// Back-reference to the owning collection; informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_name: Option<String>,
    #[serde(skip)]
    original: Option<BTreeMap<String, Value>>,
}

impl Record {
    pub fn new(id: impl Into<Id>) -> Record {
        Record {
            id: id.into(),
            ..Record::default()
        }
    }

    /// A record with no identity yet; the backend assigns one on insert.
    pub fn anonymous() -> Record {
        Record::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Record {
        self.set(&name.into(), value.into());
        self
    }

    /// Fetch a value; dotted paths reach into object values.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        let mut current = self.fields.get(head)?;
        for segment in segments {
            match current {
                Value::Object(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Like [`Record::get`] but yields `Value::Null` on a miss.
    pub fn get_value(&self, path: &str) -> Value {
        self.get(path).cloned().unwrap_or(Value::Null)
    }

    /// Set a value; dotted paths create intermediate objects as needed.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        let value = value.into();
        match path.split_once('.') {
            None => {
                self.fields.insert(path.to_string(), value);
            }
            Some((head, rest)) => {
                let entry = self
                    .fields
                    .entry(head.to_string())
                    .or_insert_with(|| Value::Object(BTreeMap::new()));
                if !matches!(entry, Value::Object(_)) {
                    *entry = Value::Object(BTreeMap::new());
                }
                if let Value::Object(map) = entry {
                    set_nested_value(map, rest, value);
                }
            }
        }
    }

    /// Explicit nested set; `set` already handles dotted paths, this is the
    /// spelled-out form for callers holding path segments.
    pub fn set_nested(&mut self, segments: &[&str], value: impl Into<Value>) {
        if segments.is_empty() {
            return;
        }
        self.set(&segments.join("."), value);
    }

    /// Append to an array-valued field, converting a scalar in place.
    pub fn append(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.fields.get_mut(name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let prior = std::mem::take(existing);
                *existing = Value::Array(vec![prior, value]);
            }
            None => {
                self.fields.insert(name.to_string(), Value::Array(vec![value]));
            }
        }
    }

    /// A copy carrying only the named fields (identity is preserved).
    pub fn only_fields<S: AsRef<str>>(&self, names: &[S]) -> Record {
        let mut out = Record::new(self.id.clone());
        out.collection_name = self.collection_name.clone();
        for name in names {
            if let Some(value) = self.get(name.as_ref()) {
                out.set(name.as_ref(), value.clone());
            }
        }
        out
    }

    /// Overlay all fields from `src` onto this record.
    pub fn copy_from(&mut self, src: &Record) {
        for (k, v) in &src.fields {
            self.fields.insert(k.clone(), v.clone());
        }
        if !src.id.is_empty() {
            self.id = src.id.clone();
        }
    }

    /// Post-read population: coerce every declared field toward its kind,
    /// run `Retrieve`-scoped formatters, and fill zero-valued required
    /// fields with their defaults. Runs exactly once per successful
    /// retrieve, after which the load-time snapshot is taken.
    pub fn populate(&mut self, collection: &Collection) -> Result<()> {
        for field in &collection.fields {
            let mut value = self.get_value(&field.name);
            if !value.is_null() {
                value = field.convert_value(&value)?;
            }
            value = field.format(value, Operation::Retrieve)?;
            value = collection.apply_export_formatter(field.kind, value)?;
            if value.is_zero()
                && field.required
                && let Some(default) = field.resolve_default()
            {
                value = default;
            }
            if value.is_null() && !self.fields.contains_key(&field.name) {
                continue;
            }
            self.fields.insert(field.name.clone(), value);
        }
        self.collection_name = Some(collection.name.clone());
        self.snapshot();
        Ok(())
    }

    /// Take the load-time snapshot used by [`Record::changed_fields`].
    pub fn snapshot(&mut self) {
        self.original = Some(self.fields.clone());
    }

    /// Fields whose values differ from the load-time snapshot. With no
    /// snapshot, every field counts as changed.
    pub fn changed_fields(&self) -> BTreeMap<String, Value> {
        match &self.original {
            None => self.fields.clone(),
            Some(original) => self
                .fields
                .iter()
                .filter(|(k, v)| original.get(*k) != Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

fn set_nested_value(map: &mut BTreeMap<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(BTreeMap::new()));
            if !matches!(entry, Value::Object(_)) {
                *entry = Value::Object(BTreeMap::new());
            }
            if let Value::Object(inner) = entry {
                set_nested_value(inner, rest, value);
            }
        }
    }
}

/// An ordered sequence of records plus pagination metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordSet {
    pub records: Vec<Record>,
    #[serde(default)]
    pub page: usize,
    #[serde(default)]
    pub total_pages: usize,
    #[serde(default)]
    pub records_per_page: usize,
    #[serde(default)]
    pub result_count: u64,
    /// False when `result_count` is a lower bound rather than a total.
    #[serde(default)]
    pub known_size: bool,
    /// Streaming result sets whose total is not cheaply knowable.
    #[serde(default)]
    pub unbounded: bool,
}

impl RecordSet {
    pub fn new() -> RecordSet {
        RecordSet::default()
    }

    pub fn from_records(records: Vec<Record>) -> RecordSet {
        let count = records.len() as u64;
        RecordSet {
            records,
            result_count: count,
            known_size: true,
            ..RecordSet::default()
        }
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
        self.result_count += 1;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first(&self) -> Option<&Record> {
        self.records.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }
}

impl IntoIterator for RecordSet {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl From<Record> for RecordSet {
    fn from(record: Record) -> RecordSet {
        RecordSet::from_records(vec![record])
    }
}

impl FromIterator<Record> for RecordSet {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> RecordSet {
        RecordSet::from_records(iter.into_iter().collect())
    }
}
