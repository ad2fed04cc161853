//! In-memory predicate compilation.
//!
//! Engines with no query dialect of their own (memory, filesystem, file,
//! meta-index) evaluate filters directly: a filter compiles into a callable
//! predicate over records plus a sort comparator and a result window.

use std::cmp::Ordering;

use regex::Regex;

use crate::errors::{Error, Result};
use crate::filter::{Criterion, Filter, Operator};
use crate::schema::record::Record;
use crate::value::Value;

pub type Predicate = Box<dyn Fn(&Record) -> bool + Send + Sync>;

/// A filter lowered into directly-executable parts.
pub struct CompiledFilter {
    predicate: Predicate,
    sort: Vec<(String, bool)>,
    fields: Vec<String>,
    limit: Option<usize>,
    offset: usize,
}

impl CompiledFilter {
    pub fn matches(&self, record: &Record) -> bool {
        (self.predicate)(record)
    }

    /// Order records per the filter's sort directives.
    pub fn sort(&self, records: &mut [Record]) {
        if self.sort.is_empty() {
            return;
        }
        records.sort_by(|a, b| {
            for (field, descending) in &self.sort {
                let left = lookup(a, field);
                let right = lookup(b, field);
                let ordering = left.compare(&right).unwrap_or(Ordering::Equal);
                let ordering = if *descending { ordering.reverse() } else { ordering };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    /// Apply limit/offset and the field projection to a sorted result list.
    pub fn window(&self, records: Vec<Record>) -> Vec<Record> {
        let iter = records.into_iter().skip(self.offset);
        let selected: Vec<Record> = match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        };
        if self.fields.is_empty() {
            selected
        } else {
            selected
                .into_iter()
                .map(|r| r.only_fields(&self.fields))
                .collect()
        }
    }

    /// Filter, sort, and window a snapshot in one pass.
    pub fn apply(&self, records: Vec<Record>) -> Vec<Record> {
        let mut matched: Vec<Record> = records.into_iter().filter(|r| self.matches(r)).collect();
        self.sort(&mut matched);
        self.window(matched)
    }

    /// How many records of a snapshot match, ignoring the window.
    pub fn count(&self, records: &[Record]) -> u64 {
        records.iter().filter(|r| self.matches(r)).count() as u64
    }
}

/// Field lookup that treats identity aliases as reaching the record id.
fn lookup(record: &Record, field: &str) -> Value {
    match record.get(field) {
        Some(value) => value.clone(),
        None if field == "id" || field == "_id" => record
            .id
            .first()
            .cloned()
            .unwrap_or(Value::Null),
        None => Value::Null,
    }
}

/// Compile a filter into a predicate. Criterion kind hints coerce the
/// record-side value before comparison, so `age/gte:18` compares
/// numerically even when the stored value is a string.
pub fn compile(filter: &Filter) -> Result<CompiledFilter> {
    let mut tests: Vec<Predicate> = Vec::new();
    if !filter.match_all {
        for criterion in &filter.criteria {
            tests.push(compile_criterion(criterion)?);
        }
    }
    let predicate: Predicate = Box::new(move |record| tests.iter().all(|t| t(record)));
    Ok(CompiledFilter {
        predicate,
        sort: filter
            .sort_directives()
            .into_iter()
            .map(|(f, d)| (f.to_string(), d))
            .collect(),
        fields: filter.fields.clone(),
        limit: filter.limit,
        offset: filter.offset,
    })
}

fn compile_criterion(criterion: &Criterion) -> Result<Predicate> {
    let field = criterion.field.clone();
    let values = criterion.values.clone();
    let kind = criterion.kind;

    let coerced = move |record: &Record| -> Value {
        let value = lookup(record, &field);
        match kind {
            Some(kind) if !value.is_null() => value.coerce(kind).unwrap_or(value),
            _ => value,
        }
    };

    let test: Predicate = match criterion.operator {
        Operator::Is => Box::new(move |record| {
            let actual = coerced(record);
            values.iter().any(|v| actual.loosely_equals(v))
        }),
        Operator::Not => Box::new(move |record| {
            let actual = coerced(record);
            !values.iter().any(|v| actual.loosely_equals(v))
        }),
        Operator::Like => {
            // `like` is a case-insensitive substring match; exotic patterns
            // can be expressed as anchored regexes by the caller.
            let needles: Vec<String> = values.iter().map(|v| v.to_display_string().to_lowercase()).collect();
            Box::new(move |record| {
                let haystack = coerced(record).to_display_string().to_lowercase();
                needles.iter().any(|n| haystack.contains(n))
            })
        }
        Operator::Unlike => {
            let needles: Vec<String> = values.iter().map(|v| v.to_display_string().to_lowercase()).collect();
            Box::new(move |record| {
                let haystack = coerced(record).to_display_string().to_lowercase();
                !needles.iter().any(|n| haystack.contains(n))
            })
        }
        Operator::Contains => string_test(coerced, values, |h, n| h.contains(n)),
        Operator::Prefix => string_test(coerced, values, |h, n| h.starts_with(n)),
        Operator::Suffix => string_test(coerced, values, |h, n| h.ends_with(n)),
        Operator::Gt => ordering_test(coerced, values, |o| o == Ordering::Greater),
        Operator::Gte => ordering_test(coerced, values, |o| o != Ordering::Less),
        Operator::Lt => ordering_test(coerced, values, |o| o == Ordering::Less),
        Operator::Lte => ordering_test(coerced, values, |o| o != Ordering::Greater),
        Operator::Range => {
            if values.len() != 2 {
                return Err(Error::internal(format!(
                    "range criterion on {} requires exactly two values",
                    criterion.field
                )));
            }
            let low = values[0].clone();
            let high = values[1].clone();
            Box::new(move |record| {
                let actual = coerced(record);
                matches!(actual.compare(&low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(actual.compare(&high), Some(Ordering::Less | Ordering::Equal))
            })
        }
        Operator::Null => Box::new(move |record| coerced(record).is_null()),
        Operator::NotNull => Box::new(move |record| !coerced(record).is_null()),
    };
    Ok(test)
}

fn string_test<F>(coerced: impl Fn(&Record) -> Value + Send + Sync + 'static, values: Vec<Value>, test: F) -> Predicate
where
    F: Fn(&str, &str) -> bool + Send + Sync + 'static,
{
    let needles: Vec<String> = values.iter().map(Value::to_display_string).collect();
    Box::new(move |record| {
        let haystack = coerced(record).to_display_string();
        needles.iter().any(|n| test(&haystack, n))
    })
}

fn ordering_test<F>(
    coerced: impl Fn(&Record) -> Value + Send + Sync + 'static,
    values: Vec<Value>,
    accept: F,
) -> Predicate
where
    F: Fn(Ordering) -> bool + Send + Sync + 'static,
{
    Box::new(move |record| {
        let actual = coerced(record);
        values
            .iter()
            .any(|v| actual.compare(v).map(&accept).unwrap_or(false))
    })
}

/// Compile a `like`-style pattern into an anchored regex; kept for callers
/// needing glob-ish matching over exported values.
pub fn like_pattern(pattern: &str) -> Result<Regex> {
    let mut regex = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c if "\\^$.|+()[]{}".contains(c) => {
                regex.push('\\');
                regex.push(c);
            }
            c => regex.push(c),
        }
    }
    regex.push('$');
    Regex::new(&format!("(?i){regex}")).map_err(|err| Error::internal(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;

    fn records() -> Vec<Record> {
        vec![
            Record::new(1i64)
                .with_field("name", "alice")
                .with_field("age", 31)
                .with_field("city", "rome"),
            Record::new(2i64)
                .with_field("name", "bob")
                .with_field("age", 24)
                .with_field("city", "oslo"),
            Record::new(3i64)
                .with_field("name", "carol")
                .with_field("age", 45),
        ]
    }

    fn apply(path: &str) -> Vec<Record> {
        let filter = Filter::parse(path).unwrap();
        compile(&filter).unwrap().apply(records())
    }

    #[test]
    fn match_all_passes_everything() {
        assert_eq!(apply("all").len(), 3);
    }

    #[test]
    fn equality_and_or_values() {
        let hits = apply("name/alice,bob");
        assert_eq!(hits.len(), 2);

        let hits = apply("name/not:alice");
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn comparisons_and_ranges() {
        assert_eq!(apply("age/gt:30").len(), 2);
        assert_eq!(apply("age/gte:31").len(), 2);
        assert_eq!(apply("age/range:24,31").len(), 2);
        assert_eq!(apply("age/lt:25").len(), 1);
    }

    #[test]
    fn numeric_comparison_coerces_stored_strings() {
        let record = Record::new(9i64).with_field("age", "100");
        let filter = Filter::parse("age/gt:30").unwrap();
        let compiled = compile(&filter).unwrap();
        // String "100" compares numerically, not lexically.
        assert!(compiled.matches(&record));
    }

    #[test]
    fn string_operators() {
        assert_eq!(apply("name/prefix:al").len(), 1);
        assert_eq!(apply("name/suffix:ob").len(), 1);
        assert_eq!(apply("name/contains:aro").len(), 1);
        assert_eq!(apply("name/like:ALICE").len(), 1);
        assert_eq!(apply("name/unlike:alice").len(), 2);
    }

    #[test]
    fn null_checks() {
        assert_eq!(apply("city/null:").len(), 1);
        assert_eq!(apply("city/not_null:").len(), 2);
    }

    #[test]
    fn identity_alias_reaches_record_id() {
        let filter = Filter::parse("id/2").unwrap();
        let compiled = compile(&filter).unwrap();
        let hits: Vec<Record> = records().into_iter().filter(|r| compiled.matches(r)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get_value("name"), Value::from("bob"));
    }

    #[test]
    fn sorting_and_window() {
        let hits = apply("all/sort/-age");
        assert_eq!(hits[0].get_value("name"), Value::from("carol"));
        assert_eq!(hits[2].get_value("name"), Value::from("bob"));

        let filter = Filter::parse("all/sort/age/limit/1/offset/1").unwrap();
        let hits = compile(&filter).unwrap().apply(records());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get_value("name"), Value::from("alice"));
    }

    #[test]
    fn projection_window() {
        let filter = Filter::parse("all/fields/name").unwrap();
        let hits = compile(&filter).unwrap().apply(records());
        assert_eq!(hits[0].get("age"), None);
        assert!(hits[0].get("name").is_some());
    }

    #[test]
    fn like_pattern_globbing() {
        let regex = like_pattern("al*e").unwrap();
        assert!(regex.is_match("alice"));
        assert!(regex.is_match("ale"));
        assert!(!regex.is_match("bob"));
    }
}
