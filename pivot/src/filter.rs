//! The backend-neutral filter algebra.
//!
//! A filter is a conjunction of criteria; each criterion is a disjunction
//! over its values. Filters parse from a URL-path form
//! (`field1/value1/field2/op:value2`) and from plain maps, and re-render to
//! the path form as their canonical string representation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::schema::collection::Collection;
use crate::value::{Kind, Value, autotype};

/// Token that parses to (and renders from) the match-all filter.
const MATCH_ALL_TOKEN: &str = "all";

/// Path segments reserved for filter modifiers rather than field criteria.
const RESERVED_TOKENS: &[&str] = &["sort", "limit", "offset", "fields"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[default]
    Is,
    Not,
    Like,
    Unlike,
    Prefix,
    Suffix,
    Contains,
    Gt,
    Lt,
    Gte,
    Lte,
    Range,
    Null,
    NotNull,
}

impl Operator {
    pub const fn as_str(self) -> &'static str {
        match self {
            Operator::Is => "is",
            Operator::Not => "not",
            Operator::Like => "like",
            Operator::Unlike => "unlike",
            Operator::Prefix => "prefix",
            Operator::Suffix => "suffix",
            Operator::Contains => "contains",
            Operator::Gt => "gt",
            Operator::Lt => "lt",
            Operator::Gte => "gte",
            Operator::Lte => "lte",
            Operator::Range => "range",
            Operator::Null => "null",
            Operator::NotNull => "not_null",
        }
    }

    pub fn parse(token: &str) -> Option<Operator> {
        match token {
            "" | "is" | "eq" | "=" => Some(Operator::Is),
            "not" | "ne" => Some(Operator::Not),
            "like" => Some(Operator::Like),
            "unlike" => Some(Operator::Unlike),
            "prefix" => Some(Operator::Prefix),
            "suffix" => Some(Operator::Suffix),
            "contains" => Some(Operator::Contains),
            "gt" => Some(Operator::Gt),
            "lt" => Some(Operator::Lt),
            "gte" => Some(Operator::Gte),
            "lte" => Some(Operator::Lte),
            "range" => Some(Operator::Range),
            "null" => Some(Operator::Null),
            "not_null" | "notnull" => Some(Operator::NotNull),
            _ => None,
        }
    }

    /// Operators whose meaning is a negation; generators route these into
    /// their engine's negative context (`must_not`, `$ne`, `NOT LIKE`).
    pub const fn is_negated(self) -> bool {
        matches!(self, Operator::Not | Operator::Unlike)
    }

    /// Operators that take no values.
    pub const fn is_nullary(self) -> bool {
        matches!(self, Operator::Null | Operator::NotNull)
    }
}

/// One field condition: a disjunction over `values` under `operator`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Criterion {
    pub field: String,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub values: Vec<Value>,
    /// Optional kind hint steering numeric vs date range interpretation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Kind>,
}

impl Criterion {
    pub fn new(field: impl Into<String>, operator: Operator, values: Vec<Value>) -> Criterion {
        let mut criterion = Criterion {
            field: field.into(),
            operator,
            values,
            kind: None,
        };
        criterion.kind = criterion.infer_kind();
        criterion
    }

    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Criterion {
        Criterion::new(field, Operator::Is, vec![value.into()])
    }

    pub fn any_of<I, V>(field: impl Into<String>, values: I) -> Criterion
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Criterion::new(field, Operator::Is, values.into_iter().map(Into::into).collect())
    }

    pub fn with_kind(mut self, kind: Kind) -> Criterion {
        self.kind = Some(kind);
        self
    }

    fn infer_kind(&self) -> Option<Kind> {
        let mut inferred: Option<Kind> = None;
        for value in &self.values {
            let kind = value.kind()?;
            inferred = Some(match (inferred, kind) {
                (None, k) => k,
                (Some(a), b) if a == b => a,
                (Some(Kind::Int), Kind::Float) | (Some(Kind::Float), Kind::Int) => Kind::Float,
                _ => return None,
            });
        }
        inferred
    }

    fn render(&self) -> String {
        let values = self
            .values
            .iter()
            .map(Value::to_display_string)
            .collect::<Vec<_>>()
            .join(",");
        match self.operator {
            Operator::Is => values,
            op if op.is_nullary() => format!("{}:", op.as_str()),
            op => format!("{}:{}", op.as_str(), values),
        }
    }
}

/// Aggregation functions understood by aggregator backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Count,
    First,
    Last,
    Min,
    Max,
    Avg,
}

impl Aggregation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Count => "count",
            Aggregation::First => "first",
            Aggregation::Last => "last",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Avg => "avg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub aggregation: Aggregation,
    pub field: String,
}

impl Aggregate {
    pub fn new(aggregation: Aggregation, field: impl Into<String>) -> Aggregate {
        Aggregate {
            aggregation,
            field: field.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Filter {
    /// Shortcut: matches every record. Criteria are ignored when set.
    #[serde(default)]
    pub match_all: bool,
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    /// Sort field names; a `-` prefix means descending.
    #[serde(default)]
    pub sort: Vec<String>,
    /// Projection; empty means all fields.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    /// Free-form generator hints (`Distinct`, `ForceIndexRecord`, ...).
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
    /// Overrides the collection's identity field during evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_field: Option<String>,
}

impl Filter {
    pub fn new() -> Filter {
        Filter::default()
    }

    /// The filter matching every record.
    pub fn all() -> Filter {
        Filter {
            match_all: true,
            ..Filter::default()
        }
    }

    pub fn add(mut self, criterion: Criterion) -> Filter {
        self.criteria.push(criterion);
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Filter {
        self.add(Criterion::equals(field, value))
    }

    pub fn with_sort<S: Into<String>>(mut self, sort: impl IntoIterator<Item = S>) -> Filter {
        self.sort = sort.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Filter {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Filter {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Filter {
        self.offset = offset;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Filter {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    pub fn bool_option(&self, key: &str) -> bool {
        self.options
            .get(key)
            .map(|v| matches!(v, Value::Bool(true)) || v.to_display_string() == "true")
            .unwrap_or(false)
    }

    /// Implicit-equality map form: `{field: scalar | [scalars]}`.
    pub fn from_map<I, S>(entries: I) -> Filter
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let mut filter = Filter::new();
        for (field, value) in entries {
            let values = match value {
                Value::Array(items) => items,
                scalar => vec![scalar],
            };
            filter.criteria.push(Criterion::new(field, Operator::Is, values));
        }
        filter
    }

    /// Parse the URL-path form. Tokens alternate field/value; per-value
    /// operator prefixes (`gt:`, `not:`, ...) select operators; commas
    /// separate OR values (a comma part with its own operator prefix starts
    /// a new criterion on the same field); `sort`, `limit`, `offset`, and
    /// `fields` are modifier tokens; the single token `all` matches
    /// everything.
    pub fn parse(path: &str) -> Result<Filter> {
        let mut filter = Filter::new();
        let tokens: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|t| !t.is_empty())
            .collect();

        if tokens.is_empty() || (tokens.len() == 1 && tokens[0] == MATCH_ALL_TOKEN) {
            filter.match_all = true;
            return Ok(filter);
        }

        let mut i = 0;
        while i < tokens.len() {
            let token = tokens[i];
            if token == MATCH_ALL_TOKEN {
                filter.match_all = true;
                i += 1;
                continue;
            }
            let value_token = tokens.get(i + 1).copied().ok_or_else(|| {
                Error::internal(format!("filter path has a dangling token: {token:?}"))
            })?;
            match token {
                "sort" => {
                    filter.sort = value_token.split(',').map(str::to_string).collect();
                }
                "limit" => {
                    filter.limit = value_token.parse::<usize>().ok();
                }
                "offset" => {
                    filter.offset = value_token.parse::<usize>().unwrap_or(0);
                }
                "fields" => {
                    filter.fields = value_token.split(',').map(str::to_string).collect();
                }
                field => {
                    filter
                        .criteria
                        .extend(parse_value_token(field, value_token)?);
                }
            }
            i += 2;
        }
        Ok(filter)
    }

    /// Re-render to the canonical URL-path form. Parsing the output yields
    /// an equal filter.
    pub fn to_path(&self) -> String {
        let mut segments: Vec<String> = Vec::new();

        if self.criteria.is_empty() {
            if self.match_all || self.sort.is_empty() {
                segments.push(MATCH_ALL_TOKEN.to_string());
            }
        } else {
            // Consecutive criteria on one field share a single value token.
            let mut i = 0;
            while i < self.criteria.len() {
                let field = &self.criteria[i].field;
                let mut parts = Vec::new();
                while i < self.criteria.len() && &self.criteria[i].field == field {
                    parts.push(self.criteria[i].render());
                    i += 1;
                }
                segments.push(field.clone());
                segments.push(parts.join(","));
            }
        }

        if !self.sort.is_empty() {
            segments.push("sort".to_string());
            segments.push(self.sort.join(","));
        }
        if !self.fields.is_empty() {
            segments.push("fields".to_string());
            segments.push(self.fields.join(","));
        }
        if let Some(limit) = self.limit {
            segments.push("limit".to_string());
            segments.push(limit.to_string());
        }
        if self.offset > 0 {
            segments.push("offset".to_string());
            segments.push(self.offset.to_string());
        }
        segments.join("/")
    }

    /// The distinct field names the criteria mention, in order.
    pub fn criteria_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = Vec::new();
        for criterion in &self.criteria {
            if !fields.contains(&criterion.field.as_str()) {
                fields.push(&criterion.field);
            }
        }
        fields
    }

    /// True when the projection asks for the identity field only.
    pub fn id_only(&self) -> bool {
        self.fields.len() == 1
            && {
                let f = self.fields[0].as_str();
                f == "id" || f == "_id" || Some(f) == self.identity_field.as_deref()
            }
    }

    /// Re-map `id`/`_id` (and any identity-field override) criteria onto the
    /// collection's actual identity field, coercing values to its kind.
    pub fn apply_identity(&mut self, collection: &Collection) {
        let identity = self
            .identity_field
            .clone()
            .unwrap_or_else(|| collection.identity_field.clone());
        for criterion in &mut self.criteria {
            let is_alias = criterion.field == "id"
                || criterion.field == "_id"
                || criterion.field == identity;
            if is_alias {
                criterion.field = collection.identity_field.clone();
                criterion.kind = Some(collection.identity_field_type);
                for value in &mut criterion.values {
                    if let Ok(coerced) = value.coerce(collection.identity_field_type) {
                        *value = coerced;
                    }
                }
            }
        }
    }

    /// Sort directives parsed into `(field, descending)` pairs.
    pub fn sort_directives(&self) -> Vec<(&str, bool)> {
        self.sort
            .iter()
            .map(|s| match s.strip_prefix('-') {
                Some(field) => (field, true),
                None => (s.as_str(), false),
            })
            .collect()
    }

    /// True when the filter constrains nothing: match-all or no criteria.
    pub fn is_unconstrained(&self) -> bool {
        self.match_all || self.criteria.is_empty()
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_path())
    }
}

impl std::str::FromStr for Filter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Filter> {
        Filter::parse(s)
    }
}

/// Split a comma-separated value token into criteria. Parts carrying their
/// own operator prefix start a new criterion; bare parts continue the
/// previous operator (so `a,b` is one OR pair and `gte:18,lte:30` is two
/// AND'd bounds).
fn parse_value_token(field: &str, token: &str) -> Result<Vec<Criterion>> {
    if RESERVED_TOKENS.contains(&field) {
        return Err(Error::internal(format!("reserved filter token: {field}")));
    }

    let mut criteria: Vec<Criterion> = Vec::new();
    let mut current_op: Operator = Operator::Is;
    let mut started = false;

    for part in token.split(',') {
        let (op, rest) = match part.split_once(':') {
            Some((prefix, rest)) => match Operator::parse(prefix) {
                Some(op) => (Some(op), rest),
                None => (None, part),
            },
            None => (None, part),
        };

        let explicit = op.is_some();
        let op = op.unwrap_or(current_op);
        let value = if op.is_nullary() {
            None
        } else {
            Some(autotype(rest))
        };

        if explicit || !started {
            criteria.push(Criterion::new(field, op, value.into_iter().collect()));
            current_op = op;
            started = true;
        } else if let Some(value) = value
            && let Some(last) = criteria.last_mut()
        {
            last.values.push(value);
            last.kind = last.infer_kind();
        }
    }

    if criteria.is_empty() {
        criteria.push(Criterion::new(field, Operator::Is, Vec::new()));
    }
    Ok(criteria)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::field::Field;

    #[test]
    fn parses_match_all() {
        let filter = Filter::parse("all").unwrap();
        assert!(filter.match_all);
        assert!(filter.criteria.is_empty());
        assert_eq!(filter.to_path(), "all");
    }

    #[test]
    fn parses_simple_equality() {
        let filter = Filter::parse("name/bob").unwrap();
        assert_eq!(filter.criteria.len(), 1);
        assert_eq!(filter.criteria[0].field, "name");
        assert_eq!(filter.criteria[0].operator, Operator::Is);
        assert_eq!(filter.criteria[0].values, vec![Value::from("bob")]);
    }

    #[test]
    fn comma_values_are_or_within_field() {
        let filter = Filter::parse("color/red,green").unwrap();
        assert_eq!(filter.criteria.len(), 1);
        assert_eq!(
            filter.criteria[0].values,
            vec![Value::from("red"), Value::from("green")]
        );
    }

    #[test]
    fn operator_prefixes_split_criteria() {
        let filter = Filter::parse("age/gte:18,lte:30").unwrap();
        assert_eq!(filter.criteria.len(), 2);
        assert_eq!(filter.criteria[0].operator, Operator::Gte);
        assert_eq!(filter.criteria[0].values, vec![Value::Int(18)]);
        assert_eq!(filter.criteria[1].operator, Operator::Lte);
        assert_eq!(filter.criteria[1].values, vec![Value::Int(30)]);
        assert_eq!(filter.criteria[0].kind, Some(Kind::Int));
    }

    #[test]
    fn negated_or_values_share_operator() {
        let filter = Filter::parse("state/not:failed,errored").unwrap();
        assert_eq!(filter.criteria.len(), 1);
        assert_eq!(filter.criteria[0].operator, Operator::Not);
        assert_eq!(filter.criteria[0].values.len(), 2);
    }

    #[test]
    fn nullary_operators() {
        let filter = Filter::parse("deleted_at/null:").unwrap();
        assert_eq!(filter.criteria[0].operator, Operator::Null);
        assert!(filter.criteria[0].values.is_empty());
        assert_eq!(filter.to_path(), "deleted_at/null:");
    }

    #[test]
    fn round_trip_canonical_form() {
        // The literal S3 scenario.
        let path = "name/contains:foo/age/gte:18,lte:30/sort/-created";
        let filter = Filter::parse(path).unwrap();
        assert_eq!(filter.criteria.len(), 3);
        assert_eq!(filter.criteria[0].operator, Operator::Contains);
        assert_eq!(filter.criteria[0].values, vec![Value::from("foo")]);
        assert_eq!(filter.sort, vec!["-created".to_string()]);
        assert_eq!(filter.to_path(), path);

        for path in [
            "all",
            "name/bob",
            "color/red,green",
            "age/gt:21/sort/name,-age/limit/10",
            "title/prefix:dr/fields/id,title",
        ] {
            let filter = Filter::parse(path).unwrap();
            assert_eq!(filter.to_path(), path, "path {path} should round-trip");
            let reparsed = Filter::parse(&filter.to_path()).unwrap();
            assert_eq!(reparsed, filter);
        }
    }

    #[test]
    fn map_form_is_implicit_equality() {
        let filter = Filter::from_map([
            ("name".to_string(), Value::from("bob")),
            ("age".to_string(), Value::Array(vec![Value::Int(1), Value::Int(2)])),
        ]);
        assert_eq!(filter.criteria.len(), 2);
        assert_eq!(filter.criteria[1].values.len(), 2);
    }

    #[test]
    fn sort_directives_parse_descending() {
        let filter = Filter::new().with_sort(["-created", "name"]);
        assert_eq!(filter.sort_directives(), vec![("created", true), ("name", false)]);
    }

    #[test]
    fn identity_remapping() {
        let coll = Collection::new("users")
            .with_field(Field::identity("user_id", Kind::Int));
        let mut filter = Filter::parse("id/42").unwrap();
        filter.apply_identity(&coll);
        assert_eq!(filter.criteria[0].field, "user_id");
        assert_eq!(filter.criteria[0].values, vec![Value::Int(42)]);
    }

    #[test]
    fn id_only_projection() {
        assert!(Filter::new().with_fields(["id"]).id_only());
        assert!(!Filter::new().with_fields(["id", "name"]).id_only());
        assert!(!Filter::new().id_only());
    }

    #[test]
    fn criteria_fields_dedupes_in_order() {
        let filter = Filter::parse("a/1/b/2/a/3").unwrap();
        assert_eq!(filter.criteria_fields(), vec!["a", "b"]);
    }

    #[test]
    fn dangling_token_is_an_error() {
        assert!(Filter::parse("name").is_err());
        assert!(Filter::parse("name/bob/age").is_err());
    }
}
