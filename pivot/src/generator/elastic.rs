//! Elasticsearch query generation.
//!
//! Emits the JSON search body: a `bool` query whose `must` members carry the
//! positive criteria and whose `must_not` members carry the negated ones,
//! plus `from`/`size`/`sort`/`_source`/`aggs` clauses.

use serde_json::{Value as JsonValue, json};

use crate::errors::{Error, Result};
use crate::filter::{Aggregate, Aggregation, Criterion, Operator};
use crate::generator::Generator;
use crate::value::Value;

#[derive(Default)]
pub struct ElasticGenerator {
    index: String,
    must: Vec<JsonValue>,
    must_not: Vec<JsonValue>,
    fields: Vec<String>,
    group_by: Vec<String>,
    aggregates: Vec<Aggregate>,
    sort: Vec<String>,
    limit: Option<usize>,
    offset: usize,
    values: Vec<Value>,
}

impl ElasticGenerator {
    pub fn new() -> ElasticGenerator {
        ElasticGenerator::default()
    }

    /// The assembled search body as JSON, before serialisation.
    pub fn body(&self) -> JsonValue {
        let query = if self.must.is_empty() && self.must_not.is_empty() {
            json!({ "match_all": {} })
        } else {
            let mut bool_query = serde_json::Map::new();
            if !self.must.is_empty() {
                bool_query.insert("must".to_string(), JsonValue::Array(self.must.clone()));
            }
            if !self.must_not.is_empty() {
                bool_query.insert("must_not".to_string(), JsonValue::Array(self.must_not.clone()));
            }
            json!({ "bool": JsonValue::Object(bool_query) })
        };

        let mut body = serde_json::Map::new();
        body.insert("query".to_string(), query);
        body.insert("from".to_string(), json!(self.offset));
        if let Some(limit) = self.limit {
            body.insert("size".to_string(), json!(limit));
        }
        if !self.fields.is_empty() {
            body.insert("_source".to_string(), json!(self.fields));
        }
        if !self.sort.is_empty() {
            let sort: Vec<JsonValue> = self
                .sort
                .iter()
                .map(|s| match s.strip_prefix('-') {
                    Some(field) => json!({ field: { "order": "desc" } }),
                    None => json!({ (s.as_str()): { "order": "asc" } }),
                })
                .collect();
            body.insert("sort".to_string(), JsonValue::Array(sort));
        }
        if !self.aggregates.is_empty() || !self.group_by.is_empty() {
            body.insert("size".to_string(), json!(0));
            body.insert("aggs".to_string(), self.aggs());
        }
        JsonValue::Object(body)
    }

    fn aggs(&self) -> JsonValue {
        let mut metrics = serde_json::Map::new();
        for aggregate in &self.aggregates {
            let function = match aggregate.aggregation {
                Aggregation::Sum => "sum",
                Aggregation::Count => "value_count",
                Aggregation::Min => "min",
                Aggregation::Max => "max",
                Aggregation::Avg => "avg",
                Aggregation::First | Aggregation::Last => "min",
            };
            metrics.insert(
                format!("{}_{}", aggregate.aggregation.as_str(), aggregate.field),
                json!({ function: { "field": aggregate.field } }),
            );
        }
        // Nested terms buckets, innermost carrying the metrics.
        let mut inner = if metrics.is_empty() {
            None
        } else {
            Some(JsonValue::Object(metrics))
        };
        for field in self.group_by.iter().rev() {
            let mut bucket = serde_json::Map::new();
            bucket.insert("terms".to_string(), json!({ "field": field }));
            if let Some(aggs) = inner.take() {
                bucket.insert("aggs".to_string(), aggs);
            }
            let mut named = serde_json::Map::new();
            named.insert(format!("group_{field}"), JsonValue::Object(bucket));
            inner = Some(JsonValue::Object(named));
        }
        inner.unwrap_or(JsonValue::Object(serde_json::Map::new()))
    }

    fn push_values(&mut self, values: &[Value]) {
        self.values.extend(values.iter().cloned());
    }

    fn term_clause(field: &str, values: &[Value]) -> JsonValue {
        if values.len() == 1 {
            json!({ "term": { field: values[0].to_json() } })
        } else {
            let items: Vec<JsonValue> = values.iter().map(Value::to_json).collect();
            json!({ "terms": { field: items } })
        }
    }

    fn wildcard_clause(field: &str, values: &[Value], pattern: fn(&str) -> String) -> JsonValue {
        let clauses: Vec<JsonValue> = values
            .iter()
            .map(|v| json!({ "wildcard": { field: pattern(&v.to_display_string()) } }))
            .collect();
        if clauses.len() == 1 {
            clauses.into_iter().next().unwrap_or(JsonValue::Null)
        } else {
            json!({ "bool": { "should": clauses } })
        }
    }

    fn range_clause(field: &str, bound: &str, values: &[Value]) -> JsonValue {
        json!({ "range": { field: { bound: values[0].to_json() } } })
    }
}

impl Generator for ElasticGenerator {
    fn initialize(&mut self, collection: &str) -> Result<()> {
        self.index = collection.to_string();
        self.must.clear();
        self.must_not.clear();
        self.values.clear();
        Ok(())
    }

    fn with_fields(&mut self, fields: &[String]) {
        self.fields = fields.to_vec();
    }

    fn with_group_by(&mut self, fields: &[String]) {
        self.group_by = fields.to_vec();
    }

    fn with_aggregates(&mut self, aggregates: &[Aggregate]) {
        self.aggregates = aggregates.to_vec();
    }

    fn with_sort(&mut self, sort: &[String]) {
        self.sort = sort.to_vec();
    }

    fn with_limit_offset(&mut self, limit: Option<usize>, offset: usize) {
        self.limit = limit;
        self.offset = offset;
    }

    fn push(&mut self, criterion: &Criterion) -> Result<()> {
        let field = criterion.field.as_str();
        let values = &criterion.values;
        if !criterion.operator.is_nullary() && values.is_empty() {
            return Err(Error::internal(format!(
                "criterion on {field} has no values to render"
            )));
        }
        match criterion.operator {
            Operator::Is => {
                self.must.push(Self::term_clause(field, values));
                self.push_values(values);
            }
            Operator::Not => {
                self.must_not.push(Self::term_clause(field, values));
                self.push_values(values);
            }
            Operator::Like | Operator::Contains => {
                self.must.push(Self::wildcard_clause(field, values, |v| format!("*{v}*")));
                self.push_values(values);
            }
            Operator::Unlike => {
                self.must_not
                    .push(Self::wildcard_clause(field, values, |v| format!("*{v}*")));
                self.push_values(values);
            }
            Operator::Prefix => {
                self.must.push(Self::wildcard_clause(field, values, |v| format!("{v}*")));
                self.push_values(values);
            }
            Operator::Suffix => {
                self.must.push(Self::wildcard_clause(field, values, |v| format!("*{v}")));
                self.push_values(values);
            }
            Operator::Gt => {
                self.must.push(Self::range_clause(field, "gt", values));
                self.push_values(values);
            }
            Operator::Gte => {
                self.must.push(Self::range_clause(field, "gte", values));
                self.push_values(values);
            }
            Operator::Lt => {
                self.must.push(Self::range_clause(field, "lt", values));
                self.push_values(values);
            }
            Operator::Lte => {
                self.must.push(Self::range_clause(field, "lte", values));
                self.push_values(values);
            }
            Operator::Range => {
                if values.len() != 2 {
                    return Err(Error::internal(format!(
                        "range criterion on {field} requires exactly two values"
                    )));
                }
                self.must.push(json!({
                    "range": { field: { "gte": values[0].to_json(), "lte": values[1].to_json() } }
                }));
                self.push_values(values);
            }
            Operator::Null => {
                self.must_not.push(json!({ "exists": { "field": field } }));
            }
            Operator::NotNull => {
                self.must.push(json!({ "exists": { "field": field } }));
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.body()).map_err(|err| Error::internal(err.to_string()))
    }

    fn values(&self) -> &[Value] {
        &self.values
    }
}
