//! Mongo query generation.
//!
//! Emits a BSON-shaped JSON document: criteria combine under `$and`, values
//! under one criterion under `$in`/`$nin`, text operators become anchored
//! `$regex` patterns, and null checks map to `$exists` per the shared
//! operator translation table.

use serde_json::{Value as JsonValue, json};

use crate::errors::{Error, Result};
use crate::filter::{Aggregate, Aggregation, Criterion, Operator};
use crate::generator::Generator;
use crate::value::Value;

#[derive(Default)]
pub struct MongoGenerator {
    collection: String,
    clauses: Vec<JsonValue>,
    fields: Vec<String>,
    group_by: Vec<String>,
    aggregates: Vec<Aggregate>,
    sort: Vec<String>,
    limit: Option<usize>,
    offset: usize,
    values: Vec<Value>,
}

/// Escape regex metacharacters so text operators match literally.
fn regex_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if "\\^$.|?*+()[]{}".contains(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

impl MongoGenerator {
    pub fn new() -> MongoGenerator {
        MongoGenerator::default()
    }

    /// The assembled query document, before serialisation.
    pub fn document(&self) -> JsonValue {
        let query = match self.clauses.len() {
            0 => json!({}),
            1 => self.clauses[0].clone(),
            _ => json!({ "$and": self.clauses }),
        };
        let mut doc = serde_json::Map::new();
        doc.insert("collection".to_string(), json!(self.collection));
        doc.insert("query".to_string(), query);
        if !self.fields.is_empty() {
            let mut projection = serde_json::Map::new();
            for field in &self.fields {
                projection.insert(field.clone(), json!(1));
            }
            doc.insert("projection".to_string(), JsonValue::Object(projection));
        }
        if !self.sort.is_empty() {
            let mut sort = serde_json::Map::new();
            for directive in &self.sort {
                match directive.strip_prefix('-') {
                    Some(field) => sort.insert(field.to_string(), json!(-1)),
                    None => sort.insert(directive.clone(), json!(1)),
                };
            }
            doc.insert("sort".to_string(), JsonValue::Object(sort));
        }
        if let Some(limit) = self.limit {
            doc.insert("limit".to_string(), json!(limit));
        }
        if self.offset > 0 {
            doc.insert("skip".to_string(), json!(self.offset));
        }
        if !self.group_by.is_empty() || !self.aggregates.is_empty() {
            doc.insert("group".to_string(), self.group_document());
        }
        JsonValue::Object(doc)
    }

    fn group_document(&self) -> JsonValue {
        // Aggregation-pipeline `$group` stage: the compound _id carries the
        // grouping fields, the accumulators carry the metrics.
        let id = if self.group_by.is_empty() {
            JsonValue::Null
        } else {
            let mut id = serde_json::Map::new();
            for field in &self.group_by {
                id.insert(field.clone(), json!(format!("${field}")));
            }
            JsonValue::Object(id)
        };
        let mut stage = serde_json::Map::new();
        stage.insert("_id".to_string(), id);
        for aggregate in &self.aggregates {
            let accumulator = match aggregate.aggregation {
                Aggregation::Sum => "$sum",
                Aggregation::Count => "$sum",
                Aggregation::Min => "$min",
                Aggregation::Max => "$max",
                Aggregation::Avg => "$avg",
                Aggregation::First => "$first",
                Aggregation::Last => "$last",
            };
            let operand = if aggregate.aggregation == Aggregation::Count {
                json!(1)
            } else {
                json!(format!("${}", aggregate.field))
            };
            let mut body = serde_json::Map::new();
            body.insert(accumulator.to_string(), operand);
            stage.insert(
                format!("{}_{}", aggregate.aggregation.as_str(), aggregate.field),
                JsonValue::Object(body),
            );
        }
        json!({ "$group": JsonValue::Object(stage) })
    }

    fn clause(field: &str, body: JsonValue) -> JsonValue {
        let mut clause = serde_json::Map::new();
        clause.insert(field.to_string(), body);
        JsonValue::Object(clause)
    }

    fn regex_clause(field: &str, values: &[Value], pattern: fn(&str) -> String) -> JsonValue {
        let clauses: Vec<JsonValue> = values
            .iter()
            .map(|v| Self::clause(field, json!({ "$regex": pattern(&regex_escape(&v.to_display_string())) })))
            .collect();
        if clauses.len() == 1 {
            clauses.into_iter().next().unwrap_or(JsonValue::Null)
        } else {
            json!({ "$or": clauses })
        }
    }

    fn comparison_clause(field: &str, op: &str, values: &[Value]) -> JsonValue {
        let clauses: Vec<JsonValue> = values
            .iter()
            .map(|v| {
                let mut body = serde_json::Map::new();
                body.insert(op.to_string(), v.to_json());
                Self::clause(field, JsonValue::Object(body))
            })
            .collect();
        if clauses.len() == 1 {
            clauses.into_iter().next().unwrap_or(JsonValue::Null)
        } else {
            json!({ "$or": clauses })
        }
    }
}

impl Generator for MongoGenerator {
    fn initialize(&mut self, collection: &str) -> Result<()> {
        self.collection = collection.to_string();
        self.clauses.clear();
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
        let clause = match criterion.operator {
            Operator::Is => {
                if values.len() == 1 {
                    Self::clause(field, json!({ "$eq": values[0].to_json() }))
                } else {
                    let items: Vec<JsonValue> = values.iter().map(Value::to_json).collect();
                    Self::clause(field, json!({ "$in": items }))
                }
            }
            Operator::Not => {
                if values.len() == 1 {
                    Self::clause(field, json!({ "$ne": values[0].to_json() }))
                } else {
                    let items: Vec<JsonValue> = values.iter().map(Value::to_json).collect();
                    Self::clause(field, json!({ "$nin": items }))
                }
            }
            Operator::Like | Operator::Contains => Self::regex_clause(field, values, |v| v.to_string()),
            Operator::Unlike => json!({ "$nor": [Self::regex_clause(field, values, |v| v.to_string())] }),
            Operator::Prefix => Self::regex_clause(field, values, |v| format!("^{v}")),
            Operator::Suffix => Self::regex_clause(field, values, |v| format!("{v}$")),
            Operator::Gt => Self::comparison_clause(field, "$gt", values),
            Operator::Gte => Self::comparison_clause(field, "$gte", values),
            Operator::Lt => Self::comparison_clause(field, "$lt", values),
            Operator::Lte => Self::comparison_clause(field, "$lte", values),
            Operator::Range => {
                if values.len() != 2 {
                    return Err(Error::internal(format!(
                        "range criterion on {field} requires exactly two values"
                    )));
                }
                Self::clause(
                    field,
                    json!({ "$gte": values[0].to_json(), "$lte": values[1].to_json() }),
                )
            }
            Operator::Null => Self::clause(field, json!({ "$exists": false })),
            Operator::NotNull => Self::clause(field, json!({ "$exists": true })),
        };
        self.clauses.push(clause);
        self.values.extend(values.iter().cloned());
        Ok(())
    }

    fn finalize(&mut self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.document()).map_err(|err| Error::internal(err.to_string()))
    }

    fn values(&self) -> &[Value] {
        &self.values
    }
}
