//! SQL statement generation, templated by dialect.
//!
//! One generator serves every relational dialect; the differences live in a
//! [`SqlDialect`] value: placeholder syntax, identifier quoting, type-name
//! mapping, and the shape of the introspection queries used by
//! autoregistration.

use crate::errors::{Error, Result};
use crate::filter::{Aggregate, Aggregation, Criterion, Filter, Operator};
use crate::generator::Generator;
use crate::schema::collection::Collection;
use crate::schema::field::Field;
use crate::value::{Kind, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// `?` for every bound value.
    Question,
    /// `$1`, `$2`, ... positional markers.
    Dollar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlDialect {
    pub name: &'static str,
    pub placeholder: Placeholder,
    pub quote: char,
}

pub const SQLITE: SqlDialect = SqlDialect {
    name: "sqlite",
    placeholder: Placeholder::Question,
    quote: '"',
};

pub const MYSQL: SqlDialect = SqlDialect {
    name: "mysql",
    placeholder: Placeholder::Question,
    quote: '`',
};

pub const POSTGRES: SqlDialect = SqlDialect {
    name: "postgres",
    placeholder: Placeholder::Dollar,
    quote: '"',
};

impl SqlDialect {
    pub fn for_scheme(scheme: &str) -> Option<&'static SqlDialect> {
        match scheme {
            "sqlite" => Some(&SQLITE),
            "mysql" => Some(&MYSQL),
            "postgres" | "postgresql" => Some(&POSTGRES),
            _ => None,
        }
    }

    pub fn quote_ident(&self, ident: &str) -> String {
        let escaped = ident.replace(self.quote, &format!("{0}{0}", self.quote));
        format!("{0}{1}{0}", self.quote, escaped)
    }

    /// The marker for the `ordinal`-th (1-based) bound value.
    pub fn placeholder(&self, ordinal: usize) -> String {
        match self.placeholder {
            Placeholder::Question => "?".to_string(),
            Placeholder::Dollar => format!("${ordinal}"),
        }
    }

    /// Column type for a field, honouring a `native_type` override.
    pub fn type_name(&self, field: &Field) -> String {
        if let Some(native) = &field.native_type {
            return native.clone();
        }
        match (self.name, field.kind) {
            (_, Kind::Int) if self.name == "sqlite" => "INTEGER".to_string(),
            (_, Kind::Int) => "BIGINT".to_string(),
            ("sqlite", Kind::Float) => "REAL".to_string(),
            ("mysql", Kind::Float) => "DOUBLE".to_string(),
            (_, Kind::Float) => "DOUBLE PRECISION".to_string(),
            ("sqlite", Kind::Bool) => "INTEGER".to_string(),
            ("mysql", Kind::Bool) => "TINYINT(1)".to_string(),
            (_, Kind::Bool) => "BOOLEAN".to_string(),
            ("sqlite", Kind::Time) => "TEXT".to_string(),
            ("mysql", Kind::Time) => "DATETIME".to_string(),
            (_, Kind::Time) => "TIMESTAMP WITH TIME ZONE".to_string(),
            ("sqlite", Kind::String) => "TEXT".to_string(),
            (_, Kind::String) => format!("VARCHAR({})", field.length.unwrap_or(255)),
            ("sqlite", Kind::Raw) => "BLOB".to_string(),
            ("mysql", Kind::Raw) => "BLOB".to_string(),
            (_, Kind::Raw) => "BYTEA".to_string(),
            ("postgres", Kind::Object | Kind::Array) => "JSONB".to_string(),
            ("mysql", Kind::Object | Kind::Array) => "JSON".to_string(),
            (_, Kind::Object | Kind::Array) => "TEXT".to_string(),
        }
    }

    /// The auto-incrementing identity column clause.
    fn identity_column(&self, field: &Field) -> String {
        let name = self.quote_ident(&field.name);
        match (self.name, field.kind) {
            ("sqlite", Kind::Int) => format!("{name} INTEGER PRIMARY KEY AUTOINCREMENT"),
            ("mysql", Kind::Int) => format!("{name} BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY"),
            ("postgres", Kind::Int) => format!("{name} BIGSERIAL PRIMARY KEY"),
            _ => format!("{name} {} NOT NULL PRIMARY KEY", self.type_name(field)),
        }
    }

    /// Statement listing the dataset's tables, for autoregistration.
    pub fn list_tables_statement(&self) -> &'static str {
        match self.name {
            "sqlite" => "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            "mysql" => "SELECT table_name FROM information_schema.tables WHERE table_schema = DATABASE()",
            _ => "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public'",
        }
    }

    /// Statement describing a table's columns, for inferred schemas.
    pub fn describe_table_statement(&self, table: &str) -> (String, Vec<Value>) {
        match self.name {
            "sqlite" => (format!("PRAGMA table_info({})", self.quote_ident(table)), Vec::new()),
            _ => (
                format!(
                    "SELECT column_name, data_type, is_nullable FROM information_schema.columns WHERE table_name = {}",
                    self.placeholder(1)
                ),
                vec![Value::from(table)],
            ),
        }
    }

    /// `CREATE TABLE` for a collection definition.
    pub fn create_table_statement(&self, collection: &Collection) -> String {
        let mut columns = Vec::new();
        for field in &collection.fields {
            if field.identity {
                columns.push(self.identity_column(field));
                continue;
            }
            let mut column = format!("{} {}", self.quote_ident(&field.name), self.type_name(field));
            if field.required {
                column.push_str(" NOT NULL");
            }
            if field.unique {
                column.push_str(" UNIQUE");
            }
            columns.push(column);
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quote_ident(&collection.name),
            columns.join(", ")
        )
    }
}

/// Renders a filter into a `SELECT` statement; also provides the write-side
/// statement builders used by the SQL backend. The placeholder count of any
/// produced statement equals the length of [`Generator::values`].
pub struct SqlGenerator {
    dialect: &'static SqlDialect,
    collection: String,
    fields: Vec<String>,
    group_by: Vec<String>,
    aggregates: Vec<Aggregate>,
    clauses: Vec<String>,
    values: Vec<Value>,
    sort: Vec<String>,
    limit: Option<usize>,
    offset: usize,
    count_only: bool,
    distinct: bool,
}

impl SqlGenerator {
    pub fn new(dialect: &'static SqlDialect) -> SqlGenerator {
        SqlGenerator {
            dialect,
            collection: String::new(),
            fields: Vec::new(),
            group_by: Vec::new(),
            aggregates: Vec::new(),
            clauses: Vec::new(),
            values: Vec::new(),
            sort: Vec::new(),
            limit: None,
            offset: 0,
            count_only: false,
            distinct: false,
        }
    }

    pub fn dialect(&self) -> &'static SqlDialect {
        self.dialect
    }

    /// Render `SELECT COUNT(*)` instead of a projection.
    pub fn count_only(mut self) -> SqlGenerator {
        self.count_only = true;
        self
    }

    fn next_placeholder(&mut self, value: Value) -> String {
        self.values.push(value);
        self.dialect.placeholder(self.values.len())
    }

    fn placeholders_for(&mut self, values: &[Value]) -> Vec<String> {
        values
            .iter()
            .map(|v| self.next_placeholder(v.clone()))
            .collect()
    }

    fn comparison(&mut self, column: &str, op: &str, values: &[Value]) -> Result<String> {
        let clauses: Vec<String> = values
            .iter()
            .map(|v| format!("{column} {op} {}", self.next_placeholder(v.clone())))
            .collect();
        Ok(match clauses.len() {
            1 => clauses.into_iter().next().unwrap_or_default(),
            _ => format!("({})", clauses.join(" OR ")),
        })
    }

    fn like(&mut self, column: &str, values: &[Value], pattern: fn(&str) -> String, negate: bool) -> Result<String> {
        let keyword = if negate { "NOT LIKE" } else { "LIKE" };
        let clauses: Vec<String> = values
            .iter()
            .map(|v| {
                let bound = Value::String(pattern(&v.to_display_string()));
                format!("{column} {keyword} {}", self.next_placeholder(bound))
            })
            .collect();
        let joiner = if negate { " AND " } else { " OR " };
        Ok(match clauses.len() {
            1 => clauses.into_iter().next().unwrap_or_default(),
            _ => format!("({})", clauses.join(joiner)),
        })
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    fn order_sql(&self) -> String {
        if self.sort.is_empty() {
            return String::new();
        }
        let directives: Vec<String> = self
            .sort
            .iter()
            .map(|s| match s.strip_prefix('-') {
                Some(field) => format!("{} DESC", self.dialect.quote_ident(field)),
                None => format!("{} ASC", self.dialect.quote_ident(s)),
            })
            .collect();
        format!(" ORDER BY {}", directives.join(", "))
    }

    fn window_sql(&self) -> String {
        let mut out = String::new();
        if let Some(limit) = self.limit {
            out.push_str(&format!(" LIMIT {limit}"));
        }
        if self.offset > 0 {
            out.push_str(&format!(" OFFSET {}", self.offset));
        }
        out
    }

    fn projection_sql(&self) -> String {
        if self.count_only {
            return "COUNT(*)".to_string();
        }
        let mut columns: Vec<String> = self
            .group_by
            .iter()
            .map(|f| self.dialect.quote_ident(f))
            .collect();
        for aggregate in &self.aggregates {
            let function = match aggregate.aggregation {
                Aggregation::Sum => "SUM",
                Aggregation::Count => "COUNT",
                Aggregation::Min => "MIN",
                Aggregation::Max => "MAX",
                Aggregation::Avg => "AVG",
                Aggregation::First | Aggregation::Last => "MIN",
            };
            columns.push(format!(
                "{function}({}) AS {}",
                self.dialect.quote_ident(&aggregate.field),
                self.dialect
                    .quote_ident(&format!("{}_{}", aggregate.aggregation.as_str(), aggregate.field))
            ));
        }
        if columns.is_empty() {
            if self.fields.is_empty() {
                "*".to_string()
            } else {
                self.fields
                    .iter()
                    .map(|f| self.dialect.quote_ident(f))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        } else {
            columns.join(", ")
        }
    }

    /// `INSERT` for the given columns; returns the statement and its bound
    /// values.
    pub fn insert_statement(&self, table: &str, columns: &[(String, Value)]) -> (String, Vec<Value>) {
        let names: Vec<String> = columns.iter().map(|(n, _)| self.dialect.quote_ident(n)).collect();
        let markers: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, _)| self.dialect.placeholder(i + 1))
            .collect();
        let statement = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.dialect.quote_ident(table),
            names.join(", "),
            markers.join(", ")
        );
        let values = columns.iter().map(|(_, v)| v.clone()).collect();
        (statement, values)
    }

    /// `UPDATE ... SET ... WHERE` over exact key columns.
    pub fn update_statement(
        &self,
        table: &str,
        set: &[(String, Value)],
        keys: &[(String, Value)],
    ) -> (String, Vec<Value>) {
        let mut values = Vec::with_capacity(set.len() + keys.len());
        let assignments: Vec<String> = set
            .iter()
            .map(|(n, v)| {
                values.push(v.clone());
                format!("{} = {}", self.dialect.quote_ident(n), self.dialect.placeholder(values.len()))
            })
            .collect();
        let conditions: Vec<String> = keys
            .iter()
            .map(|(n, v)| {
                values.push(v.clone());
                format!("{} = {}", self.dialect.quote_ident(n), self.dialect.placeholder(values.len()))
            })
            .collect();
        let statement = format!(
            "UPDATE {} SET {} WHERE {}",
            self.dialect.quote_ident(table),
            assignments.join(", "),
            conditions.join(" AND ")
        );
        (statement, values)
    }

    /// `DELETE ... WHERE` over exact key columns.
    pub fn delete_statement(&self, table: &str, keys: &[(String, Value)]) -> (String, Vec<Value>) {
        let mut values = Vec::with_capacity(keys.len());
        let conditions: Vec<String> = keys
            .iter()
            .map(|(n, v)| {
                values.push(v.clone());
                format!("{} = {}", self.dialect.quote_ident(n), self.dialect.placeholder(values.len()))
            })
            .collect();
        let statement = format!(
            "DELETE FROM {} WHERE {}",
            self.dialect.quote_ident(table),
            conditions.join(" AND ")
        );
        (statement, values)
    }

    /// Render a filter into `DELETE FROM ... WHERE ...`.
    pub fn delete_by_filter(dialect: &'static SqlDialect, table: &str, filter: &Filter) -> Result<(String, Vec<Value>)> {
        let mut generator = SqlGenerator::new(dialect);
        generator.initialize(table)?;
        if !filter.match_all {
            for criterion in &filter.criteria {
                generator.push(criterion)?;
            }
        }
        let statement = format!(
            "DELETE FROM {}{}",
            dialect.quote_ident(table),
            generator.where_sql()
        );
        Ok((statement, generator.values))
    }
}

impl Generator for SqlGenerator {
    fn initialize(&mut self, collection: &str) -> Result<()> {
        self.collection = collection.to_string();
        self.clauses.clear();
        self.values.clear();
        Ok(())
    }

    fn with_options(&mut self, options: &std::collections::BTreeMap<String, Value>) {
        self.distinct = options
            .get("Distinct")
            .map(|v| v.to_display_string() == "true")
            .unwrap_or(false);
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
        let column = self.dialect.quote_ident(&criterion.field);
        let values: &[Value] = &criterion.values;
        let clause = match criterion.operator {
            Operator::Is => match values.len() {
                0 => format!("{column} IS NULL"),
                1 if values[0].is_null() => format!("{column} IS NULL"),
                1 => self.comparison(&column, "=", values)?,
                _ => {
                    let markers = self.placeholders_for(values);
                    format!("{column} IN ({})", markers.join(", "))
                }
            },
            Operator::Not => match values.len() {
                0 => format!("{column} IS NOT NULL"),
                1 if values[0].is_null() => format!("{column} IS NOT NULL"),
                1 => self.comparison(&column, "<>", values)?,
                _ => {
                    let markers = self.placeholders_for(values);
                    format!("{column} NOT IN ({})", markers.join(", "))
                }
            },
            Operator::Like | Operator::Contains => self.like(&column, values, |v| format!("%{v}%"), false)?,
            Operator::Unlike => self.like(&column, values, |v| format!("%{v}%"), true)?,
            Operator::Prefix => self.like(&column, values, |v| format!("{v}%"), false)?,
            Operator::Suffix => self.like(&column, values, |v| format!("%{v}"), false)?,
            Operator::Gt => self.comparison(&column, ">", values)?,
            Operator::Gte => self.comparison(&column, ">=", values)?,
            Operator::Lt => self.comparison(&column, "<", values)?,
            Operator::Lte => self.comparison(&column, "<=", values)?,
            Operator::Range => {
                if values.len() != 2 {
                    return Err(Error::internal(format!(
                        "range criterion on {} requires exactly two values",
                        criterion.field
                    )));
                }
                let low = self.next_placeholder(values[0].clone());
                let high = self.next_placeholder(values[1].clone());
                format!("{column} BETWEEN {low} AND {high}")
            }
            Operator::Null => format!("{column} IS NULL"),
            Operator::NotNull => format!("{column} IS NOT NULL"),
        };
        self.clauses.push(clause);
        Ok(())
    }

    fn finalize(&mut self) -> Result<Vec<u8>> {
        let keyword = if self.distinct && !self.count_only {
            "SELECT DISTINCT"
        } else {
            "SELECT"
        };
        let mut statement = format!(
            "{keyword} {} FROM {}{}",
            self.projection_sql(),
            self.dialect.quote_ident(&self.collection),
            self.where_sql()
        );
        if !self.group_by.is_empty() {
            let groups: Vec<String> = self
                .group_by
                .iter()
                .map(|f| self.dialect.quote_ident(f))
                .collect();
            statement.push_str(&format!(" GROUP BY {}", groups.join(", ")));
        }
        statement.push_str(&self.order_sql());
        statement.push_str(&self.window_sql());
        Ok(statement.into_bytes())
    }

    fn values(&self) -> &[Value] {
        &self.values
    }
}
