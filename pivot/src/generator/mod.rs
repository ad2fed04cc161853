//! The generator framework.
//!
//! A generator consumes a filter plus a collection name and emits a
//! dialect-specific payload: statement text (or a JSON document) together
//! with the bound values in the order they were consumed. Engines with no
//! textual dialect compile to predicates instead (see [`memory`]).

pub mod elastic;
pub mod memory;
pub mod mongo;
pub mod sql;

use std::collections::BTreeMap;

use crate::errors::Result;
use crate::filter::{Aggregate, Criterion, Filter};
use crate::value::Value;

/// The pluggable renderer contract. Calls arrive in a fixed order, driven by
/// [`render`]: `initialize`, options, projection, one `push` per criterion,
/// grouping and aggregates, sort, window, then `finalize`.
pub trait Generator {
    fn initialize(&mut self, collection: &str) -> Result<()>;

    /// Free-form hints from the filter (`Distinct`, ...). Renderers pick out
    /// what they understand.
    fn with_options(&mut self, _options: &BTreeMap<String, Value>) {}

    fn with_fields(&mut self, fields: &[String]);

    fn with_group_by(&mut self, fields: &[String]);

    fn with_aggregates(&mut self, aggregates: &[Aggregate]);

    fn with_sort(&mut self, sort: &[String]);

    fn with_limit_offset(&mut self, limit: Option<usize>, offset: usize);

    /// Emit one criterion. Implementations append to their statement and to
    /// the bound-value list.
    fn push(&mut self, criterion: &Criterion) -> Result<()>;

    /// Return the rendered payload bytes.
    fn finalize(&mut self) -> Result<Vec<u8>>;

    /// Bound values in the order they were consumed by `push`.
    fn values(&self) -> &[Value];
}

/// Walk a filter through a generator and return the rendered payload.
pub fn render(generator: &mut dyn Generator, collection: &str, filter: &Filter) -> Result<Vec<u8>> {
    generator.initialize(collection)?;
    generator.with_options(&filter.options);
    generator.with_fields(&filter.fields);
    if !filter.match_all {
        for criterion in &filter.criteria {
            generator.push(criterion)?;
        }
    }
    generator.with_sort(&filter.sort);
    generator.with_limit_offset(filter.limit, filter.offset);
    generator.finalize()
}

/// Like [`render`], adding grouping and aggregate clauses for aggregation
/// queries.
pub fn render_aggregate(
    generator: &mut dyn Generator,
    collection: &str,
    filter: &Filter,
    group_by: &[String],
    aggregates: &[Aggregate],
) -> Result<Vec<u8>> {
    generator.initialize(collection)?;
    generator.with_group_by(group_by);
    generator.with_aggregates(aggregates);
    if !filter.match_all {
        for criterion in &filter.criteria {
            generator.push(criterion)?;
        }
    }
    generator.with_sort(&filter.sort);
    generator.with_limit_offset(filter.limit, filter.offset);
    generator.finalize()
}
