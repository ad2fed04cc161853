//! Pivot: a polyglot data-access abstraction layer.
//!
//! Applications describe their data as collections of typed records and
//! talk to one uniform CRUD + search + aggregation API; Pivot routes each
//! operation to a backend (the authoritative store), an indexer (the query
//! engine), and an aggregator (the analytics engine), translating a
//! neutral filter algebra into each engine's native dialect.
//!
//! ```no_run
//! use pivot::prelude::*;
//!
//! # async fn example() -> pivot::Result<()> {
//! let backend = pivot::connect("memory://").await?;
//! backend.register_collection(
//!     Collection::new("users")
//!         .with_field(Field::identity("id", Kind::Int))
//!         .with_field(Field::new("email", Kind::String).required()),
//! );
//!
//! let mut set = RecordSet::from(Record::anonymous().with_field("email", "a@b.c"));
//! backend.insert("users", &mut set).await?;
//!
//! let indexer = backend.with_search("users").expect("memory supports search");
//! let hits = indexer.query("users", &Filter::parse("email/suffix:b.c")?).await?;
//! assert_eq!(hits.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod compose;
pub mod dsn;
pub mod errors;
pub mod filter;
pub mod generator;
pub mod mapper;
pub mod schema;
pub mod value;

pub use backend::{
    Aggregator, Backend, Feature, Indexer, QueryPage, connect, register_backend,
    register_builtin_backends, spawn_pinger, update_matching,
};
pub use dsn::ConnectionString;
pub use errors::{Error, ErrorList, Result};
pub use filter::{Aggregate, Aggregation, Criterion, Filter, Operator};
pub use schema::{Collection, Constraint, DeletePolicy, Field, FormatterScope, Id, Operation, Record, RecordSet, Relationship};
pub use value::{Kind, Value, autotype, convert_to, detect_convert_type};

/// One-line import for applications.
pub mod prelude {
    pub use crate::backend::{Aggregator, Backend, Feature, Indexer};
    pub use crate::dsn::ConnectionString;
    pub use crate::errors::{Error, Result};
    pub use crate::filter::{Aggregate, Aggregation, Criterion, Filter, Operator};
    pub use crate::schema::{
        Collection, Constraint, DeletePolicy, Field, FormatterScope, Id, Operation, Record,
        RecordSet, Relationship,
    };
    pub use crate::value::{Kind, Value};
}
