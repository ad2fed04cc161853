//! Schema entities: collections of typed fields, records, and the
//! formatter/validator combinators that run around reads and writes.

pub mod collection;
pub mod field;
pub mod formatters;
pub mod record;
pub mod validators;

pub use collection::{Collection, Constraint, DeletePolicy, EXPIRES_AT_FIELD, Relationship};
pub use field::{Field, FormatterScope, Operation};
pub use record::{Id, Record, RecordSet};
