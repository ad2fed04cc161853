//! Composition wrappers: backends and indexers that delegate to another
//! backend while adding a behaviour.

pub mod embedded;
pub mod meta;
pub mod multi;

pub use embedded::EmbeddedRecordBackend;
pub use meta::MetaIndex;
pub use multi::{IndexerOp, MultiIndexer, Strategy};
