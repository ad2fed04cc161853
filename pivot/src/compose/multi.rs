//! Multi-indexer: an ordered list of indexers with per-operation selection
//! strategies.
//!
//! `Sequential` walks the list until one child succeeds and never invokes
//! the rest; `All` fans a persistent operation out to every child,
//! attempting each even after a failure, and returns the first error;
//! `First`, `AllExceptFirst`, and `Random` narrow the target list.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;

use crate::backend::{Backend, Indexer, QueryResultFn};
use crate::dsn::ConnectionString;
use crate::errors::{Error, Result};
use crate::filter::Filter;
use crate::schema::record::{Id, Record, RecordSet};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Walk in order; first success wins, later children untouched.
    Sequential,
    /// Only the first indexer.
    First,
    /// Every indexer except the first.
    AllExceptFirst,
    /// Every indexer; all are attempted, the first error is returned.
    All,
    /// One randomly-chosen indexer.
    Random,
}

/// The operations a strategy can be assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexerOp {
    Retrieve,
    Query,
    Persist,
    Remove,
}

pub struct MultiIndexer {
    dsn: ConnectionString,
    indexers: RwLock<Vec<Arc<dyn Indexer>>>,
    strategies: RwLock<BTreeMap<IndexerOp, Strategy>>,
    parent: RwLock<Option<Arc<dyn Backend>>>,
}

impl MultiIndexer {
    pub fn new(indexers: Vec<Arc<dyn Indexer>>) -> Arc<MultiIndexer> {
        let mut strategies = BTreeMap::new();
        strategies.insert(IndexerOp::Retrieve, Strategy::Sequential);
        strategies.insert(IndexerOp::Query, Strategy::Sequential);
        strategies.insert(IndexerOp::Persist, Strategy::All);
        strategies.insert(IndexerOp::Remove, Strategy::All);
        Arc::new(MultiIndexer {
            dsn: ConnectionString::parse("multi://").unwrap_or_default(),
            indexers: RwLock::new(indexers),
            strategies: RwLock::new(strategies),
            parent: RwLock::new(None),
        })
    }

    pub fn set_strategy(&self, op: IndexerOp, strategy: Strategy) {
        self.strategies.write().unwrap().insert(op, strategy);
    }

    fn strategy(&self, op: IndexerOp) -> Strategy {
        self.strategies
            .read()
            .unwrap()
            .get(&op)
            .copied()
            .unwrap_or(Strategy::Sequential)
    }

    /// Add an indexer; it inherits the multi-indexer's initialisation state.
    pub async fn add_indexer(&self, indexer: Arc<dyn Indexer>) -> Result<()> {
        if let Some(parent) = self.parent.read().unwrap().clone() {
            indexer.index_initialize(parent).await?;
        }
        self.indexers.write().unwrap().push(indexer);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.indexers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexers.read().unwrap().is_empty()
    }

    /// The children an operation addresses under its strategy, in order.
    fn targets(&self, op: IndexerOp) -> (Vec<Arc<dyn Indexer>>, Strategy) {
        let strategy = self.strategy(op);
        let all: Vec<Arc<dyn Indexer>> = self.indexers.read().unwrap().clone();
        let selected = match strategy {
            Strategy::First => all.into_iter().take(1).collect(),
            Strategy::AllExceptFirst => all.into_iter().skip(1).collect(),
            Strategy::Random => {
                if all.is_empty() {
                    all
                } else {
                    let pick = rand::thread_rng().gen_range(0..all.len());
                    vec![all[pick].clone()]
                }
            }
            Strategy::Sequential | Strategy::All => all,
        };
        (selected, strategy)
    }

    fn no_children(&self) -> Error {
        Error::not_implemented("multi", "no indexers configured")
    }
}

macro_rules! fan_out_unit {
    ($self:expr, $op:expr, $child:ident => $call:expr) => {{
        let (targets, strategy) = $self.targets($op);
        if targets.is_empty() {
            return Err($self.no_children());
        }
        match strategy {
            Strategy::Sequential => {
                let mut last = None;
                for $child in targets {
                    match $call {
                        Ok(value) => return Ok(value),
                        Err(err) => last = Some(err),
                    }
                }
                Err(last.unwrap_or_else(|| $self.no_children()))
            }
            _ => {
                // Attempt every target; the first error is returned after
                // the rest have run.
                let mut errors = Vec::new();
                for $child in targets {
                    if let Err(err) = $call {
                        errors.push(err);
                    }
                }
                match errors.len() {
                    0 => Ok(()),
                    1 => Err(errors.remove(0)),
                    _ => Err(Error::Multiple(crate::errors::ErrorList(errors))),
                }
            }
        }
    }};
}

macro_rules! first_success {
    ($self:expr, $op:expr, $child:ident => $call:expr) => {{
        let (targets, _) = $self.targets($op);
        if targets.is_empty() {
            return Err($self.no_children());
        }
        let mut last = None;
        for $child in targets {
            match $call {
                Ok(value) => return Ok(value),
                Err(err) => last = Some(err),
            }
        }
        Err(last.unwrap_or_else(|| $self.no_children()))
    }};
}

#[async_trait]
impl Indexer for MultiIndexer {
    fn index_connection_string(&self) -> &ConnectionString {
        &self.dsn
    }

    async fn index_initialize(&self, parent: Arc<dyn Backend>) -> Result<()> {
        let children: Vec<Arc<dyn Indexer>> = self.indexers.read().unwrap().clone();
        for child in children {
            child.index_initialize(Arc::clone(&parent)).await?;
        }
        *self.parent.write().unwrap() = Some(parent);
        Ok(())
    }

    fn parent(&self) -> Option<Arc<dyn Backend>> {
        self.parent.read().unwrap().clone()
    }

    async fn index_exists(&self, collection: &str, id: &Id) -> bool {
        let (targets, _) = self.targets(IndexerOp::Retrieve);
        for child in targets {
            if child.index_exists(collection, id).await {
                return true;
            }
        }
        false
    }

    async fn index_retrieve(&self, collection: &str, id: &Id) -> Result<Record> {
        first_success!(self, IndexerOp::Retrieve, child => child.index_retrieve(collection, id).await)
    }

    async fn index_remove(&self, collection: &str, ids: &[Id]) -> Result<()> {
        fan_out_unit!(self, IndexerOp::Remove, child => child.index_remove(collection, ids).await)
    }

    async fn index(&self, collection: &str, records: &RecordSet) -> Result<()> {
        fan_out_unit!(self, IndexerOp::Persist, child => child.index(collection, records).await)
    }

    async fn query_func(&self, collection: &str, filter: &Filter, each: QueryResultFn<'_>) -> Result<()> {
        let (targets, _) = self.targets(IndexerOp::Query);
        if targets.is_empty() {
            return Err(self.no_children());
        }
        let mut last = None;
        for child in targets {
            match child.query_func(collection, filter, each).await {
                Ok(()) => return Ok(()),
                Err(err) => last = Some(err),
            }
        }
        Err(last.unwrap_or_else(|| self.no_children()))
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<RecordSet> {
        first_success!(self, IndexerOp::Query, child => child.query(collection, filter).await)
    }

    async fn list_values(
        &self,
        collection: &str,
        fields: &[String],
        filter: &Filter,
    ) -> Result<BTreeMap<String, Vec<Value>>> {
        first_success!(self, IndexerOp::Query, child => child.list_values(collection, fields, filter).await)
    }

    async fn delete_query(&self, collection: &str, filter: &Filter) -> Result<()> {
        fan_out_unit!(self, IndexerOp::Remove, child => child.delete_query(collection, filter).await)
    }

    async fn flush_index(&self) -> Result<()> {
        let children: Vec<Arc<dyn Indexer>> = self.indexers.read().unwrap().clone();
        let mut errors = Vec::new();
        for child in children {
            if let Err(err) = child.flush_index().await {
                errors.push(err);
            }
        }
        Error::join(errors)
    }
}
