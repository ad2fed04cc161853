//! Collections: named, typed sets of records.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::schema::field::{Field, Operation};
use crate::schema::record::{Id, Record};
use crate::value::{Kind, Value};

/// Field name used to carry an expiry instant for stores without native TTL
/// support; stamped by `make_record` and checked by `is_expired`.
pub const EXPIRES_AT_FIELD: &str = "_expires_at";

/// What happens to referencing records when a referenced record is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeletePolicy {
    #[default]
    Restrict,
    Nullify,
    Delete,
    Cascade,
}

/// A relational FK-style declaration: `field` on this collection references
/// `related_field` on `collection`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub collection: String,
    pub field: String,
    #[serde(default)]
    pub related_field: Option<String>,
    #[serde(default)]
    pub on_delete: DeletePolicy,
}

/// A relationship declaration resolved by the embedded-record wrapper:
/// after a read, `field` is populated with the related record(s) looked up
/// through `via`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Name of the field the related record is inlined into.
    pub field: String,
    /// The related collection.
    pub collection: String,
    /// Local field holding the related key (`belongs_to`), or the remote
    /// field holding this record's key (`has_many`).
    pub via: String,
    /// True for `has_many`: the field inflates to an array of records.
    #[serde(default)]
    pub many: bool,
}

pub type ValueFormatterFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

#[derive(Clone, Default)]
struct KindFormatters(BTreeMap<Kind, ValueFormatterFn>);

impl fmt::Debug for KindFormatters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KindFormatters({:?})", self.0.keys().collect::<Vec<_>>())
    }
}

mod ttl_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Collection {
    pub name: String,
    pub fields: Vec<Field>,
    /// Primary-key field name; kept in sync with the `identity` flag when
    /// fields are added through the builder.
    #[serde(default = "default_identity_field")]
    pub identity_field: String,
    #[serde(default = "default_identity_kind")]
    pub identity_field_type: Kind,
    /// Search-index name; defaults to the collection name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    /// Aggregation target name; defaults to the collection name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator_name: Option<String>,
    /// Original provenance of the data, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    /// Zero means records never expire.
    #[serde(default, with = "ttl_serde")]
    pub time_to_live: Duration,
    /// Whether this backend is the source of truth; false marks an
    /// index-only collection.
    #[serde(default = "default_true")]
    pub authoritative: bool,
    /// When true the indexer never persists copies of records.
    #[serde(default)]
    pub skip_index_persistence: bool,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(skip)]
    pre_save_formatters: KindFormatters,
    #[serde(skip)]
    export_formatters: KindFormatters,
}

fn default_identity_field() -> String {
    "id".to_string()
}

fn default_identity_kind() -> Kind {
    Kind::Int
}

fn default_true() -> bool {
    true
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Collection {
        Collection {
            name: name.into(),
            identity_field: default_identity_field(),
            identity_field_type: default_identity_kind(),
            authoritative: true,
            ..Collection::default()
        }
    }

    pub fn with_field(mut self, field: Field) -> Collection {
        if field.identity {
            self.identity_field = field.name.clone();
            self.identity_field_type = field.kind;
        }
        self.fields.push(field);
        self
    }

    pub fn with_index_name(mut self, name: impl Into<String>) -> Collection {
        self.index_name = Some(name.into());
        self
    }

    pub fn with_aggregator_name(mut self, name: impl Into<String>) -> Collection {
        self.aggregator_name = Some(name.into());
        self
    }

    pub fn with_source_uri(mut self, uri: impl Into<String>) -> Collection {
        self.source_uri = Some(uri.into());
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Collection {
        self.time_to_live = ttl;
        self
    }

    pub fn non_authoritative(mut self) -> Collection {
        self.authoritative = false;
        self
    }

    pub fn skip_index_persistence(mut self) -> Collection {
        self.skip_index_persistence = true;
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Collection {
        self.constraints.push(constraint);
        self
    }

    pub fn belongs_to(
        mut self,
        field: impl Into<String>,
        collection: impl Into<String>,
        via: impl Into<String>,
    ) -> Collection {
        self.relationships.push(Relationship {
            field: field.into(),
            collection: collection.into(),
            via: via.into(),
            many: false,
        });
        self
    }

    pub fn has_many(
        mut self,
        field: impl Into<String>,
        collection: impl Into<String>,
        via: impl Into<String>,
    ) -> Collection {
        self.relationships.push(Relationship {
            field: field.into(),
            collection: collection.into(),
            via: via.into(),
            many: true,
        });
        self
    }

    pub fn with_pre_save_formatter<F>(mut self, kind: Kind, f: F) -> Collection
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.pre_save_formatters.0.insert(kind, Arc::new(f));
        self
    }

    pub fn with_export_formatter<F>(mut self, kind: Kind, f: F) -> Collection
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.export_formatters.0.insert(kind, Arc::new(f));
        self
    }

    /// The search-index name, defaulting to the collection name.
    pub fn index_name(&self) -> &str {
        self.index_name.as_deref().unwrap_or(&self.name)
    }

    /// The aggregation target name, defaulting to the collection name.
    pub fn aggregator_name(&self) -> &str {
        self.aggregator_name.as_deref().unwrap_or(&self.name)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Members of the composite key: the identity field first, then every
    /// `key`-flagged field in declaration order.
    pub fn key_fields(&self) -> Vec<&Field> {
        let mut out = Vec::new();
        if let Some(identity) = self.field(&self.identity_field) {
            out.push(identity);
        }
        out.extend(self.fields.iter().filter(|f| f.key && !f.identity));
        out
    }

    /// Arity of a record identity: 1 for the identity field plus one per
    /// `key`-flagged field.
    pub fn key_count(&self) -> usize {
        1 + self.fields.iter().filter(|f| f.key && !f.identity).count()
    }

    pub fn is_identity_field(&self, name: &str) -> bool {
        name == self.identity_field || name == "id" || name == "_id"
    }

    pub fn is_key_field(&self, name: &str) -> bool {
        self.field(name).map(|f| f.key && !f.identity).unwrap_or(false)
    }

    pub fn first_non_identity_key_field(&self) -> Option<&Field> {
        self.fields.iter().find(|f| f.key && !f.identity)
    }

    /// Prepare a record for a write: resolve defaults, derive composite-key
    /// members, run formatter chains (field-level, then per-kind pre-save),
    /// coerce toward declared kinds, and validate. Pre-save formatters run
    /// exactly once per write, here.
    pub fn make_record(&self, record: &Record, op: Operation) -> Result<Record> {
        let mut out = record.clone();
        out.collection_name = Some(self.name.clone());

        // Surface the incoming identity as a field so formatters and
        // validators see it.
        if let Some(value) = record.id.first()
            && out.get(&self.identity_field).is_none()
        {
            out.set(&self.identity_field, value.clone());
        }

        for field in &self.fields {
            let mut value = match field.key_fn.as_ref() {
                Some(derive) if field.key => derive(&out)?,
                _ => out.get_value(&field.name),
            };

            if value.is_zero()
                && (op == Operation::Create || field.required)
                && let Some(default) = field.resolve_default()
            {
                value = default;
            }

            value = field.format(value, op)?;
            if let Some(formatter) = self.pre_save_formatters.0.get(&field.kind) {
                value = formatter(value)?;
            }
            if !value.is_null() {
                value = field.convert_value(&value)?;
            }

            if !value.is_null() || field.required {
                field.validate(&value)?;
            }

            let identity_assigned_later =
                field.identity && value.is_zero() && op == Operation::Create;
            if field.required && value.is_zero() && !identity_assigned_later {
                return Err(Error::validation(
                    &field.name,
                    "required field has no value and no resolvable default",
                ));
            }

            if value.is_zero() && field.omit_empty {
                out.fields.remove(&field.name);
            } else {
                out.fields.insert(field.name.clone(), value);
            }
        }

        if self.time_to_live > Duration::ZERO && out.get(EXPIRES_AT_FIELD).is_none() {
            let expires = Utc::now()
                + chrono::Duration::from_std(self.time_to_live)
                    .map_err(|err| Error::internal(format!("ttl out of range: {err}")))?;
            out.set(EXPIRES_AT_FIELD, Value::Time(expires));
        }

        out.id = self.record_id(&out)?;
        Ok(out)
    }

    /// The canonical composite identity of a record, derived from its
    /// fields. Empty when the identity member is unset (backend-assigned
    /// insert path).
    pub fn record_id(&self, record: &Record) -> Result<Id> {
        let identity = record.get_value(&self.identity_field);
        if identity.is_zero() {
            return Ok(Id::default());
        }
        let mut id = Id::from(identity.coerce(self.identity_field_type)?);
        for field in self.fields.iter().filter(|f| f.key && !f.identity) {
            let value = record.get_value(&field.name);
            if value.is_zero() {
                return Err(Error::validation(
                    &field.name,
                    "composite-key member has no value",
                ));
            }
            id.push(field.convert_value(&value)?);
        }
        Ok(id)
    }

    /// Per-kind export formatter hook, applied during post-read population.
    pub fn apply_export_formatter(&self, kind: Kind, value: Value) -> Result<Value> {
        match self.export_formatters.0.get(&kind) {
            Some(formatter) => formatter(value),
            None => Ok(value),
        }
    }

    /// True when a TTL is declared and the record's expiry instant has
    /// passed. Expiry is checked at access time; nothing sweeps.
    pub fn is_expired(&self, record: &Record) -> bool {
        if self.time_to_live.is_zero() {
            return false;
        }
        match record.get(EXPIRES_AT_FIELD) {
            Some(value) => match value {
                Value::Time(t) => *t <= Utc::now(),
                other => other
                    .coerce(Kind::Time)
                    .ok()
                    .and_then(|v| v.as_time())
                    .map(|t| t <= Utc::now())
                    .unwrap_or(false),
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::formatters;

    fn users() -> Collection {
        Collection::new("users")
            .with_field(Field::identity("id", Kind::Int))
            .with_field(Field::new("email", Kind::String).required().unique())
            .with_field(Field::new("age", Kind::Int))
    }

    #[test]
    fn key_count_and_field_roles() {
        let sessions = Collection::new("sessions")
            .with_field(Field::identity("user", Kind::String))
            .with_field(Field::new("device", Kind::String).key())
            .with_field(Field::new("token", Kind::String));

        assert_eq!(sessions.key_count(), 2);
        assert_eq!(sessions.identity_field, "user");
        assert!(sessions.is_identity_field("user"));
        assert!(sessions.is_identity_field("_id"));
        assert!(sessions.is_key_field("device"));
        assert!(!sessions.is_key_field("token"));
        assert_eq!(
            sessions.first_non_identity_key_field().map(|f| f.name.as_str()),
            Some("device")
        );
        assert_eq!(users().key_count(), 1);
    }

    #[test]
    fn make_record_applies_defaults_and_coercions() {
        let coll = Collection::new("events")
            .with_field(Field::identity("id", Kind::String))
            .with_field(Field::new("level", Kind::String).required().with_default("info"))
            .with_field(Field::new("count", Kind::Int));

        let record = Record::new("e1").with_field("count", "7");
        let made = coll.make_record(&record, Operation::Create).unwrap();
        assert_eq!(made.get_value("level"), Value::from("info"));
        assert_eq!(made.get_value("count"), Value::Int(7));
        assert_eq!(made.id.to_key(":"), "e1");
    }

    #[test]
    fn make_record_rejects_missing_required() {
        let coll = users();
        let record = Record::new(1i64).with_field("age", 30);
        let err = coll.make_record(&record, Operation::Create).unwrap_err();
        assert!(matches!(err, Error::ValidationFailed { field, .. } if field == "email"));
    }

    #[test]
    fn make_record_allows_backend_assigned_identity() {
        let coll = users();
        let record = Record::anonymous().with_field("email", "a@b.c");
        let made = coll.make_record(&record, Operation::Create).unwrap();
        assert!(made.id.is_empty());
    }

    #[test]
    fn composite_identity_derivation() {
        let sessions = Collection::new("sessions")
            .with_field(Field::identity("user", Kind::String))
            .with_field(Field::new("device", Kind::String).key())
            .with_field(Field::new("token", Kind::String));

        let record = Record::anonymous()
            .with_field("user", "u1")
            .with_field("device", "d1")
            .with_field("token", "t");
        let made = sessions.make_record(&record, Operation::Create).unwrap();
        assert_eq!(made.id.to_key(":"), "u1:d1");

        let incomplete = Record::anonymous().with_field("user", "u1");
        assert!(sessions.make_record(&incomplete, Operation::Create).is_err());
    }

    #[test]
    fn key_fn_derives_members() {
        let coll = Collection::new("shards")
            .with_field(Field::identity("id", Kind::String))
            .with_field(
                Field::new("bucket", Kind::String)
                    .with_key_fn(|record| Ok(Value::from(record.get_value("id").to_display_string().len() as i64))),
            );
        let record = Record::new("abcd");
        let made = coll.make_record(&record, Operation::Create).unwrap();
        assert_eq!(made.get_value("bucket"), Value::from("4"));
        assert_eq!(made.id.to_key(":"), "abcd:4");
    }

    #[test]
    fn pre_save_formatters_run_per_kind() {
        let coll = Collection::new("notes")
            .with_field(Field::identity("id", Kind::String))
            .with_field(Field::new("body", Kind::String))
            .with_pre_save_formatter(Kind::String, |value| {
                Ok(match value {
                    Value::String(s) => Value::String(s.to_uppercase()),
                    other => other,
                })
            });

        let record = Record::new("n1").with_field("body", "quiet");
        let made = coll.make_record(&record, Operation::Create).unwrap();
        assert_eq!(made.get_value("body"), Value::from("QUIET"));
    }

    #[test]
    fn ttl_stamps_and_expires() {
        let coll = Collection::new("sessions")
            .with_field(Field::identity("id", Kind::String))
            .with_time_to_live(Duration::from_secs(60));

        let made = coll
            .make_record(&Record::new("s1"), Operation::Create)
            .unwrap();
        assert!(made.get(EXPIRES_AT_FIELD).is_some());
        assert!(!coll.is_expired(&made));

        let mut expired = made.clone();
        expired.set(EXPIRES_AT_FIELD, Value::Time(Utc::now() - chrono::Duration::seconds(5)));
        assert!(coll.is_expired(&expired));

        let no_ttl = Collection::new("stuff").with_field(Field::identity("id", Kind::String));
        assert!(!no_ttl.is_expired(&made));
    }

    #[test]
    fn formatter_chain_runs_once_per_write() {
        use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let coll = Collection::new("things")
            .with_field(Field::identity("id", Kind::String))
            .with_field(
                Field::new("name", Kind::String).with_formatter(crate::schema::field::FormatterScope::Persist, |v, op| {
                    CALLS.fetch_add(1, AtomicOrdering::SeqCst);
                    formatters::trim_space(v, op)
                }),
            );

        let record = Record::new("t1").with_field("name", " x ");
        let made = coll.make_record(&record, Operation::Create).unwrap();
        assert_eq!(made.get_value("name"), Value::from("x"));
        assert_eq!(CALLS.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn schema_serde_round_trip() {
        let coll = users().with_time_to_live(Duration::from_secs(30)).with_constraint(Constraint {
            collection: "teams".to_string(),
            field: "team_id".to_string(),
            related_field: None,
            on_delete: DeletePolicy::Nullify,
        });
        let json = serde_json::to_string(&coll).unwrap();
        let back: Collection = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "users");
        assert_eq!(back.identity_field, "id");
        assert_eq!(back.time_to_live, Duration::from_secs(30));
        assert_eq!(back.constraints.len(), 1);
        assert_eq!(back.fields.len(), 3);
        assert_eq!(back.index_name(), "users");
    }
}
