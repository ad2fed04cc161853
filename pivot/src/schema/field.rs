//! Field definitions.
//!
//! A field couples a name and declared [`Kind`] with the behaviours that run
//! around reads and writes: default computation, formatter chains keyed by
//! operation, and validator chains. Closures are deliberately not part of
//! the serialised schema; a schema loaded from disk carries names, kinds and
//! flags only.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::schema::record::Record;
use crate::value::{Kind, Value, convert_to};

/// The CRUD operation currently in flight, as seen by formatter chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Retrieve,
    Delete,
}

/// Which operations a formatter participates in. `Persist` covers both
/// write paths; `Always` covers everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatterScope {
    Create,
    Update,
    Retrieve,
    Delete,
    Persist,
    Always,
}

impl FormatterScope {
    pub fn applies_to(self, op: Operation) -> bool {
        match self {
            FormatterScope::Always => true,
            FormatterScope::Persist => matches!(op, Operation::Create | Operation::Update),
            FormatterScope::Create => op == Operation::Create,
            FormatterScope::Update => op == Operation::Update,
            FormatterScope::Retrieve => op == Operation::Retrieve,
            FormatterScope::Delete => op == Operation::Delete,
        }
    }
}

pub type FormatterFn = Arc<dyn Fn(Value, Operation) -> Result<Value> + Send + Sync>;
pub type ValidatorFn = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;
pub type KeyDeriveFn = Arc<dyn Fn(&Record) -> Result<Value> + Send + Sync>;
pub type DefaultFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// One member of a field's formatter chain.
#[derive(Clone)]
pub struct FieldFormatter {
    pub scope: FormatterScope,
    pub func: FormatterFn,
}

impl fmt::Debug for FieldFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldFormatter({:?})", self.scope)
    }
}

/// A literal default or a zero-argument computation evaluated at write time.
#[derive(Clone)]
pub enum DefaultValue {
    Literal(Value),
    Computed(DefaultFn),
}

impl DefaultValue {
    pub fn resolve(&self) -> Value {
        match self {
            DefaultValue::Literal(v) => v.clone(),
            DefaultValue::Computed(f) => f(),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Literal(v) => write!(f, "Literal({v:?})"),
            DefaultValue::Computed(_) => write!(f, "Computed(..)"),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<usize>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    /// Composite-key member (ordered after the identity field).
    #[serde(default)]
    pub key: bool,
    /// Primary-key member.
    #[serde(default)]
    pub identity: bool,
    /// Opaque storage-level type hint, passed through to generators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_type: Option<String>,
    #[serde(skip)]
    pub default_value: Option<DefaultValue>,
    #[serde(skip)]
    pub formatters: Vec<FieldFormatter>,
    #[serde(skip)]
    pub validators: Vec<ValidatorFn>,
    /// Derives this composite-key member from the rest of the record.
    #[serde(skip)]
    pub key_fn: Option<KeyDeriveFn>,
    #[serde(default)]
    pub omit_empty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("unique", &self.unique)
            .field("key", &self.key)
            .field("identity", &self.identity)
            .field("formatters", &self.formatters.len())
            .field("validators", &self.validators.len())
            .finish_non_exhaustive()
    }
}

impl Field {
    pub fn new(name: impl Into<String>, kind: Kind) -> Field {
        Field {
            name: name.into(),
            kind,
            ..Field::default()
        }
    }

    /// Shorthand for the primary-key member of a collection.
    pub fn identity(name: impl Into<String>, kind: Kind) -> Field {
        let mut field = Field::new(name, kind);
        field.identity = true;
        field.required = true;
        field
    }

    pub fn required(mut self) -> Field {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Field {
        self.unique = true;
        self
    }

    pub fn key(mut self) -> Field {
        self.key = true;
        self
    }

    pub fn omit_empty(mut self) -> Field {
        self.omit_empty = true;
        self
    }

    pub fn with_length(mut self, length: usize) -> Field {
        self.length = Some(length);
        self
    }

    pub fn with_native_type(mut self, native: impl Into<String>) -> Field {
        self.native_type = Some(native.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Field {
        self.description = Some(description.into());
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Field {
        self.default_value = Some(DefaultValue::Literal(value.into()));
        self
    }

    pub fn with_default_fn<F>(mut self, f: F) -> Field
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.default_value = Some(DefaultValue::Computed(Arc::new(f)));
        self
    }

    pub fn with_formatter<F>(mut self, scope: FormatterScope, f: F) -> Field
    where
        F: Fn(Value, Operation) -> Result<Value> + Send + Sync + 'static,
    {
        self.formatters.push(FieldFormatter {
            scope,
            func: Arc::new(f),
        });
        self
    }

    pub fn with_validator<F>(mut self, f: F) -> Field
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(f));
        self
    }

    pub fn with_key_fn<F>(mut self, f: F) -> Field
    where
        F: Fn(&Record) -> Result<Value> + Send + Sync + 'static,
    {
        self.key = true;
        self.key_fn = Some(Arc::new(f));
        self
    }

    /// Run the formatter chain, in declaration order, for formatters whose
    /// scope covers `op`.
    pub fn format(&self, value: Value, op: Operation) -> Result<Value> {
        let mut value = value;
        for formatter in &self.formatters {
            if formatter.scope.applies_to(op) {
                value = (formatter.func)(value, op)?;
            }
        }
        Ok(value)
    }

    /// Run every validator; the first rejection is returned with the field
    /// name attached.
    pub fn validate(&self, value: &Value) -> Result<()> {
        for validator in &self.validators {
            validator(value).map_err(|err| match err {
                Error::ValidationFailed { message, .. } => Error::validation(&self.name, message),
                other => Error::validation(&self.name, other.to_string()),
            })?;
        }
        Ok(())
    }

    /// Coerce a value toward the declared kind.
    pub fn convert_value(&self, value: &Value) -> Result<Value> {
        convert_to(self.kind, value)
    }

    pub fn resolve_default(&self) -> Option<Value> {
        self.default_value.as_ref().map(DefaultValue::resolve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::formatters;
    use crate::schema::validators;

    #[test]
    fn formatter_scope_selection() {
        assert!(FormatterScope::Persist.applies_to(Operation::Create));
        assert!(FormatterScope::Persist.applies_to(Operation::Update));
        assert!(!FormatterScope::Persist.applies_to(Operation::Retrieve));
        assert!(FormatterScope::Always.applies_to(Operation::Delete));
        assert!(!FormatterScope::Retrieve.applies_to(Operation::Create));
    }

    #[test]
    fn format_chains_in_order() {
        let field = Field::new("email", Kind::String)
            .with_formatter(FormatterScope::Persist, formatters::trim_space)
            .with_formatter(FormatterScope::Persist, formatters::lowercase);

        let out = field
            .format(Value::from("  User@Example.COM "), Operation::Create)
            .unwrap();
        assert_eq!(out, Value::from("user@example.com"));

        // Retrieve is outside both scopes; the value passes through.
        let out = field
            .format(Value::from("  X "), Operation::Retrieve)
            .unwrap();
        assert_eq!(out, Value::from("  X "));
    }

    #[test]
    fn validation_reports_field_name() {
        let field = Field::new("status", Kind::String)
            .with_validator(validators::is_one_of(&["on", "off"]));
        assert!(field.validate(&Value::from("on")).is_ok());
        let err = field.validate(&Value::from("maybe")).unwrap_err();
        match err {
            Error::ValidationFailed { field, .. } => assert_eq!(field, "status"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn defaults_resolve_lazily() {
        let field = Field::new("attempts", Kind::Int).with_default(0);
        assert_eq!(field.resolve_default(), Some(Value::Int(0)));

        let field = Field::new("token", Kind::String).with_default_fn(|| Value::from("generated"));
        assert_eq!(field.resolve_default(), Some(Value::from("generated")));
    }

    #[test]
    fn schema_serde_skips_closures() {
        let field = Field::new("name", Kind::String)
            .required()
            .with_default_fn(|| Value::from("x"))
            .with_validator(validators::not_empty);
        let json = serde_json::to_string(&field).unwrap();
        let back: Field = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "name");
        assert!(back.required);
        assert!(back.default_value.is_none());
        assert!(back.validators.is_empty());
    }
}
