use thiserror::Error;

/// Top-level error type returned by Pivot backends, indexers, and aggregators.
///
/// Drivers translate engine-native errors into one of these kinds at their
/// boundary; composition wrappers pass the kind through unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// The named collection is not registered with the backend. Some flows
    /// treat this as a "create on first use" signal.
    #[error("collection not found: {name}")]
    CollectionNotFound { name: String },

    /// A retrieve missed. `exists` never returns this kind, only `false`.
    #[error("record not found: {collection}/{id}")]
    RecordNotFound { collection: String, id: String },

    /// A driver explicitly declines an optional operation.
    #[error("{backend}: operation not implemented: {operation}")]
    NotImplemented { backend: String, operation: String },

    /// Mismatched composite-key arity, detected before touching the store.
    #[error("bad key arity for {collection}: expected {expected}, got {actual}")]
    BadArity {
        collection: String,
        expected: usize,
        actual: usize,
    },

    /// A field's validator rejected a value.
    #[error("validation failed on field {field}: {message}")]
    ValidationFailed { field: String, message: String },

    /// Insert on a present identity, a constraint restriction, or a
    /// concurrent-lock collision.
    #[error("conflict in {collection}: {message}")]
    Conflict { collection: String, message: String },

    /// Transport or timeout failure from `ping` or any operation.
    #[error("{backend} unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },

    /// A generator received a filter it cannot render for its engine.
    #[error("{backend}: query too complex: {message}")]
    QueryTooComplex { backend: String, message: String },

    /// Catch-all for unexpected driver errors; carries the underlying message.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Ordered aggregation of several failures from one batch operation.
    #[error("{0}")]
    Multiple(ErrorList),
}

impl Error {
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    pub fn not_implemented(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        Error::NotImplemented {
            backend: backend.into(),
            operation: operation.into(),
        }
    }

    pub fn unavailable(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Error::BackendUnavailable {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn conflict(collection: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Conflict {
            collection: collection.into(),
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ValidationFailed {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn record_not_found(collection: impl Into<String>, id: impl ToString) -> Self {
        Error::RecordNotFound {
            collection: collection.into(),
            id: id.to_string(),
        }
    }

    /// True when this error (or the first member of a multi-error) is a miss.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::RecordNotFound { .. } | Error::CollectionNotFound { .. } => true,
            Error::Multiple(list) => list.0.first().map(Error::is_not_found).unwrap_or(false),
            _ => false,
        }
    }

    /// Collapse a list of failures into one error, preserving cause order.
    /// Returns `Ok(())` when the list is empty and the sole member when there
    /// is exactly one.
    pub fn join(errors: Vec<Error>) -> Result<()> {
        let mut errors = errors;
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(ErrorList(errors))),
        }
    }
}

/// Ordered multi-error container. The first member is the error a caller
/// would have seen under short-circuit semantics.
#[derive(Debug, Default)]
pub struct ErrorList(pub Vec<Error>);

impl std::fmt::Display for ErrorList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} errors:", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            write!(f, " [{}] {};", i, err)?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_preserves_order_and_collapses() {
        assert!(Error::join(Vec::new()).is_ok());

        let single = Error::join(vec![Error::internal("boom")]).unwrap_err();
        assert!(matches!(single, Error::Internal { .. }));

        let multi = Error::join(vec![
            Error::record_not_found("users", 1),
            Error::internal("second"),
        ])
        .unwrap_err();
        match multi {
            Error::Multiple(list) => {
                assert_eq!(list.0.len(), 2);
                assert!(list.0[0].is_not_found());
            }
            other => panic!("expected Multiple, got {other}"),
        }
    }

    #[test]
    fn not_found_detection() {
        assert!(Error::record_not_found("users", "x").is_not_found());
        assert!(!Error::internal("x").is_not_found());
    }
}
