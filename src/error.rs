use thiserror::Error;

/// Failures reported by a [`Store`](crate::Store) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The object changed since it was read (or already exists on create).
    #[error("conflict on {0}")]
    Conflict(String),

    /// The store rejected the object as structurally invalid.
    #[error("invalid object: {0}")]
    Invalid(String),

    /// Network blips, timeouts, throttling and anything else worth retrying.
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the same request may succeed if simply tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Transient(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors raised while constructing a [`Workflow`](crate::Workflow).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("node {0} is declared twice")]
    DuplicateNode(String),

    #[error("nodes {first} and {second} both own {kind} objects with suffix {suffix:?}")]
    DuplicateName {
        first: String,
        second: String,
        kind: String,
        suffix: String,
    },

    #[error("node {node} depends on {dependency}, which is not declared before it")]
    UnknownDependency { node: String, dependency: String },

    #[error("no predicate registered as {0}")]
    UnknownPredicate(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("workflow error: {0}")]
    Graph(#[from] GraphError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("template error: {0}")]
    Template(#[from] serde_yaml::Error),

    #[error("{0} has no {1}")]
    MissingMetadata(String, &'static str),
}

/// A template produced an object that cannot be applied as-is. Only a
/// change to the primary's spec clears it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct InvalidDesiredState(pub String);
