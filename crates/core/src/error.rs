//! Domain error model.

use thiserror::Error;

/// Failure reading or decoding serialized job data.
///
/// Accessors never silently default: a missing key or a value of the wrong
/// type is always reported.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataError {
    /// The requested key is not present.
    #[error("missing key: {0}")]
    MissingKey(String),

    /// The key is present but holds a value of another type.
    #[error("type mismatch for key '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// The textual encoding could not be produced or parsed.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl DataError {
    pub fn missing(key: impl Into<String>) -> Self {
        Self::MissingKey(key.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }
}

/// Failure registering or instantiating a job factory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FactoryError {
    /// A factory for this key was already registered.
    #[error("duplicate factory registration for key '{0}'")]
    DuplicateFactory(String),

    /// No factory is registered for this key (version skew or corrupted record).
    #[error("no factory registered for key '{0}'")]
    MissingFactory(String),

    /// The factory rejected the persisted data.
    #[error("factory '{factory_key}' could not reconstruct job: {source}")]
    Reconstruct {
        factory_key: String,
        #[source]
        source: DataError,
    },
}

impl FactoryError {
    /// The factory key the error refers to.
    pub fn factory_key(&self) -> &str {
        match self {
            FactoryError::DuplicateFactory(key) | FactoryError::MissingFactory(key) => key,
            FactoryError::Reconstruct { factory_key, .. } => factory_key,
        }
    }
}
