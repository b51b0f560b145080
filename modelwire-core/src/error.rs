use std::fmt;
use std::path::PathBuf;

use serde_json::Value;

/// Result alias used throughout the core pipeline.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Boxed error carried out of user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Everything that can go wrong while building, training, persisting or
/// serving a model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("no model configuration is bound to the current scope")]
    ConfigurationNotBound,

    #[error("model '{model}' is missing its {missing} callback")]
    IncompleteConfig { model: String, missing: &'static str },

    #[error("model '{model}' has no {slot} cache cell configured")]
    CacheNotConfigured { model: String, slot: CacheSlot },

    #[error("model file not found: {}", path.display())]
    ModelNotFound { path: PathBuf },

    #[error("model '{name}' must be primed before it can classify")]
    ModelNotPrimed { name: String },

    #[error("model '{model}' has no single-instance feature generator")]
    NoFeatureGenerator { model: String },

    #[error("model '{model}' has no feature set generator")]
    NoFeatureSetGenerator { model: String },

    #[error("cannot coerce {value} into attribute '{attribute}'")]
    FeatureCoercion {
        attribute: String,
        value: Value,
        #[source]
        cause: CoercionFailure,
    },

    #[error("attribute '{attribute}' requires a value")]
    MissingValue { attribute: String },

    #[error("instance schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("label '{label}' is not a known class label")]
    UnknownLabel { label: String },

    #[error("feature set group '{group}' is not defined for model '{model}'")]
    UnknownFeatureSetGroup { model: String, group: String },

    #[error("{stage} callback failed")]
    Callback {
        stage: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("classifier engine '{engine}' failed: {message}")]
    Engine { engine: String, message: String },

    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize {}", path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write CSV {}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl ModelError {
    pub(crate) fn callback(stage: &'static str, err: anyhow::Error) -> Self {
        Self::Callback {
            stage,
            source: err.into(),
        }
    }

    pub(crate) fn engine(engine: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Engine {
            engine: engine.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a raw feature value could not be stored in an attribute.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoercionFailure {
    #[error("expected a finite number")]
    NotNumeric,

    #[error("'{value}' is not one of {allowed:?}")]
    NotInDomain { value: String, allowed: Vec<String> },

    #[error("{0} values cannot be stored in an attribute")]
    UnsupportedShape(&'static str),
}

/// The two independently cached instance sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSlot {
    CrossFold,
    TrainTest,
}

impl fmt::Display for CacheSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CrossFold => f.write_str("cross-fold"),
            Self::TrainTest => f.write_str("train/test"),
        }
    }
}
