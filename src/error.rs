//! Unified error handling for the lanesync crate
//!
//! Domain errors stay in their modules ([`StoreError`], [`StageError`],
//! [`ConfigError`], [`ChannelError`]); [`Error`] wraps them for use across
//! module boundaries.
//!
//! - [`LanesyncErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors

use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::coordination::StoreError;
pub use crate::notifications::channels::ChannelError;
pub use crate::pipeline::StageError;

/// Common trait for lanesync error types
pub trait LanesyncErrorTrait: std::error::Error {
    /// Check if this error resolves itself on a later cycle
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Coordination store access and conditional writes
    Coordination,
    /// Node identity conflicts
    Registration,
    /// Stage execution
    Pipeline,
    /// Configuration and validation
    Config,
    /// Alarm delivery
    Delivery,
    /// Payload encoding
    Serialization,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordination => "coordination",
            Self::Registration => "registration",
            Self::Pipeline => "pipeline",
            Self::Config => "config",
            Self::Delivery => "delivery",
            Self::Serialization => "serialization",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unified error type for the lanesync crate
#[derive(Error, Debug)]
pub enum Error {
    /// Coordination store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The node identity is held by another live node
    #[error("node already registered: {node_id} is held by {holder}")]
    NodeAlreadyRegistered { node_id: String, holder: String },

    /// A version-checked write kept losing the race
    #[error("version conflict on {path} after {attempts} attempts")]
    VersionConflict { path: String, attempts: u32 },

    /// Stage execution errors
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Alarm channel errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl LanesyncErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_recoverable(),
            Self::NodeAlreadyRegistered { .. } => false,
            Self::VersionConflict { .. } => true,
            Self::Stage(e) => !e.is_stop_trigger(),
            Self::Config(_) => false,
            Self::Channel(_) => true,
            Self::Json(_) => false,
            Self::Io(_) => true,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Store(_) | Self::VersionConflict { .. } => ErrorCategory::Coordination,
            Self::NodeAlreadyRegistered { .. } => ErrorCategory::Registration,
            Self::Stage(_) => ErrorCategory::Pipeline,
            Self::Config(_) => ErrorCategory::Config,
            Self::Channel(_) => ErrorCategory::Delivery,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Io(_) | Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: format!("{err:#}"),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
