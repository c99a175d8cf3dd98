//! Configuration errors.
//!
//! Everything here is a definition-time failure: nothing has been
//! provisioned when one of these is returned.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("unresolved variable ${{{0}}}")]
    UnresolvedVariable(String),

    #[error(transparent)]
    Definition(#[from] sitepipe_core::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for sitepipe_core::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Definition(inner) => inner,
            other => sitepipe_core::Error::InvalidDefinition(other.to_string()),
        }
    }
}
