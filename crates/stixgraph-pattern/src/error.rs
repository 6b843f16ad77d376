//! Compile errors.

use thiserror::Error;

/// Errors raised while checking, tokenizing or compiling a pattern.
///
/// These are always surfaced to the caller synchronously.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("malformed expression: {0}")]
    MalformedExpression(String),

    #[error("pattern already contains type `{first}`, found `{second}`")]
    PatternAlreadyContainsType { first: String, second: String },

    #[error("pattern does not reference any object type")]
    UntypedPattern,

    #[error("field `{field}` can not be calculated by the `{modifier}` modifier: {reason}")]
    FieldCanNotBeCalculated {
        field: String,
        modifier: String,
        reason: String,
    },
}

impl PatternError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedExpression(message.into())
    }
}

pub type Result<T> = std::result::Result<T, PatternError>;
