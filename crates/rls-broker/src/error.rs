use std::fmt;

use thiserror::Error;

use crate::auth::AuthError;
use crate::broker::TxStage;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Database unreachable: {0}")]
    DatabaseUnreachable(String),

    #[error("Transaction failed during {stage}: {source}")]
    TransactionFailed { stage: TxStage, source: BoxError },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn transaction(stage: TxStage, source: impl Into<BoxError>) -> Self {
        Self::TransactionFailed {
            stage,
            source: source.into(),
        }
    }

    /// Stable taxonomy tag for logs and metrics.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Auth(e) => e.tag(),
            Self::PoolExhausted => "PoolExhausted",
            Self::DatabaseUnreachable(_) => "DatabaseUnreachable",
            Self::TransactionFailed { .. } => "TransactionFailed",
            Self::Cancelled => "Cancelled",
            Self::Config(_) => "Config",
        }
    }

    #[must_use]
    pub const fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    #[must_use]
    pub const fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted)
    }

    #[must_use]
    pub const fn is_database_unreachable(&self) -> bool {
        matches!(self, Self::DatabaseUnreachable(_))
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Stage at which the transaction failed, if it did.
    #[must_use]
    pub const fn stage(&self) -> Option<TxStage> {
        match self {
            Self::TransactionFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The caller's own error when work failed inside the transaction.
    pub fn work_error<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::TransactionFailed {
                stage: TxStage::Work,
                source,
            } => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// What a caller-facing surface may reveal.
    #[must_use]
    pub const fn public(&self) -> PublicError {
        match self {
            Self::Auth(_) => PublicError::AuthenticationFailed,
            Self::PoolExhausted | Self::DatabaseUnreachable(_) | Self::Cancelled => {
                PublicError::Unavailable
            }
            Self::TransactionFailed { .. } | Self::Config(_) => PublicError::Internal,
        }
    }
}

/// Coarse error shown to callers; which check failed stays in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicError {
    AuthenticationFailed,
    Unavailable,
    Internal,
}

impl fmt::Display for PublicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AuthenticationFailed => "authentication failed",
            Self::Unavailable => "service unavailable",
            Self::Internal => "internal error",
        })
    }
}

impl From<&Error> for PublicError {
    fn from(err: &Error) -> Self {
        err.public()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
