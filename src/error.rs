//! Error types for the statistics core.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("invalid value: {0}")]
    Invalid(String),

    #[error("site {0} not found")]
    SiteNotFound(i64),

    #[error("unknown stats table: {0}")]
    UnknownTable(String),

    /// Failure in one of the rollup aggregators, with the site it ran for.
    #[error("site {site}: {table}: {source}")]
    Aggregate {
        site: i64,
        table: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub(crate) fn aggregate(site: i64, table: &'static str, source: Error) -> Self {
        Self::Aggregate {
            site,
            table,
            source: Box::new(source),
        }
    }

    /// Whether this error comes from the store and is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            Self::Aggregate { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}
