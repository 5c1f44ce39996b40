use std::time::Duration;

/// Errors raised by [`crate::VectorIndex`] backends.
#[derive(Debug, thiserror::Error)]
pub enum VectorIndexError {
    #[error("dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("filterable metadata is {size} bytes, backend limit is {limit}")]
    FilterableMetadataTooLarge { size: usize, limit: usize },

    #[error("record needs {count} metadata keys, backend limit is {limit}")]
    TooManyMetadataKeys { count: usize, limit: usize },

    #[error("field `{0}` is not filterable on this backend")]
    NonFilterableField(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("index is not configured; call configure() first")]
    NotConfigured,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("collection error: {0}")]
    Collection(String),

    #[error("upsert error: {0}")]
    Upsert(String),

    #[error("search error: {0}")]
    Search(String),

    #[error("delete error: {0}")]
    Delete(String),

    #[error("count error: {0}")]
    Count(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database error: {0}")]
    Sqlite(sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for VectorIndexError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(e.to_string()),
            other => Self::Sqlite(other),
        }
    }
}

impl VectorIndexError {
    /// Whether repeating the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, VectorIndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_map_to_connection() {
        let err = VectorIndexError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, VectorIndexError::Connection(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn row_errors_stay_database_errors() {
        let err = VectorIndexError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, VectorIndexError::Sqlite(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn messages_name_the_limit() {
        let msg = VectorIndexError::FilterableMetadataTooLarge {
            size: 4000,
            limit: 2048,
        }
        .to_string();
        assert!(msg.contains("4000"));
        assert!(msg.contains("2048"));
    }
}
