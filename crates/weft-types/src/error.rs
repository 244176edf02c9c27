use thiserror::Error;

/// Errors from repository operations (used by trait definitions in weft-core).
///
/// The engine treats repository failures during execution-state updates as
/// fatal: losing the ability to record state risks silent data loss.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");

        let err = RepositoryError::Conflict("duplicate id".to_string());
        assert!(err.to_string().contains("duplicate id"));
    }
}
