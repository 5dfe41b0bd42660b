use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::ProjectId;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Coarse classification surfaced to callers alongside the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authorization,
    NotFound,
    Structural,
    Transient,
    Terminal,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("user '{actor}' does not own project {project_id}")]
    Forbidden { actor: String, project_id: ProjectId },

    #[error("tree depth exceeds the limit of {limit}")]
    DepthExceeded { limit: usize },

    #[error("batch of {size} items exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("deadlock detected: {0}")]
    Deadlock(String),

    #[error("lock wait timeout: {0}")]
    LockTimeout(String),

    #[error("transaction '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::Forbidden { .. } => ErrorKind::Authorization,
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::DepthExceeded { .. }
            | StoreError::BatchTooLarge { .. }
            | StoreError::Constraint(_)
            | StoreError::Integrity(_) => ErrorKind::Structural,
            StoreError::Deadlock(_) | StoreError::LockTimeout(_) | StoreError::Timeout { .. } => {
                ErrorKind::Transient
            }
            StoreError::Database(_) | StoreError::Migration(_) | StoreError::Internal(_) => {
                ErrorKind::Terminal
            }
        }
    }

    /// Failures that invalidate the whole transaction and warrant a fresh attempt
    pub fn is_deadlock(&self) -> bool {
        matches!(self, StoreError::Deadlock(_) | StoreError::LockTimeout(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            let message = db.message().to_string();
            match db.code().as_deref() {
                // deadlock_detected, serialization_failure
                Some("40P01") | Some("40001") => return StoreError::Deadlock(message),
                // lock_not_available
                Some("55P03") => return StoreError::LockTimeout(message),
                // integrity_constraint_violation class
                Some(code) if code.starts_with("23") => return StoreError::Constraint(message),
                _ => {}
            }
        }
        StoreError::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            StoreError::Validation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            StoreError::Forbidden {
                actor: "u".into(),
                project_id: 1
            }
            .kind(),
            ErrorKind::Authorization
        );
        assert_eq!(
            StoreError::DepthExceeded { limit: 100 }.kind(),
            ErrorKind::Structural
        );
        assert_eq!(
            StoreError::Deadlock("x".into()).kind(),
            ErrorKind::Transient
        );
        assert!(StoreError::LockTimeout("x".into()).is_deadlock());
        assert!(!StoreError::Constraint("x".into()).is_deadlock());
        assert_eq!(
            StoreError::not_found("element", 7).to_string(),
            "element 7 not found"
        );
    }
}
