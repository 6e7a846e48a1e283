// SPDX-License-Identifier: MIT

use durably_core::RunId;

/// Storage-layer error taxonomy (spec §4.B / §7).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("run not found: {0}")]
    NotFound(RunId),

    #[error("invalid transition for run {run_id}: {from} -> {attempted}")]
    InvalidTransition {
        run_id: RunId,
        from: String,
        attempted: &'static str,
    },

    #[error("idempotency key already in use for job {job_name:?}: {key:?}")]
    DuplicateIdempotencyKey { job_name: String, key: String },

    #[error("transient storage error: {0}")]
    Transient(#[source] sqlx::Error),

    #[error("data corruption: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Classify a raw `sqlx::Error`. A `UNIQUE constraint failed` on the
    /// idempotency index is a semantic duplicate, not a transient failure;
    /// everything else (locked database, I/O, pool exhaustion) is transient
    /// and safe to retry per spec §4.B / §7 `transient_storage`.
    pub fn from_sqlx(err: sqlx::Error, job_name: &str, key: &str) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return StorageError::DuplicateIdempotencyKey {
                    job_name: job_name.to_string(),
                    key: key.to_string(),
                };
            }
        }
        StorageError::Transient(err)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
